//! Real-time ETW consumer on top of the raw Win32 tracing and TDH APIs.

mod decode;
mod session;

pub use session::EtwSession;

// Status codes from winerror.h used by the session and decoder.
const ERROR_SUCCESS: u32 = 0;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_ALREADY_EXISTS: u32 = 183;
const ERROR_MORE_DATA: u32 = 234;
const ERROR_CANCELLED: u32 = 1223;
const ERROR_WMI_INSTANCE_NOT_FOUND: u32 = 4201;
const ERROR_EVT_INVALID_EVENT_DATA: u32 = 15005;

/// NUL-terminated UTF-16 copy of `s`.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

/// Decode UTF-16 up to the first NUL.
fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

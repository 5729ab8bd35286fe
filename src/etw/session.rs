use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Diagnostics::Etw::{
    CloseTrace, ControlTraceW, EnableTraceEx2, OpenTraceW, ProcessTrace, StartTraceW,
    CONTROLTRACE_HANDLE, EVENT_RECORD, EVENT_TRACE_LOGFILEW, EVENT_TRACE_PROPERTIES,
    PROCESSTRACE_HANDLE,
};

use super::decode::decode_event;
use super::{
    to_wide, ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_MORE_DATA, ERROR_SUCCESS,
    ERROR_WMI_INSTANCE_NOT_FOUND,
};
use crate::event::DecodedEvent;
use crate::guid::ProviderGuid;
use crate::session::{LogFileMode, SessionConfig, SessionError, TraceSession};

// evntrace.h / evntprov.h values.
const WNODE_FLAG_TRACED_GUID: u32 = 0x0002_0000;
const EVENT_TRACE_CONTROL_STOP: u32 = 1;
const EVENT_TRACE_CONTROL_FLUSH: u32 = 3;
const EVENT_CONTROL_CODE_DISABLE_PROVIDER: u32 = 0;
const EVENT_CONTROL_CODE_ENABLE_PROVIDER: u32 = 1;
const PROCESS_TRACE_MODE_REAL_TIME: u32 = 0x0000_0100;
const PROCESS_TRACE_MODE_EVENT_RECORD: u32 = 0x1000_0000;
const INVALID_PROCESSTRACE_HANDLE: u64 = u64::MAX;

/// Session names are limited to 1024 characters by ETW.
const MAX_SESSION_NAME: usize = 1024;
/// Bytes reserved after the properties for the logger and log file names.
const NAME_SPACE_BYTES: usize = (MAX_SESSION_NAME + 1) * 2;

/// `EVENT_TRACE_PROPERTIES` followed by space for the names ETW writes back.
struct TraceProperties {
    buf: Vec<u64>,
}

impl TraceProperties {
    fn new(config: &SessionConfig) -> Self {
        let header = mem::size_of::<EVENT_TRACE_PROPERTIES>();
        let total = header + 2 * NAME_SPACE_BYTES;
        let mut buf = vec![0u64; total.div_ceil(8)];

        // SAFETY: buf is zeroed, 8-byte aligned and large enough for the
        // properties struct, and all-zero is a valid EVENT_TRACE_PROPERTIES.
        let props = unsafe { &mut *(buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES) };
        props.Wnode.BufferSize = total as u32;
        props.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        // QueryPerformanceCounter clock.
        props.Wnode.ClientContext = 1;
        props.BufferSize = config.buffer_size_kb;
        props.MinimumBuffers = config.minimum_buffers;
        props.LogFileMode = (LogFileMode::REAL_TIME | config.log_file_mode).bits();
        props.LoggerNameOffset = header as u32;
        props.LogFileNameOffset = 0;

        TraceProperties { buf }
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES
    }
}

fn native_guid(guid: &ProviderGuid) -> GUID {
    let (data1, data2, data3, data4) = guid.fields();
    GUID {
        data1,
        data2,
        data3,
        data4,
    }
}

fn control_handle(value: u64) -> CONTROLTRACE_HANDLE {
    CONTROLTRACE_HANDLE { Value: value }
}

fn start_trace(name: &[u16], config: &SessionConfig) -> Result<CONTROLTRACE_HANDLE, u32> {
    let mut props = TraceProperties::new(config);
    let mut handle = control_handle(0);
    let status = unsafe { StartTraceW(&mut handle, name.as_ptr(), props.as_mut_ptr()) };
    if status == ERROR_SUCCESS {
        Ok(handle)
    } else {
        Err(status)
    }
}

fn control_trace(
    handle: CONTROLTRACE_HANDLE,
    name: &[u16],
    config: &SessionConfig,
    code: u32,
) -> u32 {
    let mut props = TraceProperties::new(config);
    unsafe { ControlTraceW(handle, name.as_ptr(), props.as_mut_ptr(), code) }
}

fn enable_provider(
    handle: CONTROLTRACE_HANDLE,
    provider: &GUID,
    code: u32,
    config: &SessionConfig,
) -> u32 {
    unsafe {
        EnableTraceEx2(
            handle,
            provider,
            code,
            config.level,
            config.match_any_keyword,
            0,
            0,
            ptr::null(),
        )
    }
}

/// A real-time ETW session with a single enabled provider.
pub struct EtwSession {
    name: Vec<u16>,
    display_name: String,
    config: SessionConfig,
    provider: ProviderGuid,
    handle: CONTROLTRACE_HANDLE,
    // Serializes flush and close so a flush never races the stop.
    control: Mutex<()>,
    closed: AtomicBool,
}

impl EtwSession {
    /// Start the session and enable `provider` on it.
    ///
    /// A leftover session with the same name, usually from a run that was
    /// killed before it could clean up, is stopped and the start retried.
    pub fn open(provider: &ProviderGuid, config: &SessionConfig) -> Result<Self, SessionError> {
        if config.name.is_empty()
            || config.name.len() > MAX_SESSION_NAME
            || config.name.contains('\0')
        {
            return Err(SessionError::InvalidName(config.name.clone()));
        }
        let name = to_wide(&config.name);

        let handle = match start_trace(&name, config) {
            Ok(handle) => handle,
            Err(ERROR_ALREADY_EXISTS) => {
                tracing::warn!("Session {:?} already exists, stopping it", config.name);
                let status = control_trace(control_handle(0), &name, config, EVENT_TRACE_CONTROL_STOP);
                if !matches!(status, ERROR_SUCCESS | ERROR_MORE_DATA) {
                    return Err(SessionError::Close(status));
                }
                start_trace(&name, config).map_err(|status| SessionError::Start {
                    name: config.name.clone(),
                    status,
                })?
            }
            Err(status) => {
                return Err(SessionError::Start {
                    name: config.name.clone(),
                    status,
                })
            }
        };

        let status = enable_provider(
            handle,
            &native_guid(provider),
            EVENT_CONTROL_CODE_ENABLE_PROVIDER,
            config,
        );
        if status != ERROR_SUCCESS {
            let _ = control_trace(handle, &name, config, EVENT_TRACE_CONTROL_STOP);
            return Err(SessionError::EnableProvider {
                provider: *provider,
                status,
            });
        }

        tracing::debug!(
            "Started session {:?} (buffer {} KB, min buffers {}, mode {:?})",
            config.name,
            config.buffer_size_kb,
            config.minimum_buffers,
            config.log_file_mode
        );

        Ok(EtwSession {
            name,
            display_name: config.name.clone(),
            config: config.clone(),
            provider: *provider,
            handle,
            control: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

struct CallbackContext<'a> {
    provider: ProviderGuid,
    deliver: &'a mut dyn FnMut(DecodedEvent),
}

unsafe extern "system" fn event_record_callback(record: *mut EVENT_RECORD) {
    let Some(record) = record.as_ref() else {
        return;
    };
    let context = record.UserContext as *mut CallbackContext;
    let Some(context) = context.as_mut() else {
        return;
    };

    // The session also delivers its own trace header events.
    let p = &record.EventHeader.ProviderId;
    if ProviderGuid::from_fields(p.data1, p.data2, p.data3, p.data4) != context.provider {
        return;
    }
    (context.deliver)(decode_event(record));
}

impl TraceSession for EtwSession {
    fn flush(&self) -> Result<(), SessionError> {
        let _guard = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        match control_trace(self.handle, &self.name, &self.config, EVENT_TRACE_CONTROL_FLUSH) {
            ERROR_SUCCESS | ERROR_MORE_DATA => Ok(()),
            status => Err(SessionError::Flush(status)),
        }
    }

    fn process(&self, deliver: &mut dyn FnMut(DecodedEvent)) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let mut context = CallbackContext {
            provider: self.provider,
            deliver,
        };
        let mut logger_name = self.name.clone();

        // SAFETY: all-zero is a valid EVENT_TRACE_LOGFILEW; the name buffer
        // and the context outlive ProcessTrace, which is the only place the
        // callback runs.
        let mut logfile: EVENT_TRACE_LOGFILEW = unsafe { mem::zeroed() };
        logfile.LoggerName = logger_name.as_mut_ptr();
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(event_record_callback);
        logfile.Context = &mut context as *mut CallbackContext as *mut c_void;

        let handle: PROCESSTRACE_HANDLE = unsafe { OpenTraceW(&mut logfile) };
        if handle.Value == INVALID_PROCESSTRACE_HANDLE {
            return Err(SessionError::OpenTrace(unsafe { GetLastError() }));
        }

        tracing::debug!("Processing session {:?}", self.display_name);
        let status = unsafe { ProcessTrace(&handle, 1, ptr::null(), ptr::null()) };
        unsafe { CloseTrace(handle) };

        match status {
            ERROR_SUCCESS | ERROR_CANCELLED => Ok(()),
            status => Err(SessionError::Process(status)),
        }
    }

    fn close(&self) -> Result<(), SessionError> {
        let _guard = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let status = enable_provider(
            self.handle,
            &native_guid(&self.provider),
            EVENT_CONTROL_CODE_DISABLE_PROVIDER,
            &self.config,
        );
        if status != ERROR_SUCCESS {
            tracing::debug!("Disabling provider {} returned {status}", self.provider);
        }

        match control_trace(self.handle, &self.name, &self.config, EVENT_TRACE_CONTROL_STOP) {
            ERROR_SUCCESS | ERROR_MORE_DATA | ERROR_WMI_INSTANCE_NOT_FOUND => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            }
            status => Err(SessionError::Close(status)),
        }
    }
}

impl Drop for EtwSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Session {:?} left running: {e}", self.display_name);
        }
    }
}

//! The trace session seam.
//!
//! Everything above this module is platform neutral and only knows about the
//! [`TraceSession`] trait. The Windows backend lives in [`crate::etw`]; tests
//! drive the pipeline with scripted sessions.

use bitflags::bitflags;
use thiserror::Error;

use crate::event::DecodedEvent;
use crate::guid::ProviderGuid;

/// Default session name. A stale session left behind by a crashed run under
/// the same name is stopped and replaced on open.
pub const DEFAULT_SESSION_NAME: &str = "etw-tracer-session";

/// Verbose, the highest ETW trace level.
pub const TRACE_LEVEL_VERBOSE: u8 = 5;

bitflags! {
    /// Extra `LogFileMode` bits ORed into the session properties. Real-time
    /// mode is always set by the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogFileMode: u32 {
        const SEQUENTIAL = 0x0000_0001;
        const CIRCULAR = 0x0000_0002;
        const REAL_TIME = 0x0000_0100;
        const SYSTEM_LOGGER = 0x0200_0000;
        const NO_PER_PROCESSOR_BUFFERING = 0x1000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub name: String,
    /// Per-buffer size in kilobytes.
    pub buffer_size_kb: u32,
    pub minimum_buffers: u32,
    pub log_file_mode: LogFileMode,
    pub level: u8,
    /// Match-any keyword mask passed when enabling the provider.
    pub match_any_keyword: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name: DEFAULT_SESSION_NAME.to_string(),
            buffer_size_kb: 4,
            minimum_buffers: 2,
            log_file_mode: LogFileMode::NO_PER_PROCESSOR_BUFFERING,
            level: TRACE_LEVEL_VERBOSE,
            match_any_keyword: u64::MAX,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start session {name}: status {status}")]
    Start { name: String, status: u32 },
    #[error("failed to enable provider {provider}: status {status}")]
    EnableProvider { provider: ProviderGuid, status: u32 },
    #[error("failed to open trace for processing: status {0}")]
    OpenTrace(u32),
    #[error("failed to flush session: status {0}")]
    Flush(u32),
    #[error("event processing failed: status {0}")]
    Process(u32),
    #[error("failed to stop session: status {0}")]
    Close(u32),
    #[error("session is closed")]
    Closed,
    #[error("session name {0:?} is invalid")]
    InvalidName(String),
    #[error("ETW sessions are not supported on this platform")]
    Unsupported,
}

/// An open trace session bound to one provider.
///
/// `flush` and `close` may be called from other threads while `process` is
/// blocked; implementations provide whatever synchronization that needs.
pub trait TraceSession: Send + Sync {
    /// Ask the session to hand over buffered events now.
    fn flush(&self) -> Result<(), SessionError>;

    /// Block delivering decoded events, in arrival order, until the session
    /// is closed or fails.
    fn process(&self, deliver: &mut dyn FnMut(DecodedEvent)) -> Result<(), SessionError>;

    /// Stop the session and unblock `process`. Safe to call again after a
    /// failure; a no-op once it has succeeded.
    fn close(&self) -> Result<(), SessionError>;
}

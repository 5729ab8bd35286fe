//! etw-tracer library - the capture pipeline behind the `etw-tracer` binary.
//!
//! The binary captures the events of one ETW provider and prints each one as
//! a JSON object. Everything except the [`etw`] backend is platform neutral
//! and talks to the session through the [`TraceSession`] trait.
//!
//! # Modules
//!
//! - [`capture`] - session lifecycle, worker threads and shutdown
//! - [`dispatch`] - event filtering and JSON output
//! - [`flush`] - periodic session flushing
//! - [`session`] - the session trait and its configuration
//! - [`etw`] - the Windows session backend
//!
//! # Example
//!
//! ```no_run
//! use etw_tracer::{capture, Config, ProviderGuid, ShutdownSignal};
//!
//! # #[cfg(windows)]
//! # fn main() -> anyhow::Result<()> {
//! let config = Config {
//!     provider: ProviderGuid::parse("{22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716}")?,
//!     ..Default::default()
//! };
//! let shutdown = ShutdownSignal::new();
//! let trigger = shutdown.trigger();
//! ctrlc::set_handler(move || trigger.interrupt())?;
//!
//! let report = capture(&config, etw_tracer::etw::EtwSession::open, shutdown, std::io::stdout())?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod capture;
pub mod dispatch;
#[cfg(windows)]
pub mod etw;
pub mod event;
pub mod flush;
pub mod guid;
pub mod session;
pub mod shutdown;

#[cfg(test)]
mod test_utils;

// Re-export for convenience
pub use capture::{capture, CaptureReport, Config, LifecycleState, Outcome};
pub use dispatch::{DispatchOptions, DispatchStats, Dispatcher};
pub use event::{DecodeError, DecodedEvent, EventHeader, Properties, PropertyValue};
pub use guid::{GuidError, ProviderGuid};
pub use session::{LogFileMode, SessionConfig, SessionError, TraceSession};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, Signal};

//! Periodic session flushing.
//!
//! ETW only hands real-time buffers to the consumer when they fill up or when
//! the session's flush timer fires, which is about a second by default. For an
//! interactive tool that is too slow, so a background thread forces a flush on
//! a short fixed interval.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::session::{SessionError, TraceSession};

/// Interval between forced flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub attempts: u64,
    pub failures: u64,
}

/// Flush `session` every `interval` until `stop` fires or its sender is
/// dropped.
///
/// A failed flush is logged and the next tick flushes again at the same
/// interval; there is no backoff and no failure count that ends the loop.
/// The ticker also stops once the session reports it is closed.
pub fn run_flush_ticker<S>(session: &S, interval: Duration, stop: &Receiver<()>) -> FlushStats
where
    S: TraceSession + ?Sized,
{
    let mut stats = FlushStats::default();

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        stats.attempts += 1;
        match session.flush() {
            Ok(()) => {}
            Err(SessionError::Closed) => {
                tracing::debug!("Session closed, stopping flushes");
                break;
            }
            Err(e) => {
                stats.failures += 1;
                tracing::warn!("Failed to flush events: {e}");
            }
        }
    }

    tracing::debug!(
        "Flush ticker stopped after {} flushes ({} failed)",
        stats.attempts,
        stats.failures
    );
    stats
}

//! Capture lifecycle: open the session, run the workers, shut down on signal.
//!
//! Three workers run next to the controller:
//!
//! - `flush_ticker` forces the session to hand over buffered events.
//! - `capture` blocks inside [`TraceSession::process`] and queues every
//!   decoded event.
//! - `dispatcher` drains the queue in order and writes the output records.
//!
//! The controller waits for a [`Signal`], closes the session, and retries
//! the close on the next signal if it fails. Flushes and closes go through a
//! shared gate, so no flush reaches the session once a close has succeeded.
//! The controller only returns once every worker has been joined, so the
//! session is never touched after it has been dropped.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, SyncSender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::dispatch::{DispatchOptions, DispatchStats, Dispatcher};
use crate::event::DecodedEvent;
use crate::flush::{run_flush_ticker, FlushStats, DEFAULT_FLUSH_INTERVAL};
use crate::guid::ProviderGuid;
use crate::session::{SessionConfig, SessionError, TraceSession};
use crate::shutdown::{ShutdownSignal, ShutdownTrigger, Signal};

/// Decoded events buffered between the capture loop and the dispatcher
/// before the capture callback starts blocking.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Runtime options for one capture, separated from the CLI parsing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider to capture
    pub provider: ProviderGuid,
    /// Session properties
    pub session: SessionConfig,
    /// Output shaping and filtering
    pub dispatch: DispatchOptions,
    /// Interval between forced flushes
    pub flush_interval: Duration,
    /// Capacity of the capture → dispatcher queue
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: ProviderGuid::from_bytes([0; 16]),
            session: SessionConfig::default(),
            dispatch: DispatchOptions::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    ClosePending,
    CloseFailed,
    Closed,
}

/// Why the capture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Shut down on request.
    Interrupted,
    /// Event processing failed before anyone asked it to stop.
    CaptureFailed(String),
    /// The session stopped delivering events on its own, e.g. it was
    /// stopped by another controller.
    SessionEnded,
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub outcome: Outcome,
    pub final_state: LifecycleState,
    pub close_attempts: u32,
    pub flush: FlushStats,
    pub dispatch: DispatchStats,
}

/// Serializes flushes against closes. Once a close succeeds every later
/// flush fails with [`SessionError::Closed`] without reaching the session.
struct CloseGate<'a, S: ?Sized> {
    session: &'a S,
    closed: Mutex<bool>,
}

impl<'a, S: TraceSession + ?Sized> CloseGate<'a, S> {
    fn new(session: &'a S) -> Self {
        CloseGate {
            session,
            closed: Mutex::new(false),
        }
    }
}

impl<S: TraceSession + ?Sized> TraceSession for CloseGate<'_, S> {
    fn flush(&self) -> Result<(), SessionError> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(SessionError::Closed);
        }
        self.session.flush()
    }

    fn process(&self, deliver: &mut dyn FnMut(DecodedEvent)) -> Result<(), SessionError> {
        self.session.process(deliver)
    }

    fn close(&self) -> Result<(), SessionError> {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if !*closed {
            self.session.close()?;
            *closed = true;
        }
        Ok(())
    }
}

fn set_state(state: &mut LifecycleState, next: LifecycleState) {
    tracing::debug!("Session state {:?} -> {:?}", *state, next);
    *state = next;
}

/// Open a session with `open` and capture until `shutdown` fires and the
/// session has been closed.
///
/// Failing to open the session is the only error returned before any worker
/// starts. Every other failure is logged and reflected in the report.
pub fn capture<S, O, W>(
    config: &Config,
    open: O,
    shutdown: ShutdownSignal,
    out: W,
) -> Result<CaptureReport>
where
    S: TraceSession,
    O: FnOnce(&ProviderGuid, &SessionConfig) -> Result<S, SessionError>,
    W: Write + Send,
{
    let mut state = LifecycleState::Created;
    let session = open(&config.provider, &config.session).with_context(|| {
        format!(
            "Failed to create ETW session {:?} for provider {}",
            config.session.name, config.provider
        )
    })?;
    set_state(&mut state, LifecycleState::Running);

    // Workers log through whatever subscriber the caller is running under.
    let log_dispatch = tracing::dispatcher::get_default(|d| d.clone());
    let closing = AtomicBool::new(false);
    let trigger = shutdown.trigger();

    let gate = CloseGate::new(&session);
    let session = &gate;
    let log_dispatch = &log_dispatch;
    let closing = &closing;
    let provider = config.provider;
    let interval = config.flush_interval;
    let options = config.dispatch;

    thread::scope(|s| -> Result<CaptureReport> {
        let (stop_tx, stop_rx) = channel::<()>();
        let (event_tx, event_rx) = sync_channel(config.queue_capacity.max(1));

        let ticker = thread::Builder::new()
            .name("flush_ticker".to_string())
            .spawn_scoped(s, move || {
                tracing::dispatcher::with_default(log_dispatch, || {
                    run_flush_ticker(session, interval, &stop_rx)
                })
            })?;

        let dispatcher = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn_scoped(s, move || {
                tracing::dispatcher::with_default(log_dispatch, || {
                    Dispatcher::new(options, out).run(event_rx)
                })
            })?;

        let capture = thread::Builder::new()
            .name("capture".to_string())
            .spawn_scoped(s, move || {
                tracing::dispatcher::with_default(log_dispatch, || {
                    capture_loop(session, provider, event_tx, closing, &trigger)
                })
            })?;

        let close_attempts = close_on_signal(session, &shutdown, closing, &mut state);

        // The session is closed, stop flushing it before waiting on the
        // capture loop to unwind.
        let _ = stop_tx.send(());
        let flush = ticker
            .join()
            .map_err(|_| anyhow!("Flush ticker thread panicked"))?;

        let outcome = capture
            .join()
            .map_err(|_| anyhow!("Capture thread panicked"))?;
        set_state(&mut state, LifecycleState::Closed);

        let dispatch = dispatcher
            .join()
            .map_err(|_| anyhow!("Dispatcher thread panicked"))?;

        Ok(CaptureReport {
            outcome,
            final_state: state,
            close_attempts,
            flush,
            dispatch,
        })
    })
}

/// Wait for signals and close the session, retrying on every later signal
/// until a close succeeds. Returns the number of close attempts.
fn close_on_signal<S>(
    session: &S,
    shutdown: &ShutdownSignal,
    closing: &AtomicBool,
    state: &mut LifecycleState,
) -> u32
where
    S: TraceSession + ?Sized,
{
    let mut attempts = 0;

    loop {
        match shutdown.wait() {
            Signal::Interrupt => tracing::info!("Shutting the session down"),
            Signal::CaptureEnded => {
                tracing::warn!("Capture loop is gone, shutting the session down")
            }
        }

        closing.store(true, Ordering::SeqCst);
        set_state(state, LifecycleState::ClosePending);
        attempts += 1;
        match session.close() {
            Ok(()) => break,
            Err(e) => {
                set_state(state, LifecycleState::CloseFailed);
                tracing::error!(
                    "Failed to stop session (attempt {attempts}), interrupt again to retry: {e}"
                );
            }
        }
    }

    attempts
}

/// Body of the capture thread. Returns how the capture ended.
fn capture_loop<S>(
    session: &S,
    provider: ProviderGuid,
    events: SyncSender<DecodedEvent>,
    closing: &AtomicBool,
    trigger: &ShutdownTrigger,
) -> Outcome
where
    S: TraceSession + ?Sized,
{
    tracing::info!("Starting to listen ETW events from {provider}");

    let mut receiver_gone = false;
    let result = session.process(&mut |event| {
        if events.send(event).is_err() && !receiver_gone {
            receiver_gone = true;
            tracing::warn!("Dispatcher exited, dropping further events");
        }
    });
    // Let the dispatcher drain and exit.
    drop(events);

    if closing.load(Ordering::SeqCst) {
        match result {
            Ok(()) => tracing::info!("Successfully shut down"),
            Err(e) => tracing::warn!("Event processing returned an error while closing: {e}"),
        }
        return Outcome::Interrupted;
    }

    let outcome = match result {
        Err(e) => {
            tracing::error!("Got error processing events: {e}");
            Outcome::CaptureFailed(e.to_string())
        }
        Ok(()) => Outcome::SessionEnded,
    };
    tracing::error!("Capture stopped unexpectedly, no further events will be reported");
    trigger.raise(Signal::CaptureEnded);
    outcome
}

//! Common test utilities for etw-tracer integration tests.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use serde_json::Value;

use etw_tracer::event::EventDescriptor;
use etw_tracer::{
    DecodeError, DecodedEvent, EventHeader, Properties, ProviderGuid, SessionConfig,
    SessionError, TraceSession,
};

pub const PROVIDER: &str = "{00000000-0000-0000-0000-000000000001}";

pub fn provider() -> ProviderGuid {
    ProviderGuid::parse(PROVIDER).unwrap()
}

pub fn event(id: u16) -> DecodedEvent {
    let mut props = Properties::new();
    props.push("Seq", id.to_string());
    DecodedEvent {
        header: EventHeader {
            descriptor: EventDescriptor {
                id,
                level: 4,
                ..Default::default()
            },
            thread_id: 100,
            process_id: 200,
            time_stamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            provider_id: provider(),
            activity_id: ProviderGuid::from_bytes([0; 16]),
            flags: 0,
            kernel_time: 0,
            user_time: 0,
            processor_time: 0,
        },
        properties: Ok(props),
    }
}

pub fn undecodable_event(id: u16) -> DecodedEvent {
    DecodedEvent {
        properties: Err(DecodeError::MissingSchema(1168)),
        ..event(id)
    }
}

/// How a scripted session's `process` call ends once its events are out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    /// Block until the session is closed, like a healthy real-time session.
    UntilClosed,
    /// Return an error right away.
    Fail(u32),
    /// Return successfully right away.
    Return,
}

#[derive(Default)]
struct Counters {
    closed: Mutex<bool>,
    closed_cond: Condvar,
    flushes: AtomicU32,
    flushes_after_close: AtomicU32,
    close_calls: AtomicU32,
    process_returns: AtomicU32,
}

/// A scripted session: delivers its events, then ends the way it was told
/// to. The first `close_failures` close calls fail.
pub struct FakeSession {
    events: Mutex<Vec<DecodedEvent>>,
    end: ProcessEnd,
    close_failures: AtomicU32,
    linger: Duration,
    counters: Arc<Counters>,
}

/// Observes a [`FakeSession`] after it has been handed to the controller.
#[derive(Clone)]
pub struct FakeHandle(Arc<Counters>);

impl FakeSession {
    pub fn new(events: Vec<DecodedEvent>, end: ProcessEnd) -> (Self, FakeHandle) {
        let counters = Arc::new(Counters::default());
        let session = FakeSession {
            events: Mutex::new(events),
            end,
            close_failures: AtomicU32::new(0),
            linger: Duration::ZERO,
            counters: counters.clone(),
        };
        (session, FakeHandle(counters))
    }

    pub fn failing_close(self, failures: u32) -> Self {
        self.close_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Keep `process` running for `linger` after the session was closed.
    pub fn lingering(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Turn the session into an `open` callback for the controller.
    pub fn opener(
        self,
    ) -> impl FnOnce(&ProviderGuid, &SessionConfig) -> Result<FakeSession, SessionError> {
        move |_, _| Ok(self)
    }
}

impl TraceSession for FakeSession {
    fn flush(&self) -> Result<(), SessionError> {
        self.counters.flushes.fetch_add(1, Ordering::SeqCst);
        if *self.counters.closed.lock().unwrap() {
            self.counters.flushes_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn process(&self, deliver: &mut dyn FnMut(DecodedEvent)) -> Result<(), SessionError> {
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        for event in events {
            deliver(event);
        }

        let result = match self.end {
            ProcessEnd::UntilClosed => {
                let closed = self.counters.closed.lock().unwrap();
                let closed = self
                    .counters
                    .closed_cond
                    .wait_while(closed, |closed| !*closed)
                    .unwrap();
                drop(closed);
                thread::sleep(self.linger);
                Ok(())
            }
            ProcessEnd::Fail(status) => Err(SessionError::Process(status)),
            ProcessEnd::Return => Ok(()),
        };
        self.counters.process_returns.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn close(&self) -> Result<(), SessionError> {
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.close_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.close_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::Close(5));
        }
        *self.counters.closed.lock().unwrap() = true;
        self.counters.closed_cond.notify_all();
        Ok(())
    }
}

impl FakeHandle {
    pub fn close_calls(&self) -> u32 {
        self.0.close_calls.load(Ordering::SeqCst)
    }

    pub fn process_returns(&self) -> u32 {
        self.0.process_returns.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u32 {
        self.0.flushes.load(Ordering::SeqCst)
    }

    pub fn flushes_after_close(&self) -> u32 {
        self.0.flushes_after_close.load(Ordering::SeqCst)
    }

    /// Block until `close` has been called `n` times.
    pub fn wait_for_close_calls(&self, n: u32) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.close_calls() < n {
            assert!(Instant::now() < deadline, "close was never called {n} times");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Shared in-memory writer, used both for event output and for logs.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    /// Parse the output stream as a sequence of JSON records.
    pub fn records(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        serde_json::Deserializer::from_slice(&bytes)
            .into_iter::<Value>()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    /// Number of log lines at `level` containing `needle`.
    pub fn count_matching(&self, level: &str, needle: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.contains(level) && line.contains(needle))
            .count()
    }
}

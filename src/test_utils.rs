//! Helpers shared by the unit tests.

use std::io;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};

use crate::event::{DecodeError, DecodedEvent, EventDescriptor, EventHeader, Properties};
use crate::guid::ProviderGuid;

/// In-memory log sink for a scoped `tracing` subscriber.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    /// Number of log lines at `level` containing `needle`.
    pub fn count_matching(&self, level: &str, needle: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.contains(level) && line.contains(needle))
            .count()
    }
}

pub fn header(id: u16) -> EventHeader {
    EventHeader {
        descriptor: EventDescriptor {
            id,
            ..Default::default()
        },
        thread_id: 1,
        process_id: 2,
        time_stamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        provider_id: ProviderGuid::from_fields(1, 2, 3, [4; 8]),
        activity_id: ProviderGuid::from_bytes([0; 16]),
        flags: 0,
        kernel_time: 0,
        user_time: 0,
        processor_time: 0,
    }
}

pub fn event(id: u16) -> DecodedEvent {
    let mut props = Properties::new();
    props.push("Seq", id.to_string());
    DecodedEvent {
        header: header(id),
        properties: Ok(props),
    }
}

pub fn undecodable_event(id: u16) -> DecodedEvent {
    DecodedEvent {
        header: header(id),
        properties: Err(DecodeError::MissingSchema(1168)),
    }
}

//! Turns decoded events into JSON output records.

use std::io::{self, Write};
use std::sync::mpsc::Receiver;

use serde::Serialize;

use crate::event::{DecodedEvent, EventHeader, Properties};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Include the event header in every record.
    pub include_header: bool,
    /// Only emit events with this ID.
    pub id_filter: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub emitted: u64,
    pub filtered: u64,
    pub decode_failures: u64,
    pub write_failures: u64,
}

// Key order matches what the tool has always printed: properties first.
#[derive(Serialize)]
struct OutputRecord<'a> {
    #[serde(rename = "EventProperties", skip_serializing_if = "Option::is_none")]
    event_properties: Option<&'a Properties>,
    #[serde(rename = "Header", skip_serializing_if = "Option::is_none")]
    header: Option<&'a EventHeader>,
}

pub struct Dispatcher<W> {
    options: DispatchOptions,
    out: W,
    stats: DispatchStats,
    sink_broken: bool,
}

impl<W: Write> Dispatcher<W> {
    pub fn new(options: DispatchOptions, out: W) -> Self {
        Dispatcher {
            options,
            out,
            stats: DispatchStats::default(),
            sink_broken: false,
        }
    }

    /// Handle one event. Returns true if the event passed the filter and a
    /// record was produced for it.
    pub fn dispatch(&mut self, event: &DecodedEvent) -> bool {
        self.stats.received += 1;

        if let Some(id) = self.options.id_filter {
            if id != event.id() {
                self.stats.filtered += 1;
                return false;
            }
        }

        let event_properties = match &event.properties {
            Ok(props) => Some(props),
            Err(e) => {
                self.stats.decode_failures += 1;
                tracing::warn!(
                    "Failed to enumerate event properties for event {}: {e}",
                    event.id()
                );
                None
            }
        };
        let record = OutputRecord {
            event_properties,
            header: self.options.include_header.then_some(&event.header),
        };

        if self.sink_broken {
            self.stats.write_failures += 1;
            return true;
        }
        match write_record(&mut self.out, &record) {
            Ok(()) => self.stats.emitted += 1,
            Err(e) => {
                // Reported once; later events are counted and dropped.
                self.stats.write_failures += 1;
                self.sink_broken = true;
                tracing::error!("Failed to write event output, discarding further events: {e}");
            }
        }
        true
    }

    /// Dispatch everything received on `events` until every sender is gone.
    pub fn run(mut self, events: Receiver<DecodedEvent>) -> DispatchStats {
        for event in events {
            self.dispatch(&event);
        }
        tracing::debug!("Dispatcher drained: {:?}", self.stats);
        self.stats
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn write_record<W: Write>(out: &mut W, record: &OutputRecord<'_>) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, record)?;
    out.write_all(b"\n")?;
    out.flush()
}

//! Shutdown notifications for the capture controller.
//!
//! The channel holds a single pending signal. Extra interrupts that arrive
//! while one is already pending are dropped: the controller handles them in a
//! loop, so one pending signal is as good as many.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The user asked to stop (Ctrl-C).
    Interrupt,
    /// The capture loop returned without being asked to.
    CaptureEnded,
}

/// Sending half, cheap to clone and safe to use from a signal handler thread.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: SyncSender<Signal>,
}

impl ShutdownTrigger {
    pub fn interrupt(&self) {
        self.raise(Signal::Interrupt);
    }

    /// Queue `signal` unless one is already pending. Never blocks.
    pub fn raise(&self, signal: Signal) {
        match self.tx.try_send(signal) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("Shutdown signal {signal:?} raised after shutdown completed");
            }
        }
    }
}

pub struct ShutdownSignal {
    tx: SyncSender<Signal>,
    rx: Receiver<Signal>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(1);
        ShutdownSignal { tx, rx }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.tx.clone(),
        }
    }

    /// Block until the next signal.
    pub fn wait(&self) -> Signal {
        match self.rx.recv() {
            Ok(signal) => signal,
            Err(_) => unreachable!("ShutdownSignal owns a sender"),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

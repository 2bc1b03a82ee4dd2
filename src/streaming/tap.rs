//! Ordered internal event feed.
//!
//! The bus and every agent runtime share one [`EventTap`]. While a task is
//! running the fabric attaches a channel; everything emitted lands in that
//! single channel, so the consumer sees bus and metric events in the order
//! they were produced. With nothing attached, emits are no-ops.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::agent::metrics::AgentMetrics;
use crate::message::envelope::MessageEnvelope;

/// An internal observation, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricEvent {
    Message(MessageEnvelope),
    Metric(AgentMetrics),
}

#[derive(Clone, Default)]
pub struct EventTap {
    sender: Arc<Mutex<Option<UnboundedSender<FabricEvent>>>>,
}

impl EventTap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh channel, replacing any previous one, and return its receiver.
    pub fn attach(&self) -> UnboundedReceiver<FabricEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        rx
    }

    /// Drop the attached sender. The receiver drains what is buffered and then ends.
    pub fn detach(&self) {
        self.sender.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn emit(&self, event: FabricEvent) {
        if let Some(tx) = self.sender.lock().as_ref() {
            // Receiver gone means nobody is observing; nothing to do.
            let _ = tx.send(event);
        }
    }
}

//! Observer-facing event stream for one task.
//!
//! The bridge consumes the fabric's ordered [`FabricEvent`] feed and forwards
//! [`StreamEvent`]s in the same order, with three filters:
//!
//! - a message id is forwarded at most once;
//! - a metric snapshot is forwarded only if it differs from the last one
//!   forwarded for that agent;
//! - exactly one terminal outcome is forwarded (`answer` + `done`, or
//!   `error`), and nothing after it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use super::tap::FabricEvent;
use crate::agent::metrics::AgentMetrics;
use crate::message::envelope::{AgentId, MessageEnvelope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Message { message: MessageEnvelope },
    Metric { metrics: AgentMetrics },
    Answer { answer: String },
    Done { success: bool },
    Error { error: String },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Message { .. } => "message",
            StreamEvent::Metric { .. } => "metric",
            StreamEvent::Answer { .. } => "answer",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

pub struct StreamingBridge {
    out: UnboundedSender<StreamEvent>,
    seen_messages: HashSet<String>,
    last_metrics: HashMap<AgentId, AgentMetrics>,
    finished: bool,
}

impl StreamingBridge {
    pub fn new(out: UnboundedSender<StreamEvent>) -> Self {
        Self {
            out,
            seen_messages: HashSet::new(),
            last_metrics: HashMap::new(),
            finished: false,
        }
    }

    /// Forward one internal event. Returns whether anything was emitted.
    pub fn forward(&mut self, event: FabricEvent) -> bool {
        if self.finished {
            return false;
        }
        match event {
            FabricEvent::Message(message) => {
                if !self.seen_messages.insert(message.id.clone()) {
                    tracing::debug!(id = %message.id, "duplicate message suppressed");
                    return false;
                }
                self.emit(StreamEvent::Message { message });
                true
            }
            FabricEvent::Metric(metrics) => {
                if self.last_metrics.get(&metrics.agent_id) == Some(&metrics) {
                    return false;
                }
                self.last_metrics
                    .insert(metrics.agent_id.clone(), metrics.clone());
                self.emit(StreamEvent::Metric { metrics });
                true
            }
        }
    }

    /// Forward everything from `feed` until it closes.
    pub async fn pump(&mut self, mut feed: UnboundedReceiver<FabricEvent>) {
        while let Some(event) = feed.recv().await {
            self.forward(event);
        }
    }

    /// Emit `answer` then `done`. No-op if a terminal event was already sent.
    pub fn finish_success(&mut self, answer: &str) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.emit(StreamEvent::Answer {
            answer: answer.to_string(),
        });
        self.emit(StreamEvent::Done { success: true });
        true
    }

    /// Emit a single `error`. No-op if a terminal event was already sent.
    pub fn finish_error(&mut self, error: &str) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.emit(StreamEvent::Error {
            error: error.to_string(),
        });
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn emit(&self, event: StreamEvent) {
        if self.out.send(event).is_err() {
            tracing::trace!("stream observer gone");
        }
    }
}

//! Publish/subscribe router with an append-only message log.
//!
//! [`MessageBus`] is cheap to clone; all clones share one log and one
//! subscriber table. Publishing appends to the log inside a single critical
//! section (which also emits the envelope to the [`EventTap`], so tap order
//! equals log order) and then invokes the receiver's handler outside the lock.
//!
//! Handlers must not block: agent runtimes register a handler that does a
//! non-blocking push into their bounded mailbox.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::envelope::{AgentId, MessageEnvelope, ids};
use crate::error::{BusError, DeliveryError};
use crate::streaming::tap::{EventTap, FabricEvent};

/// Callback invoked once per envelope addressed to the subscribed id.
pub type Handler = Arc<dyn Fn(MessageEnvelope) -> Result<(), DeliveryError> + Send + Sync>;

#[derive(Default)]
struct MessageLog {
    entries: Vec<MessageEnvelope>,
    /// id -> position in `entries`
    index: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct MessageBus {
    log: Arc<Mutex<MessageLog>>,
    subscribers: Arc<RwLock<HashMap<AgentId, Handler>>>,
    terminal_sinks: Arc<HashSet<AgentId>>,
    tap: EventTap,
}

impl MessageBus {
    /// Create a bus whose only terminal sinks are `fabric` and `user`.
    pub fn new(tap: EventTap) -> Self {
        Self::with_terminal_sinks(tap, [ids::FABRIC, ids::USER])
    }

    /// Create a bus with a custom set of terminal sink ids. Envelopes for a
    /// terminal sink with no subscriber are logged silently instead of warned.
    pub fn with_terminal_sinks<I, S>(tap: EventTap, sinks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        Self {
            log: Arc::new(Mutex::new(MessageLog::default())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            terminal_sinks: Arc::new(sinks.into_iter().map(Into::into).collect()),
            tap,
        }
    }

    /// Register `handler` for `agent_id`, replacing any previous handler.
    pub fn subscribe<F>(&self, agent_id: impl Into<AgentId>, handler: F)
    where
        F: Fn(MessageEnvelope) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let agent_id = agent_id.into();
        tracing::debug!(agent = %agent_id, "subscribed");
        self.subscribers.write().insert(agent_id, Arc::new(handler));
    }

    pub fn unsubscribe(&self, agent_id: &str) {
        self.subscribers.write().remove(agent_id);
    }

    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subscribers.read().contains_key(agent_id)
    }

    /// Append `envelope` to the log, then deliver it to its receiver.
    ///
    /// Delivery failures are non-fatal: they are logged and returned so the
    /// publisher can react, but the envelope stays in the log either way.
    pub fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        {
            let mut log = self.log.lock();
            if let Some(corr) = envelope.correlation_id.as_deref() {
                if corr == envelope.id || !log.index.contains_key(corr) {
                    tracing::warn!(
                        id = %envelope.id,
                        correlation_id = %corr,
                        "correlation id does not reference an earlier message"
                    );
                }
            }
            let position = log.entries.len();
            log.index.insert(envelope.id.clone(), position);
            log.entries.push(envelope.clone());
            self.tap.emit(FabricEvent::Message(envelope.clone()));
        }

        tracing::debug!(
            sender = %envelope.sender,
            receiver = %envelope.receiver,
            performative = %envelope.performative,
            summary = %envelope.label(),
            "publish"
        );

        let handler = self.subscribers.read().get(&envelope.receiver).cloned();
        let receiver = envelope.receiver.clone();
        match handler {
            Some(handler) => handler(envelope).map_err(|source| {
                tracing::warn!(receiver = %receiver, error = %source, "delivery rejected");
                BusError::Delivery { receiver, source }
            }),
            None if self.terminal_sinks.contains(&receiver) => Ok(()),
            None => {
                tracing::warn!(receiver = %receiver, "no subscriber, message dropped");
                Err(BusError::NoSubscriber(receiver))
            }
        }
    }

    /// Reconstruct the thread ending at `message_id`, oldest first.
    ///
    /// Walks `correlation_id` links backward. The walk visits at most as many
    /// messages as the log holds, so a corrupted (cyclic) chain still
    /// terminates and yields the partial chain collected so far.
    pub fn get_conversation_thread(&self, message_id: &str) -> Vec<MessageEnvelope> {
        let log = self.log.lock();
        let max_depth = log.entries.len();
        let mut thread = Vec::new();
        let mut current = Some(message_id.to_string());

        while let Some(id) = current {
            if thread.len() >= max_depth {
                tracing::warn!(message_id, depth = max_depth, "thread walk hit depth limit");
                break;
            }
            let Some(&position) = log.index.get(&id) else {
                break;
            };
            let message = &log.entries[position];
            current = message.correlation_id.clone();
            thread.push(message.clone());
        }

        thread.reverse();
        thread
    }

    /// The envelope with id `root` followed by every envelope correlated to it, in log order.
    pub fn correlated(&self, root: &str) -> Vec<MessageEnvelope> {
        self.log
            .lock()
            .entries
            .iter()
            .filter(|m| m.id == root || m.correlation_id.as_deref() == Some(root))
            .cloned()
            .collect()
    }

    pub fn get(&self, message_id: &str) -> Option<MessageEnvelope> {
        let log = self.log.lock();
        log.index.get(message_id).map(|&i| log.entries[i].clone())
    }

    /// Snapshot of the whole log.
    pub fn messages(&self) -> Vec<MessageEnvelope> {
        self.log.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn push_unchecked(&self, envelope: MessageEnvelope) {
        let mut log = self.log.lock();
        let position = log.entries.len();
        log.index.insert(envelope.id.clone(), position);
        log.entries.push(envelope);
    }
}

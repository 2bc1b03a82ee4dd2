//! The unit of communication between agents.
//!
//! Envelopes are FIPA-style speech acts: a [`Performative`] tells the
//! receiver how to interpret `content`. `correlation_id` links a reply to the
//! root of its conversation thread and must only ever point at an envelope
//! that was published earlier.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an agent or terminal sink on the bus.
pub type AgentId = String;

/// Well-known participant identifiers.
pub mod ids {
    /// The fabric itself: submits tasks and receives final answers.
    pub const FABRIC: &str = "fabric";
    /// A human caller; terminal sink, never subscribed.
    pub const USER: &str = "user";
    pub const COORDINATOR: &str = "coordinator";
    pub const ANALYST: &str = "analyst";
    pub const SPECIALIST_MATH: &str = "specialist_math";
    pub const SPECIALIST_TEXT: &str = "specialist_text";
    pub const SUPER_CRITIC: &str = "super_critic";
    /// The single-model baseline; answers directly, never on the bus.
    pub const TRADITIONAL: &str = "traditional";
}

/// Speech-act tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Performative {
    /// Ask the receiver to perform work.
    Request,
    /// Share a result.
    Inform,
    /// Ask for information.
    Query,
    /// Suggest an approach.
    Propose,
    /// Acknowledge.
    Confirm,
    /// Ask for a quality assessment.
    Evaluate,
    /// Refuse or report failure.
    Reject,
}

impl Performative {
    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::Request => "REQUEST",
            Performative::Inform => "INFORM",
            Performative::Query => "QUERY",
            Performative::Propose => "PROPOSE",
            Performative::Confirm => "CONFIRM",
            Performative::Evaluate => "EVALUATE",
            Performative::Reject => "REJECT",
        }
    }
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub sender: AgentId,
    pub receiver: AgentId,
    pub performative: Performative,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(
        performative: Performative,
        sender: impl Into<AgentId>,
        receiver: impl Into<AgentId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_message_id(),
            sender: sender.into(),
            receiver: receiver.into(),
            performative,
            content: content.into(),
            correlation_id: None,
            timestamp: Utc::now(),
            summary: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The id of the conversation this envelope belongs to: its correlation
    /// id if it is a reply, otherwise its own id.
    pub fn thread_root(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }

    /// Build a reply addressed back to this envelope's sender, in the same thread.
    pub fn reply(
        &self,
        sender: impl Into<AgentId>,
        performative: Performative,
        content: impl Into<String>,
    ) -> MessageEnvelope {
        MessageEnvelope::new(performative, sender, self.sender.clone(), content)
            .with_correlation(self.thread_root().to_string())
    }

    /// Short label for log lines: the summary, or the first 50 characters of content.
    pub fn label(&self) -> String {
        if self.summary.is_empty() {
            truncate_chars(&self.content, 50)
        } else {
            self.summary.clone()
        }
    }
}

impl std::fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} -> {}: {}",
            self.performative,
            self.sender,
            self.receiver,
            self.label()
        )
    }
}

fn new_message_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("msg-{}", &hex[..12])
}

/// Truncate to at most `max` characters without splitting a UTF-8 sequence.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

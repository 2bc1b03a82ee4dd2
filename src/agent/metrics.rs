//! Per-agent counters.
//!
//! An [`AgentMetrics`] value is owned by exactly one agent runtime, which
//! publishes snapshots through a `tokio::sync::watch` channel. Readers
//! (the aggregator, the streaming bridge, the fabric) only ever see clones.

use serde::{Deserialize, Serialize};

use crate::message::envelope::AgentId;

/// Token counts reported for one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub llm_calls: u64,
    pub tokens: TokenUsage,
    /// Accumulated cost in USD.
    pub cost: f64,
    /// Accumulated time spent inside LLM calls, in milliseconds.
    pub processing_time_ms: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub status: AgentStatus,
}

impl AgentMetrics {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            llm_calls: 0,
            tokens: TokenUsage::default(),
            cost: 0.0,
            processing_time_ms: 0,
            messages_sent: 0,
            messages_received: 0,
            status: AgentStatus::Idle,
        }
    }
}

//! Task memory: remembered outcomes of earlier tasks.
//!
//! The fabric only consults memory to enrich a new task and to record a
//! finished one. A failing backend never blocks a task.

pub mod keyword;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::envelope::{AgentId, truncate_chars};

/// Characters of the final answer kept in a memory entry.
pub const ANSWER_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub task: String,
    pub answer_excerpt: String,
    pub agents_used: Vec<AgentId>,
    pub success: bool,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub elapsed_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(task: impl Into<String>, answer: &str, agents_used: Vec<AgentId>, success: bool) -> Self {
        Self {
            task: task.into(),
            answer_excerpt: truncate_chars(answer, ANSWER_EXCERPT_CHARS),
            agents_used,
            success,
            total_tokens: 0,
            total_cost: 0.0,
            elapsed_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_totals(mut self, total_tokens: u64, total_cost: f64, elapsed_ms: u64) -> Self {
        self.total_tokens = total_tokens;
        self.total_cost = total_cost;
        self.elapsed_ms = elapsed_ms;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_tasks: usize,
    pub successful_tasks: usize,
    /// Averages and the token total cover successful tasks only.
    pub avg_cost: f64,
    pub avg_time_ms: f64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait TaskMemory: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> Result<(), MemoryError>;

    /// Up to `limit` entries most similar to `text`, best first.
    async fn query_by_similarity(&self, text: &str, limit: usize)
    -> Result<Vec<MemoryEntry>, MemoryError>;

    async fn stats(&self) -> Result<MemoryStats, MemoryError>;

    /// Drop all but the `keep_last` most recent entries; returns how many were dropped.
    async fn clear_old(&self, keep_last: usize) -> Result<usize, MemoryError>;
}

/// Render remembered tasks as a prompt section, or `None` if there are none.
pub fn render_context(entries: &[MemoryEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let mut section = String::from("Past similar tasks:");
    for entry in entries {
        section.push_str(&format!(
            "\n- Task: {}\n  Answer: {}",
            truncate_chars(&entry.task, 200),
            truncate_chars(&entry.answer_excerpt, 200)
        ));
    }
    Some(section)
}

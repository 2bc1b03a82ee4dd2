//! Task-level roll-up of per-agent metrics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agent::metrics::{AgentMetrics, TokenUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub tokens: TokenUsage,
    pub total_cost: f64,
    pub llm_calls: u64,
    pub messages_sent: u64,
    pub elapsed_ms: u64,
    /// Total tokens per second of wall-clock time.
    pub tokens_per_second: f64,
    pub cost_per_1k_tokens: f64,
    pub agents: Vec<AgentMetrics>,
}

/// Computes [`PerformanceSummary`] values on demand. Never mutates its inputs.
#[derive(Debug, Clone, Copy)]
pub struct MetricsAggregator {
    started: Instant,
}

impl MetricsAggregator {
    /// Start the wall clock now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn summarize(&self, snapshots: &[AgentMetrics]) -> PerformanceSummary {
        Self::summarize_over(snapshots, self.elapsed())
    }

    pub fn summarize_over(snapshots: &[AgentMetrics], elapsed: Duration) -> PerformanceSummary {
        let mut tokens = TokenUsage::default();
        let mut total_cost = 0.0;
        let mut llm_calls = 0;
        let mut messages_sent = 0;
        for m in snapshots {
            tokens.add(&m.tokens);
            total_cost += m.cost;
            llm_calls += m.llm_calls;
            messages_sent += m.messages_sent;
        }

        let secs = elapsed.as_secs_f64();
        let tokens_per_second = if secs > 0.0 {
            tokens.total as f64 / secs
        } else {
            0.0
        };
        let cost_per_1k_tokens = if tokens.total > 0 {
            total_cost * 1000.0 / tokens.total as f64
        } else {
            0.0
        };

        PerformanceSummary {
            tokens,
            total_cost,
            llm_calls,
            messages_sent,
            elapsed_ms: elapsed.as_millis() as u64,
            tokens_per_second,
            cost_per_1k_tokens,
            agents: snapshots.to_vec(),
        }
    }
}

impl std::fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "tokens: {} (prompt {}, completion {})",
            self.tokens.total, self.tokens.prompt, self.tokens.completion
        )?;
        writeln!(f, "cost: ${:.6} (${:.6} per 1K tokens)", self.total_cost, self.cost_per_1k_tokens)?;
        writeln!(f, "llm calls: {}, messages: {}", self.llm_calls, self.messages_sent)?;
        write!(
            f,
            "elapsed: {:.2}s, {:.1} tokens/s",
            self.elapsed_ms as f64 / 1000.0,
            self.tokens_per_second
        )
    }
}

//! Live observation of a running task.
//!
//! [`tap::EventTap`] collects bus and metric events in production order,
//! [`bridge::StreamingBridge`] turns them into the deduplicated observer
//! stream, [`aggregator::MetricsAggregator`] rolls up metrics and
//! [`transcript::TranscriptLogger`] persists a task's stream as JSONL.

pub mod aggregator;
pub mod bridge;
pub mod tap;
pub mod transcript;

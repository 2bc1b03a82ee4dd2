//! JSONL transcript of one task's stream.
//!
//! Each task produces `task-{timestamp}.jsonl` in the configured transcript
//! directory: a `task_start` line, one `stream_event` line per forwarded
//! [`StreamEvent`], and a `task_end` line with the performance summary.
//!
//! Uses synchronous `std::fs`; every line is flushed as it is written.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use super::aggregator::PerformanceSummary;
use super::bridge::StreamEvent;

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TranscriptEntry<'a> {
    TaskStart {
        timestamp: String,
        task: &'a str,
    },
    StreamEvent {
        timestamp: String,
        event: &'a StreamEvent,
    },
    TaskEnd {
        timestamp: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a str>,
        summary: &'a PerformanceSummary,
    },
}

pub struct TranscriptLogger {
    writer: BufWriter<fs::File>,
    path: PathBuf,
}

impl TranscriptLogger {
    /// Create `dir` if needed and open a fresh transcript file inside it.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        let path = dir.join(format!("task-{stamp}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, entry: &TranscriptEntry<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn task_start(&mut self, task: &str) -> anyhow::Result<()> {
        self.log(&TranscriptEntry::TaskStart {
            timestamp: now_iso(),
            task,
        })
    }

    pub fn stream_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
        self.log(&TranscriptEntry::StreamEvent {
            timestamp: now_iso(),
            event,
        })
    }

    pub fn task_end(
        &mut self,
        success: bool,
        error: Option<&str>,
        summary: &PerformanceSummary,
    ) -> anyhow::Result<()> {
        self.log(&TranscriptEntry::TaskEnd {
            timestamp: now_iso(),
            success,
            error,
            summary,
        })
    }
}

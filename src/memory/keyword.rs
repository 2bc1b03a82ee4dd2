//! In-process [`TaskMemory`] scored by keyword overlap, optionally backed
//! by a JSON file.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{MemoryEntry, MemoryStats, TaskMemory};
use crate::error::MemoryError;

fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Keeps the most recent `capacity` entries. Similarity is the share of the
/// query's keywords that also appear in a stored task; failed tasks are
/// never returned.
pub struct KeywordMemory {
    entries: RwLock<VecDeque<MemoryEntry>>,
    capacity: usize,
    /// Rewritten after every change when set.
    file: Option<PathBuf>,
}

impl Default for KeywordMemory {
    fn default() -> Self {
        Self::new(100)
    }
}

impl KeywordMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// Load the entries saved in `path`, if any. Later changes are written back.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, MemoryError> {
        let path = path.into();
        let mut entries: VecDeque<MemoryEntry> = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<MemoryEntry>>(&text)
                .map_err(|e| MemoryError::Corrupt {
                    path: path.clone(),
                    message: e.to_string(),
                })?
                .into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        let capacity = capacity.max(1);
        while entries.len() > capacity {
            entries.pop_front();
        }
        tracing::info!(path = %path.display(), entries = entries.len(), "task memory loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            capacity,
            file: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn persist(&self, entries: &VecDeque<MemoryEntry>) -> Result<(), MemoryError> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

#[async_trait]
impl TaskMemory for KeywordMemory {
    async fn store(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        tracing::debug!(stored = entries.len(), "task memory stored");
        self.persist(&entries)
    }

    async fn clear_old(&self, keep_last: usize) -> Result<usize, MemoryError> {
        let mut entries = self.entries.write();
        let removed = entries.len().saturating_sub(keep_last);
        entries.drain(..removed);
        tracing::info!(removed, kept = entries.len(), "old task memories cleared");
        self.persist(&entries)?;
        Ok(removed)
    }

    async fn query_by_similarity(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let query = keywords(text);
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read();
        let mut scored: Vec<(f64, usize, &MemoryEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.success)
            .filter_map(|(position, e)| {
                let overlap = query.intersection(&keywords(&e.task)).count();
                (overlap > 0).then(|| (overlap as f64 / query.len() as f64, position, e))
            })
            .collect();
        // Best score first; among equal scores the more recent entry wins.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, e)| e.clone())
            .collect())
    }

    async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let entries = self.entries.read();
        let successful: Vec<&MemoryEntry> = entries.iter().filter(|e| e.success).collect();
        let n = successful.len();
        let (avg_cost, avg_time_ms) = if n == 0 {
            (0.0, 0.0)
        } else {
            (
                successful.iter().map(|e| e.total_cost).sum::<f64>() / n as f64,
                successful.iter().map(|e| e.elapsed_ms as f64).sum::<f64>() / n as f64,
            )
        };
        Ok(MemoryStats {
            total_tasks: entries.len(),
            successful_tasks: n,
            avg_cost,
            avg_time_ms,
            total_tokens: successful.iter().map(|e| e.total_tokens).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task: &str, success: bool) -> MemoryEntry {
        MemoryEntry::new(task, "answer", vec!["specialist_math".into()], success)
    }

    #[tokio::test]
    async fn ranks_by_keyword_overlap() {
        let memory = KeywordMemory::default();
        memory.store(entry("average of the ratings", true)).await.unwrap();
        memory.store(entry("summarize sentiment of reviews", true)).await.unwrap();
        memory.store(entry("weather tomorrow", true)).await.unwrap();

        let hits = memory
            .query_by_similarity("Summarize the sentiment of five reviews", 5)
            .await
            .unwrap();
        let tasks: Vec<_> = hits.iter().map(|e| e.task.as_str()).collect();
        assert_eq!(tasks, ["summarize sentiment of reviews", "average of the ratings"]);
    }

    #[tokio::test]
    async fn failed_tasks_are_skipped_and_limit_applies() {
        let memory = KeywordMemory::default();
        memory.store(entry("sum numbers", false)).await.unwrap();
        memory.store(entry("sum numbers again", true)).await.unwrap();
        memory.store(entry("sum more numbers", true)).await.unwrap();

        let hits = memory.query_by_similarity("sum numbers", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].success);
        // Equal scores: the newest entry comes first.
        assert_eq!(hits[0].task, "sum more numbers");
    }

    #[tokio::test]
    async fn capacity_keeps_most_recent() {
        let memory = KeywordMemory::new(2);
        for i in 0..5 {
            memory.store(entry(&format!("task {i}"), true)).await.unwrap();
        }
        assert_eq!(memory.len(), 2);
        let hits = memory.query_by_similarity("task", 10).await.unwrap();
        let tasks: Vec<_> = hits.iter().map(|e| e.task.as_str()).collect();
        assert_eq!(tasks, ["task 4", "task 3"]);

        assert_eq!(memory.clear_old(1).await.unwrap(), 1);
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.clear_old(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_memory_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("memory.json");

        let memory = KeywordMemory::open(&path, 10).unwrap();
        assert!(memory.is_empty());
        memory.store(entry("average of the ratings", true)).await.unwrap();
        memory.store(entry("summarize reviews", true)).await.unwrap();
        memory.store(entry("translate the essay", true)).await.unwrap();
        assert_eq!(memory.clear_old(2).await.unwrap(), 1);

        let reopened = KeywordMemory::open(&path, 10).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        assert_eq!(reopened.len(), 2);
        let hits = reopened.query_by_similarity("summarize the reviews", 1).await.unwrap();
        assert_eq!(hits[0].task, "summarize reviews");

        // Reopening with a smaller capacity keeps the newest entries.
        let small = KeywordMemory::open(&path, 1).unwrap();
        let hits = small.query_by_similarity("translate essay", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(small.len(), 1);
    }

    #[test]
    fn corrupt_memory_file_names_the_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("memory.json");
        fs::write(&path, "{ not json").unwrap();

        match KeywordMemory::open(&path, 10) {
            Err(MemoryError::Corrupt { path: reported, .. }) => assert_eq!(reported, path),
            Err(other) => panic!("expected Corrupt, got {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn stats_cover_successful_tasks() {
        let memory = KeywordMemory::default();
        assert_eq!(memory.stats().await.unwrap(), MemoryStats::default());

        memory.store(entry("a", true).with_totals(100, 0.01, 1000)).await.unwrap();
        memory.store(entry("b", true).with_totals(300, 0.03, 3000)).await.unwrap();
        memory.store(entry("c", false).with_totals(999, 9.0, 9999)).await.unwrap();

        let stats = memory.stats().await.unwrap();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.successful_tasks, 2);
        assert_eq!(stats.total_tokens, 400);
        assert!((stats.avg_cost - 0.02).abs() < 1e-12);
        assert!((stats.avg_time_ms - 2000.0).abs() < 1e-9);
    }
}

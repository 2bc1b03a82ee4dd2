//! Per-task cancellation.
//!
//! Each task gets a [`CancellationToken`] that is a child of the fabric's
//! root token, so shutting the fabric down cancels every task. Runtimes look
//! up the token by an envelope's thread root before processing it.
//!
//! A cancelled task's token is kept (as a tombstone) so envelopes for that
//! task still sitting in mailboxes are skipped instead of processed. Only the
//! most recent [`TOMBSTONE_LIMIT`] tombstones are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// How many cancelled tasks are remembered.
pub const TOMBSTONE_LIMIT: usize = 64;

#[derive(Default)]
struct Tokens {
    by_task: HashMap<String, CancellationToken>,
    /// Cancelled task ids, oldest first.
    tombstones: VecDeque<String>,
}

#[derive(Clone)]
pub struct CancelRegistry {
    root: CancellationToken,
    tokens: Arc<Mutex<Tokens>>,
}

impl CancelRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            tokens: Arc::new(Mutex::new(Tokens::default())),
        }
    }

    /// Create (or return the existing) token for `task_id`.
    pub fn open(&self, task_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .by_task
            .entry(task_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    pub fn token_for(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().by_task.get(task_id).cloned()
    }

    /// Cancel the task's token. Returns `false` if the task was never opened.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tokens = self.tokens.lock();
        let Some(token) = tokens.by_task.get(task_id) else {
            return false;
        };
        if !token.is_cancelled() {
            token.cancel();
            tokens.tombstones.push_back(task_id.to_string());
        }
        while tokens.tombstones.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = tokens.tombstones.pop_front() {
                tokens.by_task.remove(&oldest);
            }
        }
        true
    }

    /// Forget a task that finished normally.
    pub fn close(&self, task_id: &str) {
        self.tokens.lock().by_task.remove(task_id);
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.token_for(task_id).is_some_and(|t| t.is_cancelled())
    }
}

//! The coordinator's table of in-flight delegations.
//!
//! A [`PendingTask`] is created with its expected responder set frozen and is
//! only ever mutated by adding responses. The barrier releases when the set of
//! responders equals the expected set, whatever order replies arrive in.

use std::collections::{HashMap, HashSet};

use crate::message::envelope::AgentId;

/// Where a pending task is after its specialists were dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    /// Waiting for the analyst.
    Synthesizing,
    /// Waiting for the critic to judge `synthesis`.
    Critiquing { synthesis: String },
}

#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task_id: String,
    pub original_request: String,
    pub requester: AgentId,
    expected: Vec<AgentId>,
    responses: HashMap<AgentId, String>,
    pub phase: Phase,
}

impl PendingTask {
    pub fn new(
        task_id: impl Into<String>,
        original_request: impl Into<String>,
        requester: impl Into<AgentId>,
        mut expected: Vec<AgentId>,
    ) -> Self {
        // The barrier compares sets; keep the first occurrence of each responder.
        let mut seen = HashSet::new();
        expected.retain(|id| seen.insert(id.clone()));
        Self {
            task_id: task_id.into(),
            original_request: original_request.into(),
            requester: requester.into(),
            expected,
            responses: HashMap::new(),
            phase: Phase::Collecting,
        }
    }

    pub fn expected(&self) -> &[AgentId] {
        &self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.responses.len() == self.expected.len()
            && self.expected.iter().all(|id| self.responses.contains_key(id))
    }

    /// Collected responses in expected (delegation) order.
    pub fn ordered_responses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.expected.iter().filter_map(|id| {
            self.responses
                .get(id)
                .map(|text| (id.as_str(), text.as_str()))
        })
    }
}

/// Result of offering one specialist response to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// No pending task has this id.
    Unknown,
    /// The task is no longer collecting.
    NotCollecting,
    /// The sender was not delegated to.
    Unexpected,
    /// The sender already answered; the first answer is kept.
    Duplicate,
    Waiting { received: usize, expected: usize },
    /// This response completed the barrier. Returned at most once per task.
    Complete,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    tasks: HashMap<String, PendingTask>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: PendingTask) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<&PendingTask> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut PendingTask> {
        self.tasks.get_mut(task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<PendingTask> {
        self.tasks.remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Record `sender`'s response for `task_id`.
    pub fn record(&mut self, task_id: &str, sender: &str, content: String) -> CollectOutcome {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return CollectOutcome::Unknown;
        };
        if task.phase != Phase::Collecting {
            return CollectOutcome::NotCollecting;
        }
        if !task.expected.iter().any(|id| id == sender) {
            return CollectOutcome::Unexpected;
        }
        if task.responses.contains_key(sender) {
            return CollectOutcome::Duplicate;
        }
        task.responses.insert(sender.to_string(), content);

        if task.is_complete() {
            task.phase = Phase::Synthesizing;
            CollectOutcome::Complete
        } else {
            CollectOutcome::Waiting {
                received: task.responses.len(),
                expected: task.expected.len(),
            }
        }
    }
}

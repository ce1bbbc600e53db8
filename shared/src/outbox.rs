//! FIFO queue of actions waiting for the remote store.
//!
//! The queue itself is plain data; [`SyncEngine`](crate::sync::SyncEngine)
//! owns it, persists it after every mutation and decides when to drain.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;

use crate::model::{ActionId, QueuedAction};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("duplicate action id: {0}")]
    DuplicateId(ActionId),
}

/// What the engine learned about each action it tried during one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Delivered,
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppliedOutcomes {
    pub delivered: Vec<ActionId>,
    /// Failed but still within budget, with the new retry count.
    pub retried: Vec<(ActionId, u32)>,
    /// Failed for the last time; no longer queued.
    pub dropped: Vec<QueuedAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionQueue {
    entries: VecDeque<QueuedAction>,
    max_entries: usize,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ActionQueue {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Rebuilds a queue from persisted entries. Later duplicates of an id
    /// are discarded and anything past `max_entries` is cut from the front,
    /// keeping the newest work.
    pub fn restore(actions: impl IntoIterator<Item = QueuedAction>, max_entries: usize) -> Self {
        let mut queue = Self::new(max_entries);
        for action in actions {
            if queue.contains(&action.id) {
                continue;
            }
            queue.entries.push_back(action);
        }
        while queue.entries.len() > queue.max_entries {
            queue.entries.pop_front();
        }
        queue
    }

    pub fn push(&mut self, action: QueuedAction) -> Result<(), OutboxError> {
        if self.entries.len() >= self.max_entries {
            return Err(OutboxError::Full(self.max_entries));
        }
        if self.contains(&action.id) {
            return Err(OutboxError::DuplicateId(action.id));
        }
        self.entries.push_back(action);
        Ok(())
    }

    pub fn remove(&mut self, id: &ActionId) -> Option<QueuedAction> {
        let index = self.entries.iter().position(|a| &a.id == id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.entries.iter().any(|a| &a.id == id)
    }

    pub fn get(&self, id: &ActionId) -> Option<&QueuedAction> {
        self.entries.iter().find(|a| &a.id == id)
    }

    /// Copy of the current entries in enqueue order.
    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedAction> {
        self.entries.iter()
    }

    /// Applies one drain's verdicts in a single pass. Entries without a
    /// verdict were enqueued after the snapshot was taken and are untouched.
    pub fn apply(&mut self, verdicts: &[(ActionId, Verdict)], max_retries: u32) -> AppliedOutcomes {
        let verdicts: HashMap<&ActionId, Verdict> =
            verdicts.iter().map(|(id, v)| (id, *v)).collect();
        let mut applied = AppliedOutcomes::default();

        self.entries.retain_mut(|action| match verdicts.get(&action.id) {
            None => true,
            Some(Verdict::Delivered) => {
                applied.delivered.push(action.id.clone());
                false
            }
            Some(Verdict::Failed) => {
                action.retry_count = action.retry_count.saturating_add(1);
                if action.retry_count >= max_retries {
                    applied.dropped.push(action.clone());
                    false
                } else {
                    applied.retried.push((action.id.clone(), action.retry_count));
                    true
                }
            }
        });

        applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

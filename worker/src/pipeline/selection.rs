//! Pending user selections, keyed by task id.
//!
//! A task registers before asking the UI which files to install and gets a
//! [`SelectionTicket`]. The first `user_selection` for that task id resolves
//! the ticket; later ones find nothing and are dropped. Dropping the ticket
//! removes the registration whatever happened, so a timed-out task never
//! leaks an entry and the same id can be registered again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("a selection is already pending for task {0}")]
    AlreadyPending(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Selected(Vec<String>),
    TimedOut,
}

impl SelectionOutcome {
    /// Selected files; empty on timeout.
    pub fn into_files(self) -> Vec<String> {
        match self {
            SelectionOutcome::Selected(files) => files,
            SelectionOutcome::TimedOut => Vec::new(),
        }
    }
}

struct Waiter {
    generation: u64,
    reply: oneshot::Sender<Vec<String>>,
}

#[derive(Default)]
pub struct PendingSelections {
    generation: AtomicU64,
    waiting: DashMap<String, Waiter>,
}

impl PendingSelections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str) -> Result<SelectionTicket<'_>, SelectionError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        match self.waiting.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(SelectionError::AlreadyPending(task_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Waiter { generation, reply });
                Ok(SelectionTicket {
                    pending: self,
                    task_id: task_id.to_string(),
                    generation,
                    rx,
                })
            }
        }
    }

    /// Complete the waiter for `task_id`. Returns false when nobody is waiting.
    pub fn resolve(&self, task_id: &str, files: Vec<String>) -> bool {
        match self.waiting.remove(task_id) {
            Some((_, waiter)) => waiter.reply.send(files).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.waiting.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

pub struct SelectionTicket<'a> {
    pending: &'a PendingSelections,
    task_id: String,
    generation: u64,
    rx: oneshot::Receiver<Vec<String>>,
}

impl SelectionTicket<'_> {
    pub async fn wait(mut self, timeout: Duration) -> SelectionOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(files)) => SelectionOutcome::Selected(files),
            // Sender gone without a reply; treat like a timeout.
            Ok(Err(_)) | Err(_) => SelectionOutcome::TimedOut,
        }
    }
}

impl Drop for SelectionTicket<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.pending
            .waiting
            .remove_if(&self.task_id, |_, waiter| waiter.generation == generation);
    }
}

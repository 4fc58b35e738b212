//! Execution listeners and the ordered set that holds them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// How a task's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// The run returned an error or panicked; carries the message
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// Observer of task execution.
///
/// Callbacks are delivered on the scheduler's listener thread, one at a time,
/// in the order the events happened. They never run on a task worker.
pub trait TaskExecuteListener: Send + Sync {
    /// The task's dependencies are done and it is about to run.
    fn on_task_prepared(&self, task: &str);

    /// The task's run returned.
    fn on_task_finished(&self, task: &str, outcome: &TaskOutcome);
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A prepared/finished occurrence waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecutionEvent {
    Prepared { task: String },
    Finished { task: String, outcome: TaskOutcome },
}

impl ExecutionEvent {
    pub(crate) fn deliver(&self, listener: &dyn TaskExecuteListener) {
        match self {
            ExecutionEvent::Prepared { task } => listener.on_task_prepared(task),
            ExecutionEvent::Finished { task, outcome } => listener.on_task_finished(task, outcome),
        }
    }
}

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<dyn TaskExecuteListener>)>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `listener` unless that same instance is already registered,
    /// in which case its existing id is returned.
    pub(crate) fn add(&self, listener: Arc<dyn TaskExecuteListener>) -> ListenerId {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, _)) = entries
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &listener))
        {
            return *id;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Listeners in registration order, as of now.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn TaskExecuteListener>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

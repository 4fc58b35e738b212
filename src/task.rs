//! The task contract and the default closure-backed task.

use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::GraphError;

/// A state change announced by a task to the tasks that depend on it.
///
/// The `kind` is a free-form label; an optional payload of any type can be
/// attached and read back with [`TaskEvent::payload`].
#[derive(Clone)]
pub struct TaskEvent {
    kind: String,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskEvent {
    /// Create an event with no payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    /// Attach a payload to the event
    pub fn with_payload<T: Any + Send + Sync + 'static>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Get the payload with type checking
    /// Returns None if there is no payload or if the type doesn't match
    pub fn payload<T: Any + Send + Sync + 'static>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref::<T>()
    }
}

impl Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEvent")
            .field("kind", &self.kind)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// What the graph should do after a dependent has seen a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Re-broadcast the event to this task's own dependents
    Forward,
    /// Stop here
    Stop,
}

/// Trait that all tasks must implement
#[async_trait::async_trait]
pub trait Task: Send + Sync + Debug {
    /// Execute the task. Called once per round on a scheduler worker.
    async fn run(&self) -> Result<(), GraphError>;

    /// Unique, non-empty name of this task. Read once, at registration.
    fn name(&self) -> String {
        format!("{:?}", self)
    }

    /// Called when `source`, one of this task's direct dependencies, announces
    /// a state change. The default forwards the event to this task's dependents.
    fn on_dependent_task_state_changed(&self, _source: &str, _event: &TaskEvent) -> Propagation {
        Propagation::Forward
    }

    /// Called synchronously on the mutating thread right after an edge from
    /// this task to `dependency` was added (`added == true`) or removed.
    fn on_task_dependency_changed(&self, _dependency: &str, _added: bool) {}
}

type TaskBody = dyn Fn() -> BoxFuture<'static, Result<(), GraphError>> + Send + Sync;

/// Default task built from a name and an async closure.
///
/// ```rust
/// use task_dag::FnTask;
///
/// let task = FnTask::new("fetch", || async {
///     // do the work
///     Ok(())
/// });
/// assert_eq!(task.task_name(), "fetch");
/// ```
pub struct FnTask {
    name: String,
    body: Arc<TaskBody>,
}

impl FnTask {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move || -> BoxFuture<'static, Result<(), GraphError>> {
                Box::pin(body())
            }),
        }
    }

    /// A task whose run does nothing. Handy as a join point in a graph.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, || async { Ok(()) })
    }

    pub fn task_name(&self) -> &str {
        &self.name
    }
}

impl Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait::async_trait]
impl Task for FnTask {
    async fn run(&self) -> Result<(), GraphError> {
        (self.body)().await
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_dependent_task_state_changed(&self, source: &str, event: &TaskEvent) -> Propagation {
        debug!(task = %self.name, source, kind = event.kind(), "forwarding state change");
        Propagation::Forward
    }

    fn on_task_dependency_changed(&self, dependency: &str, added: bool) {
        debug!(task = %self.name, dependency, added, "dependency changed");
    }
}

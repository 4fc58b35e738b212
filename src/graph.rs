//! The dependency graph: registration, ordering, execution and propagation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use petgraph::stable_graph::NodeIndex;
use tokio::sync::{Mutex, Semaphore};
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::GraphError;
use crate::gate::{DependencyState, FinishedSet};
use crate::listener::{ExecutionEvent, ListenerId, ListenerSet, TaskExecuteListener, TaskOutcome};
use crate::node::{NodeArena, TaskNode};
use crate::scheduler::{DispatchQueue, Scheduler};
use crate::task::{Propagation, Task, TaskEvent};

/// A task whose run failed during a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub message: String,
}

/// Result of one round of execution.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Generation of the finished set this round ran under.
    pub generation: u64,
    /// Tasks the round scheduled, in topological order.
    pub scheduled: Vec<String>,
    /// Tasks that finished successfully, in completion order.
    pub completed: Vec<String>,
    pub failed: Vec<TaskFailure>,
    /// Tasks not run because a dependency failed or was skipped.
    pub skipped: Vec<String>,
    pub duration: Duration,
}

impl RoundReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// What an execution unit did.
#[derive(Debug)]
enum UnitResult {
    Ran(TaskOutcome),
    Skipped { blocked_by: String },
}

/// Shared by every unit of one round.
struct RoundContext {
    finished: Arc<FinishedSet>,
    listeners: Arc<ListenerSet>,
    dispatch: Arc<DispatchQueue>,
    permits: Arc<Semaphore>,
    generation: u64,
    recheck: Duration,
}

impl RoundContext {
    fn emit(&self, event: ExecutionEvent) {
        self.dispatch.submit(self.listeners.snapshot(), event);
    }
}

/// One scheduled run of one node.
struct ExecutionUnit {
    name: String,
    dependencies: Vec<String>,
    task: Arc<dyn Task>,
}

impl ExecutionUnit {
    async fn run(self, ctx: Arc<RoundContext>) -> UnitResult {
        let state = ctx
            .finished
            .wait_for(&self.name, &self.dependencies, ctx.recheck)
            .await;
        match state {
            DependencyState::Satisfied => {}
            DependencyState::Blocked(dep) => {
                debug!(dependency = %dep, "skipping, dependency did not finish");
                ctx.finished.mark_blocked(&self.name, ctx.generation);
                return UnitResult::Skipped { blocked_by: dep };
            }
        }

        let permit = ctx.permits.clone().acquire_owned().await;
        ctx.emit(ExecutionEvent::Prepared {
            task: self.name.clone(),
        });

        let started = Instant::now();
        let outcome = match permit {
            Err(_) => TaskOutcome::Failed("worker pool closed".to_string()),
            Ok(_permit) => match AssertUnwindSafe(self.task.run()).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Succeeded,
                Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                Err(panic) => TaskOutcome::Failed(panic_message(panic.as_ref())),
            },
        };
        debug!(elapsed = ?started.elapsed(), ?outcome, "task returned");

        ctx.emit(ExecutionEvent::Finished {
            task: self.name.clone(),
            outcome: outcome.clone(),
        });
        if outcome.is_success() {
            ctx.finished.mark_finished(&self.name, ctx.generation);
        } else {
            ctx.finished.mark_blocked(&self.name, ctx.generation);
        }
        UnitResult::Ran(outcome)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

/// One level of an in-progress state-change propagation.
struct Frame {
    source: String,
    targets: Vec<(String, Arc<dyn Task>)>,
    next: usize,
}

/// A mutable graph of named tasks where an edge means "must finish before".
///
/// All methods take `&self`; the graph can be shared across threads.
pub struct DependencyGraph {
    scheduler: Arc<Scheduler>,
    registry: RwLock<NodeArena>,
    finished: Arc<FinishedSet>,
    listeners: Arc<ListenerSet>,
    round_lock: Mutex<()>,
}

impl DependencyGraph {
    /// Create an empty graph that runs its tasks on `scheduler`
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            registry: RwLock::new(NodeArena::new()),
            finished: Arc::new(FinishedSet::new()),
            listeners: Arc::new(ListenerSet::new()),
            round_lock: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, NodeArena> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, NodeArena> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task to the graph.
    ///
    /// Returns `Ok(false)` if a task with the same name is already registered;
    /// the existing node and its edges are kept.
    pub fn add_task<T: Task + 'static>(&self, task: T) -> Result<bool, GraphError> {
        self.add_shared_task(Arc::new(task))
    }

    /// Add a task the caller keeps a handle to.
    pub fn add_shared_task(&self, task: Arc<dyn Task>) -> Result<bool, GraphError> {
        let name = task.name();
        if name.is_empty() {
            return Err(GraphError::InvalidArgument(
                "task name must not be empty".to_string(),
            ));
        }
        let (_, inserted) = self.write_registry().insert(TaskNode::new(name.clone(), task));
        if inserted {
            debug!(task = %name, "task registered");
        } else {
            debug!(task = %name, "task already registered, keeping the first");
        }
        Ok(inserted)
    }

    /// Declare that `from` depends on `to`: `to` must finish before `from` runs.
    ///
    /// Returns `Ok(false)` if the edge already existed.
    pub fn bind_dependency(&self, from: &str, to: &str) -> Result<bool, GraphError> {
        self.change_dependency(from, to, true)
    }

    /// Remove the edge declared by [`bind_dependency`](Self::bind_dependency).
    ///
    /// Returns `Ok(false)` if there was no such edge.
    pub fn unbind_dependency(&self, from: &str, to: &str) -> Result<bool, GraphError> {
        self.change_dependency(from, to, false)
    }

    fn change_dependency(&self, from: &str, to: &str, add: bool) -> Result<bool, GraphError> {
        let (task, changed) = {
            let mut registry = self.write_registry();
            let from_idx = resolve(&registry, from)?;
            let to_idx = resolve(&registry, to)?;
            let changed = if add {
                registry.add_dependency(from_idx, to_idx)
            } else {
                registry.remove_dependency(from_idx, to_idx)
            };
            let task = registry.node(from_idx).map(|node| node.task().clone());
            (task, changed)
        };

        if changed {
            debug!(from, to, added = add, "dependency changed");
            if let Some(task) = task {
                task.on_task_dependency_changed(to, add);
            }
        }
        Ok(changed)
    }

    pub fn contains_task(&self, name: &str) -> bool {
        self.read_registry().lookup(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.read_registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered task names, in registration order.
    pub fn task_names(&self) -> Vec<String> {
        let registry = self.read_registry();
        registry.names(&registry.indices())
    }

    /// Tasks `name` depends on directly.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<String>, GraphError> {
        let registry = self.read_registry();
        let idx = resolve(&registry, name)?;
        Ok(registry.names(&registry.dependencies(idx)))
    }

    /// Tasks that depend on `name` directly.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>, GraphError> {
        let registry = self.read_registry();
        let idx = resolve(&registry, name)?;
        Ok(registry.names(&registry.dependents(idx)))
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<String> {
        let registry = self.read_registry();
        let roots: Vec<NodeIndex> = registry
            .indices()
            .into_iter()
            .filter(|&idx| registry.dependencies(idx).is_empty())
            .collect();
        registry.names(&roots)
    }

    /// Whether `name` finished successfully and has not been reset since.
    pub fn is_finished(&self, name: &str) -> bool {
        self.finished.contains(name)
    }

    /// Every task currently in the finished set, sorted by name.
    pub fn finished_tasks(&self) -> Vec<String> {
        self.finished.finished()
    }

    /// Order every task so each comes after all of its dependencies.
    ///
    /// Kahn's algorithm over a snapshot of the graph. Ties are broken by
    /// registration order, so the result is stable while edges are unchanged.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let registry = self.read_registry();
        let indices = registry.indices();

        let mut residual: HashMap<NodeIndex, usize> = indices
            .iter()
            .map(|&idx| (idx, registry.dependencies(idx).len()))
            .collect();
        let mut queue: VecDeque<NodeIndex> = indices
            .iter()
            .copied()
            .filter(|idx| residual[idx] == 0)
            .collect();

        let mut order = Vec::with_capacity(indices.len());
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for dependent in registry.dependents(idx) {
                if let Some(degree) = residual.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() < indices.len() {
            let stuck: Vec<NodeIndex> = indices
                .into_iter()
                .filter(|idx| residual[idx] > 0)
                .collect();
            return Err(GraphError::CycleDetected {
                tasks: registry.names(&stuck),
            });
        }
        Ok(registry.names(&order))
    }

    /// Run every task once, each after all of its dependencies.
    ///
    /// Independent tasks run in parallel. A failing task does not stop the
    /// round: tasks downstream of it are skipped, everything else runs, and
    /// the failure is reported once every unit has returned.
    pub async fn execute_all(&self) -> Result<RoundReport, GraphError> {
        let _round = self.round_lock.lock().await;
        self.scheduler.ensure_running()?;

        let order = self.topological_order()?;
        let units = self.prepare_units(&order)?;
        let generation = self.finished.reset_all();
        info!(generation, tasks = units.len(), "starting full round");
        self.run_round(units, generation).await
    }

    /// Re-run `start` and every task at or after it in topological order.
    ///
    /// Completions of tasks before `start` carry over from earlier rounds. If a
    /// re-run task depends on one of those that has not finished, nothing runs
    /// and [`GraphError::UnsatisfiedDependency`] is returned.
    pub async fn execute_from(&self, start: &str) -> Result<RoundReport, GraphError> {
        let _round = self.round_lock.lock().await;
        self.scheduler.ensure_running()?;

        let order = self.topological_order()?;
        let position = order
            .iter()
            .position(|name| name == start)
            .ok_or_else(|| GraphError::TaskNotFound(start.to_string()))?;
        let suffix = &order[position..];
        let units = self.prepare_units(suffix)?;

        let in_round: HashSet<&str> = suffix.iter().map(String::as_str).collect();
        for unit in &units {
            for dep in &unit.dependencies {
                if !in_round.contains(dep.as_str()) && !self.finished.contains(dep) {
                    return Err(GraphError::UnsatisfiedDependency {
                        task: unit.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let generation = self.finished.reset_only(suffix);
        info!(generation, start, tasks = units.len(), "starting incremental round");
        self.run_round(units, generation).await
    }

    fn prepare_units(&self, names: &[String]) -> Result<Vec<ExecutionUnit>, GraphError> {
        let registry = self.read_registry();
        names
            .iter()
            .map(|name| {
                let idx = resolve(&registry, name)?;
                let task = registry
                    .node(idx)
                    .map(|node| node.task().clone())
                    .ok_or_else(|| GraphError::TaskNotFound(name.clone()))?;
                Ok(ExecutionUnit {
                    name: name.clone(),
                    dependencies: registry.names(&registry.dependencies(idx)),
                    task,
                })
            })
            .collect()
    }

    async fn run_round(
        &self,
        units: Vec<ExecutionUnit>,
        generation: u64,
    ) -> Result<RoundReport, GraphError> {
        let started = Instant::now();
        let ctx = Arc::new(RoundContext {
            finished: self.finished.clone(),
            listeners: self.listeners.clone(),
            dispatch: self.scheduler.dispatch_queue(),
            permits: self.scheduler.permits(),
            generation,
            recheck: self.scheduler.config().dependency_wait_timeout,
        });

        let scheduled: Vec<String> = units.iter().map(|unit| unit.name.clone()).collect();
        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let span = debug_span!("task", name = %unit.name, generation);
            handles.push(self.scheduler.spawn(unit.run(ctx.clone()).instrument(span))?);
        }

        let results = join_all(handles).await;

        let mut report = RoundReport {
            generation,
            scheduled,
            ..RoundReport::default()
        };
        for (name, result) in report.scheduled.iter().zip(results) {
            match result {
                Ok(UnitResult::Ran(TaskOutcome::Succeeded)) => {}
                Ok(UnitResult::Ran(TaskOutcome::Failed(message))) => {
                    warn!(task = %name, %message, "task failed");
                    report.failed.push(TaskFailure {
                        task: name.clone(),
                        message,
                    });
                }
                Ok(UnitResult::Skipped { blocked_by }) => {
                    debug!(task = %name, %blocked_by, "task skipped");
                    report.skipped.push(name.clone());
                }
                Err(e) => {
                    warn!(task = %name, error = %e, "execution unit aborted");
                    report.failed.push(TaskFailure {
                        task: name.clone(),
                        message: format!("execution unit aborted: {e}"),
                    });
                }
            }
        }
        report.completed = self.finished.completion_log();
        report.duration = started.elapsed();

        info!(
            generation,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed = ?report.duration,
            "round finished"
        );

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(GraphError::ExecutionFailed(Box::new(report)))
        }
    }

    /// Tell every dependent of `source` that its state changed.
    ///
    /// Delivery is synchronous, on the calling thread, in the dependents'
    /// registration order. A dependent that answers [`Propagation::Forward`]
    /// has its own dependents notified before the next sibling, depth first.
    /// A task already on the current propagation path is not notified again,
    /// so a cycle cannot make this loop. Returns the number of deliveries.
    pub fn fire_task_state_changed(
        &self,
        source: &str,
        event: &TaskEvent,
    ) -> Result<usize, GraphError> {
        let mut stack = vec![Frame {
            source: source.to_string(),
            targets: self.dependents_snapshot(source)?,
            next: 0,
        }];
        let mut delivered = 0;

        while let Some(frame) = stack.last_mut() {
            let Some((target, task)) = frame.targets.get(frame.next).cloned() else {
                stack.pop();
                continue;
            };
            frame.next += 1;
            let from = frame.source.clone();

            if stack.iter().any(|frame| frame.source == target) {
                warn!(source = %from, target = %target, "state change loops back, not forwarding");
                continue;
            }

            delivered += 1;
            if task.on_dependent_task_state_changed(&from, event) == Propagation::Forward {
                let targets = self.dependents_snapshot(&target)?;
                if !targets.is_empty() {
                    stack.push(Frame {
                        source: target,
                        targets,
                        next: 0,
                    });
                }
            }
        }

        debug!(source, kind = event.kind(), delivered, "state change propagated");
        Ok(delivered)
    }

    fn dependents_snapshot(&self, name: &str) -> Result<Vec<(String, Arc<dyn Task>)>, GraphError> {
        let registry = self.read_registry();
        let idx = resolve(&registry, name)?;
        Ok(registry
            .dependents(idx)
            .into_iter()
            .filter_map(|dep| registry.node(dep))
            .map(|node| (node.name().to_string(), node.task().clone()))
            .collect())
    }

    pub fn add_task_execute_listener(&self, listener: Arc<dyn TaskExecuteListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Returns false if no listener was registered under `id`.
    pub fn remove_task_execute_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_names())
            .field("finished", &self.finished_tasks())
            .finish()
    }
}

fn resolve(registry: &NodeArena, name: &str) -> Result<NodeIndex, GraphError> {
    registry
        .lookup(name)
        .ok_or_else(|| GraphError::TaskNotFound(name.to_string()))
}

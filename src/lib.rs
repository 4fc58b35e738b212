//! # Task DAG
//!
//! A library for running named tasks in dependency order, in parallel where
//! the graph allows it.
//!
//! ## Features
//!
//! - Define tasks as traits with a single async `run` method
//! - Declare and remove "must finish before" edges at any time
//! - Cycle detection on every execution request
//! - Full rounds and incremental rounds ("from this task onward")
//! - State-change events pushed along dependency edges
//! - Prepared/finished listeners delivered in order off the execution path
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use task_dag::{DependencyGraph, FnTask, GraphError, Scheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GraphError> {
//!     let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default())?);
//!     let graph = DependencyGraph::new(scheduler.clone());
//!
//!     graph.add_task(FnTask::new("fetch", || async { Ok(()) }))?;
//!     graph.add_task(FnTask::new("build", || async { Ok(()) }))?;
//!     // "build" depends on "fetch"
//!     graph.bind_dependency("build", "fetch")?;
//!
//!     let report = graph.execute_all().await?;
//!     assert_eq!(report.completed, vec!["fetch", "build"]);
//!
//!     scheduler.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
mod gate;
pub mod graph;
pub mod listener;
pub mod logging;
pub mod node;
pub mod scheduler;
pub mod task;

use thiserror::Error;

pub use config::SchedulerConfig;
pub use graph::{DependencyGraph, RoundReport, TaskFailure};
pub use listener::{ListenerId, TaskExecuteListener, TaskOutcome};
pub use node::TaskNode;
pub use scheduler::Scheduler;
pub use task::{FnTask, Propagation, Task, TaskEvent};

/// Errors that can occur while building or executing a graph
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Cycle detected in graph among: {}", .tasks.join(", "))]
    CycleDetected { tasks: Vec<String> },
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),
    #[error("Task {task} depends on {dependency}, which has not finished and is not part of this round")]
    UnsatisfiedDependency { task: String, dependency: String },
    #[error("{} task(s) failed during execution", .0.failed.len())]
    ExecutionFailed(Box<RoundReport>),
    #[error("Scheduler has been shut down")]
    SchedulerShutdown,
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

//! Scheduler configuration.
//!
//! Values come from [`SchedulerConfig::default`], optionally overridden by
//! environment variables ([`SchedulerConfig::from_env`]) and the `with_*`
//! builder methods.

use std::thread;
use std::time::Duration;

use crate::GraphError;

pub const ENV_WORKERS: &str = "TASK_DAG_WORKERS";
pub const ENV_MAX_CONCURRENT: &str = "TASK_DAG_MAX_CONCURRENT";
pub const ENV_WAIT_TIMEOUT_MS: &str = "TASK_DAG_WAIT_TIMEOUT_MS";
pub const ENV_THREAD_NAME: &str = "TASK_DAG_THREAD_NAME";

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Worker threads in the task pool.
    pub worker_threads: usize,
    /// Upper bound on task bodies running at the same time.
    pub max_concurrent_tasks: usize,
    /// How long a unit waits on the finished set before re-checking and
    /// logging that it is still blocked.
    pub dependency_wait_timeout: Duration,
    /// Name prefix for worker threads; the listener thread gets `-listener`.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_threads: workers,
            max_concurrent_tasks: workers.saturating_mul(2),
            dependency_wait_timeout: DEFAULT_WAIT_TIMEOUT,
            thread_name: "task-dag".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by the `TASK_DAG_*` environment variables.
    pub fn from_env() -> Result<Self, GraphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(workers) = parse_var(&lookup, ENV_WORKERS)? {
            config.worker_threads = workers;
            config.max_concurrent_tasks = workers.saturating_mul(2);
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_CONCURRENT)? {
            config.max_concurrent_tasks = max;
        }
        if let Some(ms) = parse_var(&lookup, ENV_WAIT_TIMEOUT_MS)? {
            config.dependency_wait_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(name) = lookup(ENV_THREAD_NAME) {
            config.thread_name = name;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_dependency_wait_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_wait_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.worker_threads == 0 {
            return Err(GraphError::InvalidArgument(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(GraphError::InvalidArgument(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.dependency_wait_timeout.is_zero() {
            return Err(GraphError::InvalidArgument(
                "dependency_wait_timeout must be non-zero".to_string(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(GraphError::InvalidArgument(
                "thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<usize>, GraphError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| GraphError::InvalidArgument(format!("{key}={raw:?}: {e}"))),
    }
}

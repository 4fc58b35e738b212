//! The concurrency substrate: a worker pool for task bodies and a single
//! listener thread.
//!
//! A [`Scheduler`] is built explicitly, shared by the graphs that use it and
//! shut down explicitly (or on drop).

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::GraphError;
use crate::config::SchedulerConfig;
use crate::listener::{ExecutionEvent, TaskExecuteListener};

/// One event plus the listeners registered when it happened.
struct Dispatch {
    listeners: Vec<Arc<dyn TaskExecuteListener>>,
    event: ExecutionEvent,
}

/// Sending side of the listener thread's queue.
pub(crate) struct DispatchQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
}

impl DispatchQueue {
    pub(crate) fn submit(&self, listeners: Vec<Arc<dyn TaskExecuteListener>>, event: ExecutionEvent) {
        if listeners.is_empty() {
            return;
        }
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Dispatch { listeners, event }).is_err() {
                    debug!("listener thread gone, dropping event");
                }
            }
            None => debug!(?event, "scheduler shut down, dropping event"),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn deliver_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = rx.blocking_recv() {
        for listener in &dispatch.listeners {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| dispatch.event.deliver(listener.as_ref())));
            if delivered.is_err() {
                error!(event = ?dispatch.event, "listener panicked");
            }
        }
    }
    debug!("listener queue closed");
}

/// Owned worker pool plus listener thread.
///
/// Task bodies run on a dedicated multi-thread runtime with
/// `worker_threads` workers; at most `max_concurrent_tasks` of them run at
/// once. Listener callbacks run one at a time on their own thread.
pub struct Scheduler {
    config: SchedulerConfig,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    permits: Arc<Semaphore>,
    dispatch: Arc<DispatchQueue>,
    listener_thread: Mutex<Option<thread::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, GraphError> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(format!("{}-worker", config.thread_name))
            .enable_all()
            .build()
            .map_err(|e| GraphError::Scheduler(format!("failed to build worker pool: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let listener_thread = thread::Builder::new()
            .name(format!("{}-listener", config.thread_name))
            .spawn(move || deliver_loop(rx))
            .map_err(|e| GraphError::Scheduler(format!("failed to start listener thread: {e}")))?;

        info!(
            workers = config.worker_threads,
            max_concurrent = config.max_concurrent_tasks,
            "scheduler started"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            dispatch: Arc::new(DispatchQueue {
                tx: Mutex::new(Some(tx)),
            }),
            listener_thread: Mutex::new(Some(listener_thread)),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Scheduler configured from the `TASK_DAG_*` environment variables.
    pub fn from_env() -> Result<Self, GraphError> {
        Self::new(SchedulerConfig::from_env()?)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the scheduler.
    ///
    /// Listener events already queued are delivered before this returns.
    /// Tasks still running on the pool are detached. Later execution
    /// requests fail with [`GraphError::SchedulerShutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.dispatch.close();
        let listener_thread = self
            .listener_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = listener_thread {
            // Called from a listener callback: the thread exits on its own.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("listener thread panicked");
            }
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        info!("scheduler shut down");
    }

    pub(crate) fn ensure_running(&self) -> Result<(), GraphError> {
        if self.is_shut_down() {
            return Err(GraphError::SchedulerShutdown);
        }
        Ok(())
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, GraphError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.handle.spawn(future))
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    pub(crate) fn dispatch_queue(&self) -> Arc<DispatchQueue> {
        self.dispatch.clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

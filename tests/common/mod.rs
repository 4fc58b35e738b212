#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_dag::{DependencyGraph, GraphError, Scheduler, SchedulerConfig, Task};

pub type Log = Arc<Mutex<Vec<String>>>;

/// Appends "start:NAME" / "end:NAME" to a shared log around a short sleep and
/// counts how often it ran.
#[derive(Debug)]
pub struct Recorder {
    pub name: String,
    pub log: Log,
    pub runs: AtomicUsize,
    pub delay: Duration,
}

impl Recorder {
    pub fn new(name: impl Into<String>, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log: log.clone(),
            runs: AtomicUsize::new(0),
            delay: Duration::from_millis(2),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Task for Recorder {
    async fn run(&self) -> Result<(), GraphError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("start:{}", self.name));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("end:{}", self.name));
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

pub fn scheduler() -> Arc<Scheduler> {
    let config = SchedulerConfig::default()
        .with_worker_threads(4)
        .with_dependency_wait_timeout(Duration::from_millis(50));
    Arc::new(Scheduler::new(config).unwrap())
}

pub fn graph() -> DependencyGraph {
    DependencyGraph::new(scheduler())
}

/// Register one recorder per name.
pub fn recorders(graph: &DependencyGraph, names: &[&str], log: &Log) -> Vec<Arc<Recorder>> {
    names
        .iter()
        .map(|name| {
            let recorder = Recorder::new(*name, log);
            graph.add_shared_task(recorder.clone()).unwrap();
            recorder
        })
        .collect()
}

pub fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
}

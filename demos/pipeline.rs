//! Build-pipeline example demonstrating:
//! - Flow: fetch -> compile_a, compile_b -> link -> package
//! - compile_a and compile_b run in parallel with random durations
//! - A listener prints prepared/finished events from its own thread
//! - A state change on `fetch` is pushed to everything downstream
//! - An incremental round re-runs `link` and `package` only

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use task_dag::{
    DependencyGraph, FnTask, GraphError, Propagation, Scheduler, SchedulerConfig, Task,
    TaskEvent, TaskExecuteListener, TaskOutcome, logging,
};
use tokio::time::sleep;

/// Compile step that sleeps for a random time
#[derive(Debug)]
struct Compile(&'static str);

#[async_trait::async_trait]
impl Task for Compile {
    async fn run(&self) -> Result<(), GraphError> {
        let millis = rand::rng().random_range(100..600);
        println!("🔨 {}: compiling for {millis}ms", self.0);
        sleep(Duration::from_millis(millis)).await;
        println!("✅ {}: done", self.0);
        Ok(())
    }

    fn name(&self) -> String {
        self.0.to_string()
    }

    fn on_dependent_task_state_changed(&self, source: &str, event: &TaskEvent) -> Propagation {
        println!("📣 {}: {source} is {}", self.0, event.kind());
        Propagation::Forward
    }
}

struct Printer;

impl TaskExecuteListener for Printer {
    fn on_task_prepared(&self, task: &str) {
        println!("▶️  {task} prepared");
    }

    fn on_task_finished(&self, task: &str, outcome: &TaskOutcome) {
        println!("⏹️  {task} finished: {outcome:?}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init_logging(None)?;

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::from_env()?)?);
    let graph = DependencyGraph::new(scheduler.clone());

    graph.add_task(FnTask::new("fetch", || async {
        println!("🚀 fetch: pulling sources");
        sleep(Duration::from_millis(200)).await;
        Ok(())
    }))?;
    graph.add_task(Compile("compile_a"))?;
    graph.add_task(Compile("compile_b"))?;
    graph.add_task(FnTask::new("link", || async {
        println!("🔗 link");
        Ok(())
    }))?;
    graph.add_task(FnTask::noop("package"))?;

    graph.bind_dependency("compile_a", "fetch")?;
    graph.bind_dependency("compile_b", "fetch")?;
    graph.bind_dependency("link", "compile_a")?;
    graph.bind_dependency("link", "compile_b")?;
    graph.bind_dependency("package", "link")?;

    graph.add_task_execute_listener(Arc::new(Printer));

    println!("order: {:?}", graph.topological_order()?);
    let report = graph.execute_all().await?;
    println!("completed in {:?}: {:?}", report.duration, report.completed);

    let delivered = graph.fire_task_state_changed("fetch", &TaskEvent::new("stale"))?;
    println!("state change delivered {delivered} time(s)");

    let report = graph.execute_from("link").await?;
    println!("incremental round: {:?}", report.completed);

    scheduler.shutdown();
    Ok(())
}

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use task_dag::{
    DependencyGraph, FnTask, GraphError, Scheduler, SchedulerConfig, TaskExecuteListener,
    TaskOutcome,
};

use common::{Log, graph, position, recorders};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn three_node_scenario_orders_a_b_c() -> TestResult {
    let log = Log::default();
    let graph = graph();
    recorders(&graph, &["A", "B", "C"], &log);
    graph.bind_dependency("B", "A")?;
    graph.bind_dependency("C", "A")?;
    graph.bind_dependency("C", "B")?;

    let report = graph.execute_all().await?;
    assert_eq!(report.scheduled, vec!["A", "B", "C"]);
    assert_eq!(report.completed, vec!["A", "B", "C"]);
    Ok(())
}

#[tokio::test]
async fn two_node_cycle_runs_nothing() -> TestResult {
    let log = Log::default();
    let graph = graph();
    let tasks = recorders(&graph, &["X", "Y"], &log);
    graph.bind_dependency("X", "Y")?;
    graph.bind_dependency("Y", "X")?;

    for _ in 0..3 {
        let result = graph.execute_all().await;
        assert!(matches!(result, Err(GraphError::CycleDetected { .. })));
        let result = graph.execute_from("X").await;
        assert!(matches!(result, Err(GraphError::CycleDetected { .. })));
    }
    assert!(tasks.iter().all(|t| t.runs() == 0));
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn random_acyclic_graphs_run_each_task_once_in_order() -> TestResult {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..10 {
        let log = Log::default();
        let graph = graph();
        let size = rng.random_range(2..16);
        let names: Vec<String> = (0..size).map(|i| format!("t{i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let tasks = recorders(&graph, &name_refs, &log);

        // edges only from higher to lower index keep the graph acyclic
        let mut edges = Vec::new();
        for from in 1..size {
            for to in 0..from {
                if rng.random_bool(0.3) {
                    graph.bind_dependency(&names[from], &names[to])?;
                    edges.push((from, to));
                }
            }
        }

        graph.execute_all().await?;

        assert!(tasks.iter().all(|t| t.runs() == 1));
        let log = log.lock().unwrap().clone();
        for (from, to) in edges {
            assert!(
                position(&log, &format!("end:{}", names[to]))
                    < position(&log, &format!("start:{}", names[from])),
                "{} started before {} ended",
                names[from],
                names[to]
            );
        }
    }
    Ok(())
}

fn nine_node_graph(graph: &DependencyGraph, log: &Log) -> TestResult {
    recorders(
        graph,
        &["src", "left", "right", "mid", "fan1", "fan2", "fan3", "join", "sink"],
        log,
    );
    graph.bind_dependency("left", "src")?;
    graph.bind_dependency("right", "src")?;
    graph.bind_dependency("mid", "left")?;
    graph.bind_dependency("mid", "right")?;
    graph.bind_dependency("fan1", "mid")?;
    graph.bind_dependency("fan2", "mid")?;
    graph.bind_dependency("fan3", "mid")?;
    graph.bind_dependency("join", "fan1")?;
    graph.bind_dependency("join", "fan2")?;
    graph.bind_dependency("join", "fan3")?;
    graph.bind_dependency("sink", "join")?;
    graph.bind_dependency("sink", "left")?;
    Ok(())
}

#[tokio::test]
async fn nine_node_graph_orders_consistently() -> TestResult {
    let log = Log::default();
    let graph = graph();
    nine_node_graph(&graph, &log)?;

    let first = graph.topological_order()?;
    assert_eq!(
        first,
        vec!["src", "left", "right", "mid", "fan1", "fan2", "fan3", "join", "sink"]
    );
    for _ in 0..5 {
        let report = graph.execute_all().await?;
        assert_eq!(report.scheduled, first);
        assert_eq!(report.completed.first().map(String::as_str), Some("src"));
        assert_eq!(report.completed.last().map(String::as_str), Some("sink"));
    }
    Ok(())
}

#[tokio::test]
async fn execute_from_reruns_only_the_suffix() -> TestResult {
    let log = Log::default();
    let graph = graph();
    let tasks = recorders(&graph, &["A", "B", "C", "D"], &log);
    graph.bind_dependency("B", "A")?;
    graph.bind_dependency("C", "B")?;
    graph.bind_dependency("D", "C")?;

    graph.execute_all().await?;
    log.lock().unwrap().clear();

    let report = graph.execute_from("C").await?;
    assert_eq!(report.scheduled, vec!["C", "D"]);
    assert_eq!(report.completed, vec!["C", "D"]);

    let runs: Vec<usize> = tasks.iter().map(|t| t.runs()).collect();
    assert_eq!(runs, vec![1, 1, 2, 2]);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start:C", "end:C", "start:D", "end:D"]
    );
    assert_eq!(graph.finished_tasks(), vec!["A", "B", "C", "D"]);
    Ok(())
}

#[tokio::test]
async fn execute_from_reruns_later_siblings_but_not_earlier_ones() -> TestResult {
    let log = Log::default();
    let graph = graph();
    let tasks = recorders(&graph, &["root", "early", "X", "late"], &log);
    // early, X and late all depend only on root
    graph.bind_dependency("early", "root")?;
    graph.bind_dependency("X", "root")?;
    graph.bind_dependency("late", "root")?;
    assert_eq!(graph.topological_order()?, vec!["root", "early", "X", "late"]);

    graph.execute_all().await?;
    let report = graph.execute_from("X").await?;
    assert_eq!(report.scheduled, vec!["X", "late"]);

    let runs: Vec<usize> = tasks.iter().map(|t| t.runs()).collect();
    assert_eq!(runs, vec![1, 1, 2, 2]);
    assert!(graph.is_finished("early"));
    Ok(())
}

#[tokio::test]
async fn edges_may_change_between_rounds() -> TestResult {
    let log = Log::default();
    let graph = graph();
    recorders(&graph, &["A", "B"], &log);
    graph.bind_dependency("B", "A")?;
    assert_eq!(graph.execute_all().await?.scheduled, vec!["A", "B"]);

    graph.unbind_dependency("B", "A")?;
    graph.bind_dependency("A", "B")?;
    assert_eq!(graph.execute_all().await?.scheduled, vec!["B", "A"]);
    Ok(())
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<(String, Option<String>)>>,
}

impl TaskExecuteListener for EventLog {
    fn on_task_prepared(&self, task: &str) {
        let thread = thread::current().name().map(str::to_string);
        self.events
            .lock()
            .unwrap()
            .push((format!("prepared:{task}"), thread));
    }

    fn on_task_finished(&self, task: &str, outcome: &TaskOutcome) {
        let thread = thread::current().name().map(str::to_string);
        self.events
            .lock()
            .unwrap()
            .push((format!("finished:{task}:{}", outcome.is_success()), thread));
    }
}

#[tokio::test]
async fn listeners_see_prepared_before_finished_off_the_workers() -> TestResult {
    let config = SchedulerConfig::default()
        .with_worker_threads(3)
        .with_thread_name("scn");
    let scheduler = Arc::new(Scheduler::new(config)?);
    let graph = DependencyGraph::new(scheduler.clone());
    let log = Log::default();
    recorders(&graph, &["a", "b", "c"], &log);
    graph.bind_dependency("c", "a")?;
    graph.bind_dependency("c", "b")?;

    let listener = Arc::new(EventLog::default());
    let removed = Arc::new(EventLog::default());
    graph.add_task_execute_listener(listener.clone());
    let removed_id = graph.add_task_execute_listener(removed.clone());
    assert!(graph.remove_task_execute_listener(removed_id));

    graph.execute_all().await?;
    // delivers everything still queued
    scheduler.shutdown();

    let events = listener.events.lock().unwrap().clone();
    assert_eq!(events.len(), 6);
    assert!(
        events
            .iter()
            .all(|(_, thread)| thread.as_deref() == Some("scn-listener"))
    );
    let names: Vec<String> = events.into_iter().map(|(e, _)| e).collect();
    for task in ["a", "b", "c"] {
        assert!(
            position(&names, &format!("prepared:{task}"))
                < position(&names, &format!("finished:{task}:true"))
        );
    }
    assert!(position(&names, "finished:a:true") < position(&names, "prepared:c"));
    assert!(removed.events.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn same_listener_registered_twice_hears_each_event_once() -> TestResult {
    let scheduler = common::scheduler();
    let graph = DependencyGraph::new(scheduler.clone());
    graph.add_task(FnTask::noop("a"))?;

    let listener = Arc::new(EventLog::default());
    let first = graph.add_task_execute_listener(listener.clone());
    let second = graph.add_task_execute_listener(listener.clone());
    assert_eq!(first, second);

    graph.execute_all().await?;
    scheduler.shutdown();

    let names: Vec<String> = listener
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|(e, _)| e.clone())
        .collect();
    assert_eq!(names, vec!["prepared:a", "finished:a:true"]);
    Ok(())
}

#[tokio::test]
async fn concurrency_limit_is_respected() -> TestResult {
    let config = SchedulerConfig::default()
        .with_worker_threads(4)
        .with_max_concurrent_tasks(1);
    let graph = DependencyGraph::new(Arc::new(Scheduler::new(config)?));

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for i in 0..6 {
        let running = running.clone();
        let peak = peak.clone();
        graph.add_task(FnTask::new(format!("t{i}"), move || {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }))?;
    }

    let report = graph.execute_all().await?;
    assert_eq!(report.completed.len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn slow_dependency_outlasts_the_recheck_timeout() -> TestResult {
    let config = SchedulerConfig::default()
        .with_worker_threads(2)
        .with_dependency_wait_timeout(Duration::from_millis(5));
    let graph = DependencyGraph::new(Arc::new(Scheduler::new(config)?));
    graph.add_task(FnTask::new("slow", || async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        Ok(())
    }))?;
    graph.add_task(FnTask::noop("after"))?;
    graph.bind_dependency("after", "slow")?;

    let report = graph.execute_all().await?;
    assert_eq!(report.completed, vec!["slow", "after"]);
    Ok(())
}

#[test]
fn rounds_can_be_driven_without_an_ambient_runtime() -> TestResult {
    let graph = graph();
    let seen = Arc::new(Mutex::new(HashSet::new()));
    for name in ["one", "two"] {
        let seen = seen.clone();
        graph.add_task(FnTask::new(name, move || {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().insert(name);
                Ok(())
            }
        }))?;
    }
    graph.bind_dependency("two", "one")?;

    let report = tokio_test::block_on(graph.execute_all())?;
    assert_eq!(report.completed, vec!["one", "two"]);
    assert_eq!(seen.lock().unwrap().len(), 2);
    Ok(())
}

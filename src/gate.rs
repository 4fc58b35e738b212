//! The finished set: which tasks have settled in the current round.
//!
//! Every change is broadcast over a watch channel and each waiter re-checks
//! its own dependencies on wake-up. Marks carry the round generation that
//! produced them; marks from a stale round are ignored.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct Settled {
    generation: u64,
    finished: HashSet<String>,
    /// Tasks that failed or were skipped in the generation that scheduled them.
    blocked: HashSet<String>,
    completion_log: Vec<String>,
}

impl Settled {
    fn is_settled(&self, name: &str) -> bool {
        self.finished.contains(name) || self.blocked.contains(name)
    }

    fn all_settled(&self, deps: &[String]) -> bool {
        deps.iter().all(|dep| self.is_settled(dep))
    }

    fn first_blocked(&self, deps: &[String]) -> Option<String> {
        deps.iter().find(|dep| !self.finished.contains(*dep)).cloned()
    }
}

/// Result of waiting on the gate for a set of dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DependencyState {
    /// Every dependency finished successfully
    Satisfied,
    /// The named dependency failed or was skipped
    Blocked(String),
}

#[derive(Debug)]
pub(crate) struct FinishedSet {
    tx: watch::Sender<Settled>,
}

impl FinishedSet {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(Settled::default()),
        }
    }

    /// Start a full round: forget every completion.
    pub(crate) fn reset_all(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|settled| {
            settled.generation += 1;
            settled.finished.clear();
            settled.blocked.clear();
            settled.completion_log.clear();
            generation = settled.generation;
        });
        generation
    }

    /// Start an incremental round: forget only the tasks about to re-run.
    pub(crate) fn reset_only(&self, names: &[String]) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|settled| {
            settled.generation += 1;
            for name in names {
                settled.finished.remove(name);
                settled.blocked.remove(name);
            }
            settled.completion_log.clear();
            generation = settled.generation;
        });
        generation
    }

    pub(crate) fn mark_finished(&self, name: &str, generation: u64) {
        self.mark(name, generation, true);
    }

    pub(crate) fn mark_blocked(&self, name: &str, generation: u64) {
        self.mark(name, generation, false);
    }

    fn mark(&self, name: &str, generation: u64, finished: bool) {
        self.tx.send_if_modified(|settled| {
            if settled.generation != generation {
                debug!(task = name, generation, current = settled.generation, "ignoring stale completion");
                return false;
            }
            if finished {
                settled.finished.insert(name.to_string());
                settled.completion_log.push(name.to_string());
            } else {
                settled.blocked.insert(name.to_string());
            }
            true
        });
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.tx.borrow().finished.contains(name)
    }

    /// Names currently in the finished set, sorted.
    pub(crate) fn finished(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tx.borrow().finished.iter().cloned().collect();
        names.sort();
        names
    }

    /// Tasks that finished in the current generation, in completion order.
    pub(crate) fn completion_log(&self) -> Vec<String> {
        self.tx.borrow().completion_log.clone()
    }

    /// Wait until every dependency has settled.
    ///
    /// Wake-ups come from the broadcast on every change. `recheck` bounds each
    /// wait so a long stall shows up in the logs; an elapsed wait is retried.
    pub(crate) async fn wait_for(
        &self,
        task: &str,
        deps: &[String],
        recheck: Duration,
    ) -> DependencyState {
        let mut rx = self.tx.subscribe();
        let mut timeouts = 0u32;
        loop {
            let waited = tokio::time::timeout(recheck, rx.wait_for(|s| s.all_settled(deps))).await;
            match waited {
                Ok(Ok(settled)) => {
                    return match settled.first_blocked(deps) {
                        Some(dep) => DependencyState::Blocked(dep),
                        None => DependencyState::Satisfied,
                    };
                }
                // `self` owns the sender and is borrowed for the whole wait.
                Ok(Err(_)) => unreachable!("finished set closed while a task was waiting"),
                Err(_) => {
                    timeouts += 1;
                    debug!(task, timeouts, "WaitTimeout while waiting for dependencies; rechecking");
                }
            }
        }
    }
}

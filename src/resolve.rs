use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::TaskError;
use crate::task::{Outcome, Task};

// The shared slot between a producer and its waiters.
enum DepSlot {
    Pending,
    Done(Result<Outcome, String>),
    /// The promise was dropped without fulfilling.
    Abandoned,
}

pub(crate) struct DepCell {
    slot: Mutex<DepSlot>,
    ready: Condvar,
}

impl DepCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(DepSlot::Pending),
            ready: Condvar::new(),
        })
    }
}

/// The producer side of an asynchronous dependency.
///
/// Whoever runs the computation keeps the promise and fulfills it once; the
/// promise owns the result. Waiters holding a [`DependencyHandle`] fail with
/// a dependency failure if the promise is dropped before they observe it.
pub struct DepPromise {
    cell: Arc<DepCell>,
}

impl DepPromise {
    pub fn new() -> Self {
        Self {
            cell: DepCell::new(),
        }
    }

    pub(crate) fn from_cell(cell: Arc<DepCell>) -> Self {
        Self { cell }
    }

    /// A weak handle a task can wait on. The task never owns the lifecycle
    /// of the computation, only observes its result.
    pub fn handle(&self) -> DependencyHandle {
        DependencyHandle {
            cell: Arc::downgrade(&self.cell),
        }
    }

    /// Publishes the result and wakes all waiters. The first call wins;
    /// later calls are ignored.
    pub fn fulfill(&self, result: Result<Outcome, String>) {
        let mut slot = self.cell.slot.lock().unwrap();
        if matches!(*slot, DepSlot::Pending) {
            *slot = DepSlot::Done(result);
            self.cell.ready.notify_all();
        }
    }
}

impl Default for DepPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DepPromise {
    fn drop(&mut self) {
        let mut slot = self.cell.slot.lock().unwrap();
        if matches!(*slot, DepSlot::Pending) {
            *slot = DepSlot::Abandoned;
            self.cell.ready.notify_all();
        }
    }
}

/// A weak reference to an externally-submitted asynchronous computation.
#[derive(Clone)]
pub struct DependencyHandle {
    cell: Weak<DepCell>,
}

#[derive(Debug)]
pub(crate) enum WaitError {
    /// The producer side no longer exists.
    Gone,
    /// The remaining deadline budget ran out before the result arrived.
    TimedOut,
    /// The producer reported a failure.
    Failed(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Gone => write!(f, "producer no longer exists"),
            WaitError::TimedOut => write!(f, "wait exceeded the remaining deadline budget"),
            WaitError::Failed(msg) => write!(f, "producer failed: {msg}"),
        }
    }
}

impl DependencyHandle {
    pub(crate) fn from_weak(cell: Weak<DepCell>) -> Self {
        Self { cell }
    }

    /// Blocks until the producer publishes a result, the optional budget runs
    /// out or the producer disappears.
    pub(crate) fn wait(&self, budget: Option<Duration>) -> Result<Outcome, WaitError> {
        let Some(cell) = self.cell.upgrade() else {
            return Err(WaitError::Gone);
        };

        let deadline = budget.map(|budget| Instant::now() + budget);
        let mut slot = cell.slot.lock().unwrap();

        loop {
            match &*slot {
                DepSlot::Done(Ok(outcome)) => return Ok(outcome.clone()),
                DepSlot::Done(Err(msg)) => return Err(WaitError::Failed(msg.clone())),
                DepSlot::Abandoned => return Err(WaitError::Gone),
                DepSlot::Pending => {}
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::TimedOut);
                    }
                    let (next, _) = cell.ready.wait_timeout(slot, deadline - now).unwrap();
                    slot = next;
                }
                None => slot = cell.ready.wait(slot).unwrap(),
            }
        }
    }
}

/// Resolves a task's declared dependencies before it runs.
///
/// Handles are waited on in declaration order. If the task has a deadline,
/// the remaining budget is computed anew for each wait so a single slow
/// dependency cannot exceed the task's overall timeout. Every dependency is
/// attempted even after a failure; values that did resolve stay in the output
/// map and are not rolled back.
pub(crate) fn resolve_dependencies<R>(task: &mut Task<R>) -> Result<(), TaskError> {
    if task.dependencies.is_empty() {
        return Ok(());
    }

    let mut failed = Vec::new();

    for (name, handle) in &task.dependencies {
        let budget = task.token.remaining();
        debug!(task = task.name.as_str(), dependency = name.as_str(), "waiting on dependency");

        match handle.wait(budget) {
            Ok(outcome) => {
                task.outputs.insert(name.clone(), outcome);
            }
            Err(err) => {
                error!(
                    task = task.name.as_str(),
                    dependency = name.as_str(),
                    "dependency failed: {err}",
                );
                failed.push(name.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(TaskError::Dependency {
            task: task.name.clone(),
            failed,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{Inputs, TaskContext};

    fn leaf(name: &str) -> Task<()> {
        Task::new(name, |_: &mut (), _: &TaskContext, _: &Inputs| Ok(Outcome::Null))
    }

    #[test]
    fn wait_returns_prefilled_value() {
        let promise = DepPromise::new();
        let handle = promise.handle();
        promise.fulfill(Ok(serde_json::json!(42)));

        let outcome = handle.wait(None).unwrap();
        assert_eq!(outcome, serde_json::json!(42));
    }

    #[test]
    fn wait_times_out_on_slow_producer() {
        let promise = DepPromise::new();
        let handle = promise.handle();

        let result = handle.wait(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(WaitError::TimedOut)));
    }

    #[test]
    fn wait_observes_cross_thread_fulfillment() {
        let promise = DepPromise::new();
        let handle = promise.handle();

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.fulfill(Ok(serde_json::json!("late")));
            // Keep the promise alive until fulfillment is observable.
            std::thread::sleep(Duration::from_millis(50));
        });

        let outcome = handle.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, serde_json::json!("late"));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_promise_is_reported_as_gone() {
        let promise = DepPromise::new();
        let handle = promise.handle();
        drop(promise);

        assert!(matches!(handle.wait(None), Err(WaitError::Gone)));
    }

    #[test]
    fn resolution_keeps_partial_results_on_failure() {
        let good = DepPromise::new();
        good.fulfill(Ok(serde_json::json!("ok")));
        let bad = DepPromise::new();
        bad.fulfill(Err("exploded".to_string()));

        let mut task = leaf("consumer")
            .with_dependency("good", good.handle())
            .with_dependency("bad", bad.handle());

        let err = resolve_dependencies(&mut task).unwrap_err();
        match err {
            TaskError::Dependency { failed, .. } => assert_eq!(failed, vec!["bad".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(task.output("good"), Some(&serde_json::json!("ok")));
        assert_eq!(task.output("bad"), None);
    }

    #[test]
    fn every_dependency_is_attempted() {
        let first = DepPromise::new();
        first.fulfill(Err("nope".to_string()));
        let second = DepPromise::new();
        second.fulfill(Ok(serde_json::json!(1)));

        let mut task = leaf("consumer")
            .with_dependency("first", first.handle())
            .with_dependency("second", second.handle());

        assert!(resolve_dependencies(&mut task).is_err());
        assert_eq!(task.output("second"), Some(&serde_json::json!(1)));
    }
}

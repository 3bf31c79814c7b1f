use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::TaskError;
use crate::task::{Task, TaskState};

/// Shared completed/failed tallies for a tree of tasks.
///
/// The two counters are shared by reference: cloning the struct yields another
/// view over the same atomics. Each terminal transition of a task increments
/// exactly one of the two, exactly once.
///
/// Attaching counters to a task propagates the same shared pair to every child
/// attached *at that moment*; children added afterwards do not inherit them.
#[derive(Clone, Default)]
pub struct ProgressCounters {
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ProgressCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressCounters")
            .field("completed", &self.completed())
            .field("failed", &self.failed())
            .finish()
    }
}

/// Snapshot passed to every lifecycle callback.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleEvent<'a> {
    pub task: &'a str,
    pub state: TaskState,
}

type CallbackFn = Box<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// A lifecycle hook attached to a single task.
///
/// Hooks fire in a fixed order: `BeforeStart` before the resource scope opens
/// (an error there aborts the run before any resource is acquired and counts
/// as a failure), then `OnSuccess` or `OnFailure` (mutually exclusive), then
/// `AfterFinish` regardless of outcome. Within one stage, hooks run in
/// registration order. Hooks are run-local and never serialized.
pub enum Callback {
    BeforeStart(CallbackFn),
    OnSuccess(CallbackFn),
    OnFailure(CallbackFn),
    AfterFinish(CallbackFn),
}

impl Callback {
    pub fn before_start<F>(fun: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::BeforeStart(Box::new(fun))
    }

    pub fn on_success<F>(fun: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::OnSuccess(Box::new(fun))
    }

    pub fn on_failure<F>(fun: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::OnFailure(Box::new(fun))
    }

    pub fn after_finish<F>(fun: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::AfterFinish(Box::new(fun))
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callback::BeforeStart(_) => write!(f, "Callback::BeforeStart(*)"),
            Callback::OnSuccess(_) => write!(f, "Callback::OnSuccess(*)"),
            Callback::OnFailure(_) => write!(f, "Callback::OnFailure(*)"),
            Callback::AfterFinish(_) => write!(f, "Callback::AfterFinish(*)"),
        }
    }
}

/// Fires the `BeforeStart` hooks. The first error wins and aborts the run.
pub(crate) fn fire_before_start<R>(task: &Task<R>) -> anyhow::Result<()> {
    let event = LifecycleEvent {
        task: task.name(),
        state: task.state(),
    };

    for callback in &task.callbacks {
        if let Callback::BeforeStart(fun) = callback {
            fun(&event)?;
        }
    }

    Ok(())
}

/// Fires the terminal stage: counter, `OnSuccess`/`OnFailure`, the exception
/// handler and `AfterFinish`. Called exactly once per run. Errors raised by
/// terminal hooks cannot change the outcome any more and are only logged.
pub(crate) fn dispatch_terminal<R>(task: &Task<R>, result: &Result<crate::task::Outcome, TaskError>) {
    if let Some(counters) = &task.counters {
        match result {
            Ok(_) => counters.mark_completed(),
            Err(_) => counters.mark_failed(),
        }
    }

    let event = LifecycleEvent {
        task: task.name(),
        state: task.state(),
    };

    for callback in &task.callbacks {
        let outcome = match (callback, result) {
            (Callback::OnSuccess(fun), Ok(_)) => fun(&event),
            (Callback::OnFailure(fun), Err(_)) => fun(&event),
            _ => Ok(()),
        };

        if let Err(err) = outcome {
            warn!(task = event.task, error = %err, "lifecycle callback failed");
        }
    }

    if let Err(err) = result {
        if let Some(handler) = &task.exception_handler {
            handler(err);
        }
    }

    for callback in &task.callbacks {
        if let Callback::AfterFinish(fun) = callback {
            if let Err(err) = fun(&event) {
                warn!(task = event.task, error = %err, "after-finish callback failed");
            }
        }
    }
}

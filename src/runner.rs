use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};

use tracing::{Level, debug, error};

use crate::compose;
use crate::error::TaskError;
use crate::progress::{dispatch_terminal, fire_before_start};
use crate::resolve::{DepCell, DepPromise, DependencyHandle, resolve_dependencies};
use crate::scope::{ResourceProvider, ResourceScope};
use crate::task::{Outcome, Task, TaskContext, TaskState};

/// How a task's children are composed. Selected by the adapter the tree was
/// submitted through and propagated recursively; the two strategies are
/// mutually exclusive within one run.
#[derive(Clone, Copy)]
pub(crate) enum Composition {
    Sequential,
    ForkJoin,
}

// Fires BeforeStart prior to any resource acquisition, arms the deadline and
// marks the task running.
fn begin<R>(task: &mut Task<R>) -> Result<(), TaskError> {
    if let Err(err) = fire_before_start(task) {
        return Err(TaskError::execution(&task.name, err));
    }

    task.token.arm(task.timeout);
    task.state = TaskState::Running;
    Ok(())
}

// The single terminal transition of a run: records the state, increments
// exactly one shared counter and fires the terminal callbacks.
fn settle<R>(
    task: &mut Task<R>,
    result: Result<Outcome, TaskError>,
) -> Result<Outcome, TaskError> {
    task.state = match &result {
        Ok(_) => TaskState::Succeeded,
        Err(TaskError::Cancelled { reason, .. }) => match reason {
            crate::error::CancelReason::Terminated => TaskState::Terminated,
            crate::error::CancelReason::DeadlineExceeded => TaskState::TimedOut,
        },
        Err(_) => TaskState::Failed,
    };

    if let Ok(outcome) = &result {
        task.outcome = Some(outcome.clone());
    }

    dispatch_terminal(task, &result);
    result
}

// Dependency resolution, child composition and the task's own work function,
// inside an already-open resource scope. A failure at any step skips all
// later steps.
fn run_in_scope<R>(
    task: &mut Task<R>,
    resource: &mut R,
    provider: &dyn ResourceProvider<R>,
    mode: Composition,
) -> Result<Outcome, TaskError> {
    resolve_dependencies(task)?;

    if task.run_children_first {
        compose_children(task, resource, provider, mode)?;
    }

    // A terminated or timed-out task must not run its work function.
    task.token.checked(&task.name)?;

    let span = tracing::span!(Level::DEBUG, "work", task = task.name.as_str());
    let ctx = TaskContext {
        name: task.name.clone(),
        token: task.token.clone(),
        span: span.clone(),
    };

    // The work function is userland code; a panic there must not take the
    // whole pool down with it.
    let outcome = {
        let _enter = span.enter();
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.work.run(resource, &ctx, &task.outputs)
        })) {
            // Work propagating a framework error, a cancellation raised by
            // `check_cancel` in particular, keeps its class.
            Ok(result) => result.map_err(|err| match err.downcast::<TaskError>() {
                Ok(task_err) => task_err,
                Err(err) => TaskError::execution(&task.name, err),
            }),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("work function panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("work function panicked: {s}")
                } else {
                    String::from("work function panicked with unknown payload")
                };
                Err(TaskError::execution(&task.name, anyhow::anyhow!(msg)))
            }
        }
    }?;

    if !task.run_children_first {
        compose_children(task, resource, provider, mode)?;
    }

    // A run past its deadline fails with a cancellation-class error even if
    // the work function nominally returned a value.
    task.token.checked(&task.name)?;

    Ok(outcome)
}

fn compose_children<R>(
    task: &mut Task<R>,
    resource: &mut R,
    provider: &dyn ResourceProvider<R>,
    mode: Composition,
) -> Result<(), TaskError> {
    match mode {
        Composition::Sequential => compose::run_children_inline(task, resource, provider),
        Composition::ForkJoin => compose::run_children_forkjoin(task, provider),
    }
}

/// Runs the full pipeline inside a freshly acquired resource scope. The scope
/// is released on every exit path before the terminal callbacks fire.
pub(crate) fn run_scoped<R>(
    task: &mut Task<R>,
    provider: &dyn ResourceProvider<R>,
    mode: Composition,
) -> Result<Outcome, TaskError> {
    let span = tracing::span!(Level::INFO, "task", name = task.name.as_str());
    let _enter = span.enter();

    let result = match begin(task) {
        Err(err) => Err(err),
        Ok(()) => match ResourceScope::acquire(provider) {
            Err(err) => Err(TaskError::execution(&task.name, err)),
            Ok(mut scope) => run_in_scope(task, scope.resource_mut(), provider, mode),
        },
    };

    settle(task, result)
}

// A sequential child runs the same pipeline, but borrows the parent's
// resource instead of opening a scope of its own.
pub(crate) fn run_inline<R>(
    task: &mut Task<R>,
    resource: &mut R,
    provider: &dyn ResourceProvider<R>,
) -> Result<Outcome, TaskError> {
    let result = match begin(task) {
        Err(err) => Err(err),
        Ok(()) => run_in_scope(task, resource, provider, Composition::Sequential),
    };

    settle(task, result)
}

/// The direct-call adapter.
///
/// Runs the full pipeline inline and absorbs the terminal error, which was
/// already delivered through the callbacks and the exception handler.
/// Suitable for fire-and-forget dispatch.
pub fn run_detached<R>(task: &mut Task<R>, provider: &dyn ResourceProvider<R>) {
    if let Err(err) = run_scoped(task, provider, Composition::Sequential) {
        error!(task = task.name.as_str(), "detached task failed: {err}");
    }
}

/// A join handle for a task submitted to the worker pool.
///
/// The handle doubles as a dependency producer: [`dependency`](Self::dependency)
/// returns a weak handle another task can wait on. Dropping the `TaskHandle`
/// without joining lets waiters observe a dependency failure once the run
/// finishes and the handle's cell goes away.
pub struct TaskHandle {
    cell: Arc<DepCell>,
    receiver: Receiver<Result<Outcome, TaskError>>,
}

impl TaskHandle {
    /// A weak handle to this task's eventual outcome, usable as a named
    /// dependency of another task.
    pub fn dependency(&self) -> DependencyHandle {
        DependencyHandle::from_weak(Arc::downgrade(&self.cell))
    }

    /// Blocks until the task finishes and rethrows its terminal error.
    pub fn join(self) -> Result<Outcome, TaskError> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(TaskError::execution(
                "pool",
                anyhow::anyhow!("worker disappeared before reporting a result"),
            )),
        }
    }
}

/// The unit-of-work adapter.
///
/// Submits the task to the shared worker pool and returns a [`TaskHandle`].
/// The pipeline runs with sequential child composition; the terminal error is
/// rethrown from [`TaskHandle::join`].
pub fn spawn<R: 'static>(
    mut task: Task<R>,
    provider: Arc<dyn ResourceProvider<R>>,
) -> TaskHandle {
    let cell = DepCell::new();
    let promise = DepPromise::from_cell(cell.clone());
    let (sender, receiver) = channel();

    rayon::spawn(move || {
        let result = run_scoped(&mut task, provider.as_ref(), Composition::Sequential);

        match &result {
            Ok(outcome) => promise.fulfill(Ok(outcome.clone())),
            Err(err) => promise.fulfill(Err(err.to_string())),
        }

        // The receiver may be gone when the caller never joins; the result
        // was already delivered through callbacks and the promise.
        let _ = sender.send(result);
    });

    TaskHandle { cell, receiver }
}

/// The parallel-composite adapter.
///
/// Forks each root task as an independent fork-join sub-unit with its own
/// resource scope and blocks until all of them join. Results come back in
/// submission order, not completion order.
pub fn run_parallel<R>(
    tasks: Vec<Task<R>>,
    provider: &dyn ResourceProvider<R>,
) -> Vec<(Task<R>, Result<Outcome, TaskError>)> {
    let count = tasks.len();
    let (sender, receiver) = channel::<(usize, Task<R>, Result<Outcome, TaskError>)>();

    rayon::scope(|s| {
        for (index, mut task) in tasks.into_iter().enumerate() {
            let sender = sender.clone();
            s.spawn(move |_| {
                debug!(task = task.name.as_str(), "forking composite root");
                let result = run_scoped(&mut task, provider, Composition::ForkJoin);
                sender.send((index, task, result)).unwrap();
            });
        }
    });
    drop(sender);

    let mut joined: Vec<Option<(Task<R>, Result<Outcome, TaskError>)>> =
        (0..count).map(|_| None).collect();
    for (index, task, result) in receiver {
        joined[index] = Some((task, result));
    }

    joined.into_iter().map(|slot| slot.unwrap()).collect()
}

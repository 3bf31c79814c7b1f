use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::envelope::PortableWork;
use crate::error::TaskError;
use crate::progress::{Callback, ProgressCounters};
use crate::resolve::DependencyHandle;

/// Open-ended result/metadata carrier produced by a work function.
pub type Outcome = serde_json::Value;

/// Resolved dependency and child results, keyed by registered name, as seen
/// by a work function.
pub type Inputs = HashMap<String, Outcome>;

/// The work capability of a task.
///
/// A concrete task supplies exactly one method: `run` receives the
/// exclusively owned per-run resource, the run context and the resolved
/// inputs, and returns an [`Outcome`] or an error. Closures with the same
/// signature implement this trait automatically.
pub trait Work<R>: Send + Sync {
    fn run(&self, resource: &mut R, ctx: &TaskContext, inputs: &Inputs) -> anyhow::Result<Outcome>;
}

impl<R, F> Work<R> for F
where
    F: Fn(&mut R, &TaskContext, &Inputs) -> anyhow::Result<Outcome> + Send + Sync,
{
    fn run(&self, resource: &mut R, ctx: &TaskContext, inputs: &Inputs) -> anyhow::Result<Outcome> {
        self(resource, ctx, inputs)
    }
}

/// The context passed to every work function.
///
/// Carries the task name, the cooperative cancellation token and the tracing
/// span assigned to this run. Well-behaved task logic running loops calls
/// [`check_cancel`](Self::check_cancel) periodically.
pub struct TaskContext {
    pub name: String,
    pub token: CancelToken,
    pub(crate) span: tracing::Span,
}

impl TaskContext {
    /// The cooperative cancellation primitive; raises a cancellation error
    /// when the task was terminated or its deadline has passed.
    pub fn check_cancel(&self) -> Result<(), TaskError> {
        self.token.checked(&self.name)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// The lifecycle state of a task. Terminal states are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Succeeded,
    Failed,
    Terminated,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Created | TaskState::Running)
    }
}

// Two shapes of work: an opaque in-memory closure or trait object, and a
// portable variant which can additionally be sealed into an envelope.
pub(crate) enum WorkKind<R> {
    Opaque(Arc<dyn Work<R>>),
    Portable(Arc<dyn PortableWork<R>>),
}

impl<R> WorkKind<R> {
    pub(crate) fn run(
        &self,
        resource: &mut R,
        ctx: &TaskContext,
        inputs: &Inputs,
    ) -> anyhow::Result<Outcome> {
        match self {
            WorkKind::Opaque(work) => work.run(resource, ctx, inputs),
            WorkKind::Portable(work) => work.run(resource, ctx, inputs),
        }
    }

    pub(crate) fn portable(&self) -> Option<&Arc<dyn PortableWork<R>>> {
        match self {
            WorkKind::Opaque(_) => None,
            WorkKind::Portable(work) => Some(work),
        }
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

fn generated_name() -> String {
    format!("task-{}", NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// A unit of work.
///
/// A task owns an ordered list of child tasks, a list of named dependency
/// handles resolved before it runs, an optional timeout, shared progress
/// counters and lifecycle callbacks. It is configured with the `with_*`
/// builder methods, submitted through exactly one execution adapter, reaches
/// a terminal state and is then discarded; tasks are never pooled or reused.
pub struct Task<R> {
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) phase: u32,
    pub(crate) dependent_phase: u32,
    pub(crate) children: Vec<Task<R>>,
    pub(crate) dependencies: Vec<(String, DependencyHandle)>,
    pub(crate) outputs: HashMap<String, Outcome>,
    pub(crate) timeout: Duration,
    pub(crate) token: CancelToken,
    pub(crate) counters: Option<ProgressCounters>,
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) exception_handler: Option<Box<dyn Fn(&TaskError) + Send + Sync>>,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) run_children_first: bool,
    pub(crate) work: WorkKind<R>,
}

impl<R> Task<R> {
    /// Creates a task with in-memory work. Such a task cannot be sealed into
    /// a portable envelope; use [`Task::portable`] for that.
    pub fn new<W>(name: impl Into<String>, work: W) -> Self
    where
        W: Work<R> + 'static,
    {
        Self::with_work(name.into(), WorkKind::Opaque(Arc::new(work)))
    }

    /// Creates a task with a generated unique name.
    pub fn unnamed<W>(work: W) -> Self
    where
        W: Work<R> + 'static,
    {
        Self::with_work(generated_name(), WorkKind::Opaque(Arc::new(work)))
    }

    /// Creates a task whose work can be sealed into a portable envelope and
    /// reconstructed on a remote worker.
    pub fn portable<W>(name: impl Into<String>, work: W) -> Self
    where
        W: PortableWork<R> + 'static,
    {
        Self::with_work(name.into(), WorkKind::Portable(Arc::new(work)))
    }

    pub(crate) fn from_decoded(name: String, work: Arc<dyn PortableWork<R>>) -> Self {
        Self::with_work(name, WorkKind::Portable(work))
    }

    fn with_work(name: String, work: WorkKind<R>) -> Self {
        Self {
            name,
            state: TaskState::Created,
            phase: 0,
            dependent_phase: 0,
            children: Vec::new(),
            dependencies: Vec::new(),
            outputs: HashMap::new(),
            timeout: Duration::ZERO,
            token: CancelToken::new(),
            counters: None,
            callbacks: Vec::new(),
            exception_handler: None,
            outcome: None,
            run_children_first: true,
            work,
        }
    }

    /// Appends a child. Children are exclusively owned, run in declaration
    /// order and are destroyed with the parent.
    pub fn with_child(mut self, child: Task<R>) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Task<R>>) -> Self {
        self.children.extend(children);
        self
    }

    /// Declares a named dependency on an externally-submitted computation.
    /// The task waits on the handle before running but does not own the
    /// underlying computation.
    pub fn with_dependency(mut self, name: impl Into<String>, handle: DependencyHandle) -> Self {
        self.dependencies.push((name.into(), handle));
        self
    }

    /// Sets the timeout for a run. The deadline is computed as `now + timeout`
    /// at the moment the run begins; zero means no deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Advisory ordering metadata for a distributed partition scheduler. A
    /// task tagged with dependent phase N must not start on the remote side
    /// until all phase-N tasks finish; this framework only carries the values.
    pub fn with_phase(mut self, phase: u32, dependent_phase: u32) -> Self {
        self.phase = phase;
        self.dependent_phase = dependent_phase;
        self
    }

    /// Attaches shared progress counters, propagating the same pair to every
    /// child attached at this moment. Children added afterwards do not
    /// inherit them.
    pub fn with_counters(mut self, counters: ProgressCounters) -> Self {
        self.attach_counters(&counters);
        self
    }

    fn attach_counters(&mut self, counters: &ProgressCounters) {
        self.counters = Some(counters.clone());
        for child in &mut self.children {
            child.attach_counters(counters);
        }
    }

    /// Registers a lifecycle callback. Callbacks within one stage run in
    /// registration order and are never serialized.
    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Registers a handler invoked with the terminal error of a failed run.
    pub fn with_exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.exception_handler = Some(Box::new(handler));
        self
    }

    /// Whether children run before the task's own work function (the
    /// default) or after it.
    pub fn with_run_children_first(mut self, run_children_first: bool) -> Self {
        self.run_children_first = run_children_first;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    pub fn dependent_phase(&self) -> u32 {
        self.dependent_phase
    }

    /// The configured timeout; zero means no deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn run_children_first(&self) -> bool {
        self.run_children_first
    }

    pub fn children(&self) -> &[Task<R>] {
        &self.children
    }

    /// Results of resolved dependencies and finished children, keyed by their
    /// registered names. After a child finishes, its own outputs are merged
    /// up into this map as well.
    pub fn outputs(&self) -> &HashMap<String, Outcome> {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&Outcome> {
        self.outputs.get(name)
    }

    /// The outcome of the task's own work function, if the run got that far.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Sets the cancellation flag. Idempotent, cooperative; in-flight work is
    /// not interrupted.
    pub fn terminate(&self) {
        self.token.terminate();
    }

    /// True if the task was terminated or its deadline has passed.
    pub fn is_terminated(&self) -> bool {
        self.token.is_terminated()
    }
}

impl<R> std::fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("children", &self.children.len())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop() -> Task<()> {
        Task::new("noop", |_: &mut (), _: &TaskContext, _: &Inputs| Ok(Outcome::Null))
    }

    #[test]
    fn generated_names_are_unique() {
        let a = Task::<()>::unnamed(|_: &mut (), _: &TaskContext, _: &Inputs| Ok(Outcome::Null));
        let b = Task::<()>::unnamed(|_: &mut (), _: &TaskContext, _: &Inputs| Ok(Outcome::Null));
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn counters_propagate_to_attached_children_only() {
        let counters = ProgressCounters::new();

        let parent = noop()
            .with_child(noop())
            .with_child(noop())
            .with_counters(counters.clone())
            .with_child(noop());

        assert!(parent.counters.is_some());
        assert!(parent.children[0].counters.is_some());
        assert!(parent.children[1].counters.is_some());
        assert!(parent.children[2].counters.is_none());
    }

    #[test]
    fn counters_propagate_through_the_whole_subtree() {
        let counters = ProgressCounters::new();
        let parent = noop()
            .with_child(noop().with_child(noop()))
            .with_counters(counters);

        assert!(parent.children[0].children[0].counters.is_some());
    }

    #[test]
    fn terminate_is_visible_through_the_task() {
        let task = noop();
        assert!(!task.is_terminated());
        task.terminate();
        assert!(task.is_terminated());
        assert!(task.token().checked(task.name()).is_err());
    }
}

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::envelope::{self, Registry};
use crate::error::TaskError;
use crate::progress::ProgressCounters;
use crate::runner::run_detached;
use crate::scope::ResourceProvider;

/// A work item consumed from a distributed queue: a batch of sealed task
/// envelopes plus advisory phase metadata. How items are fetched is the
/// queue's concern; this module only consumes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub phase: u32,
    pub dependent_phase: u32,
    pub envelopes: Vec<String>,
}

/// The committed aggregate of one or more processed work orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderResult {
    pub completed: u64,
    pub failed: u64,
    pub notes: Vec<String>,
}

/// A shared, lockable result record with lock/mutate/commit semantics.
///
/// [`lock`](Self::lock) takes the whole record, the only granularity offered,
/// and hands out a staged copy; mutations become visible to other readers
/// only once the guard is committed. A guard dropped without committing
/// discards its changes.
#[derive(Default)]
pub struct ResultRecord {
    inner: Mutex<OrderResult>,
    revision: AtomicU64,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the record and stages a copy of the current result for mutation.
    pub fn lock(&self) -> RecordGuard<'_> {
        let guard = self.inner.lock().unwrap();
        let staged = guard.clone();
        RecordGuard {
            guard,
            staged,
            revision: &self.revision,
        }
    }

    /// A copy of the last committed result.
    pub fn snapshot(&self) -> OrderResult {
        self.inner.lock().unwrap().clone()
    }

    /// Number of commits so far.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

/// A locked result record. Mutate the staged copy through `Deref`, then
/// [`commit`](Self::commit) to publish.
pub struct RecordGuard<'a> {
    guard: MutexGuard<'a, OrderResult>,
    staged: OrderResult,
    revision: &'a AtomicU64,
}

impl RecordGuard<'_> {
    /// Publishes the staged mutations.
    pub fn commit(mut self) {
        *self.guard = self.staged;
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl Deref for RecordGuard<'_> {
    type Target = OrderResult;

    fn deref(&self) -> &Self::Target {
        &self.staged
    }
}

impl DerefMut for RecordGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.staged
    }
}

/// Processes one work order: opens every envelope, runs it through the
/// direct-call adapter, then folds the aggregate completed/failed counts into
/// the shared record under a single lock/commit.
///
/// An envelope that cannot be opened counts as one failed task. Task failures
/// never abort the rest of the order; there is no cross-task rollback.
pub fn process_order<R>(
    order: &WorkOrder,
    registry: &Registry<R>,
    provider: &dyn ResourceProvider<R>,
    record: &ResultRecord,
) {
    let counters = ProgressCounters::new();
    let mut open_failures = 0u64;
    let mut notes = Vec::new();

    for blob in &order.envelopes {
        match envelope::open(blob, registry) {
            Ok(task) => {
                let mut task = task.with_counters(counters.clone());
                info!(
                    task = task.name(),
                    phase = order.phase,
                    dependent_phase = order.dependent_phase,
                    "running envelope",
                );
                run_detached(&mut task, provider);

                if task.state().is_terminal() && !matches!(task.state(), crate::task::TaskState::Succeeded) {
                    notes.push(format!(
                        "task '{}' finished as {:?}",
                        task.name(),
                        task.state(),
                    ));
                }
            }
            Err(err) => {
                let err = TaskError::from(err);
                error!(phase = order.phase, "failed to open envelope: {err}");
                open_failures += 1;
                notes.push(err.to_string());
            }
        }
    }

    let mut guard = record.lock();
    guard.completed += counters.completed();
    guard.failed += counters.failed() + open_failures;
    guard.notes.extend(notes);
    guard.commit();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envelope::{Portable, decode_payload, encode_payload, seal};
    use crate::task::{Inputs, Outcome, Task, TaskContext, Work};

    struct NullProvider;

    impl ResourceProvider<()> for NullProvider {
        fn acquire(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn release(&self, _: ()) {}
    }

    #[derive(Serialize, Deserialize)]
    struct Fixed {
        value: i64,
        fail: bool,
    }

    impl Work<()> for Fixed {
        fn run(&self, _: &mut (), _: &TaskContext, _: &Inputs) -> anyhow::Result<Outcome> {
            if self.fail {
                anyhow::bail!("requested failure");
            }
            Ok(serde_json::json!(self.value))
        }
    }

    impl Portable for Fixed {
        fn kind(&self) -> &'static str {
            "fixed"
        }

        fn encode(&self) -> anyhow::Result<Vec<u8>> {
            encode_payload(self)
        }
    }

    fn registry() -> Registry<()> {
        let mut registry = Registry::new();
        registry.register("fixed", |payload| decode_payload::<Fixed>(payload));
        registry
    }

    #[test]
    fn lock_mutate_commit_publishes() {
        let record = ResultRecord::new();

        let mut guard = record.lock();
        guard.completed += 3;
        guard.commit();

        assert_eq!(record.snapshot().completed, 3);
        assert_eq!(record.revision(), 1);
    }

    #[test]
    fn dropped_guard_discards_mutations() {
        let record = ResultRecord::new();

        {
            let mut guard = record.lock();
            guard.failed += 7;
        }

        assert_eq!(record.snapshot().failed, 0);
        assert_eq!(record.revision(), 0);
    }

    #[test]
    fn order_aggregates_completed_and_failed() {
        let ok = Task::portable("ok", Fixed { value: 1, fail: false });
        let bad = Task::portable("bad", Fixed { value: 0, fail: true });

        let order = WorkOrder {
            phase: 2,
            dependent_phase: 1,
            envelopes: vec![
                seal(&ok).unwrap(),
                seal(&bad).unwrap(),
                "not an envelope".to_string(),
            ],
        };

        let record = ResultRecord::new();
        process_order(&order, &registry(), &NullProvider, &record);

        let result = record.snapshot();
        assert_eq!(result.completed, 1);
        // One failed task plus one unopenable envelope.
        assert_eq!(result.failed, 2);
        assert_eq!(record.revision(), 1);
        assert_eq!(result.notes.len(), 2);
    }

    #[test]
    fn counters_cover_children_of_an_envelope() {
        let tree = Task::portable("parent", Fixed { value: 1, fail: false })
            .with_child(Task::portable("child", Fixed { value: 2, fail: false }));

        let order = WorkOrder {
            phase: 0,
            dependent_phase: 0,
            envelopes: vec![seal(&tree).unwrap()],
        };

        let record = ResultRecord::new();
        process_order(&order, &registry(), &NullProvider, &record);

        assert_eq!(record.snapshot().completed, 2);
        assert_eq!(record.snapshot().failed, 0);
    }
}

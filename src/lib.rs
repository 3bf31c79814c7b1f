#![forbid(unsafe_code)]
//! Hierarchical task execution framework.
//!
//! The central entity is a [`Task`]: a unit of work with an ordered tree of
//! exclusively-owned children, named asynchronous dependencies resolved
//! before it runs, cooperative cancellation with optional deadlines, shared
//! progress counters and ordered lifecycle callbacks. Every run opens a fresh
//! resource scope from a [`ResourceProvider`], so no two logically concurrent
//! runs ever observe the same mutable resource handle.
//!
//! One task tree can be submitted through any of the execution adapters:
//!
//! * [`run_detached`] runs inline and absorbs the terminal error after
//!   delivering it through callbacks; fire-and-forget.
//! * [`spawn`] submits to the shared worker pool and returns a
//!   [`TaskHandle`] which rethrows the terminal error on join and doubles as
//!   a dependency producer for other tasks.
//! * [`run_parallel`] forks independent root tasks as fork-join sub-units,
//!   each child with a resource scope of its own, and returns results in
//!   submission order.
//! * [`seal`] and [`open`] form the portable envelope: a compressed,
//!   transport-safe blob a remote worker reconstructs through a [`Registry`]
//!   of task kinds, consumed in batches by [`process_order`].

mod cancel;
mod compose;
mod envelope;
mod error;
mod logging;
mod progress;
mod queue;
mod resolve;
mod runner;
mod scope;
mod task;

pub use crate::cancel::CancelToken;
pub use crate::envelope::{
    ENVELOPE_VERSION, Envelope, EnvelopeNode, Portable, PortableWork, Registry, decode_payload,
    encode_payload, open, seal,
};
pub use crate::error::{CancelReason, EnvelopeError, TaskError};
pub use crate::logging::init_logging;
pub use crate::progress::{Callback, LifecycleEvent, ProgressCounters};
pub use crate::queue::{OrderResult, RecordGuard, ResultRecord, WorkOrder, process_order};
pub use crate::resolve::{DepPromise, DependencyHandle};
pub use crate::runner::{TaskHandle, run_detached, run_parallel, spawn};
pub use crate::scope::{ResourceProvider, ResourceScope};
pub use crate::task::{Inputs, Outcome, Task, TaskContext, TaskState, Work};

use std::sync::mpsc::channel;

use tracing::debug;

use crate::error::TaskError;
use crate::runner::{self, Composition};
use crate::scope::ResourceProvider;
use crate::task::{Outcome, Task};

// Stores a finished child's outcome under its name, exactly like a resolved
// dependency, then merges the child's own outputs upward.
fn merge_child_outputs<R>(task: &mut Task<R>, index: usize, outcome: Outcome) {
    let name = task.children[index].name.clone();
    task.outputs.insert(name, outcome);

    let drained: Vec<_> = task.children[index].outputs.drain().collect();
    task.outputs.extend(drained);
}

/// Sequential (inline) composition: children are walked depth-first in
/// declaration order, inside the *same* resource scope as the parent.
///
/// A failing child halts the remaining siblings; outputs of the siblings that
/// already finished stay in the parent's map.
pub(crate) fn run_children_inline<R>(
    task: &mut Task<R>,
    resource: &mut R,
    provider: &dyn ResourceProvider<R>,
) -> Result<(), TaskError> {
    for index in 0..task.children.len() {
        debug!(
            parent = task.name.as_str(),
            child = task.children[index].name.as_str(),
            "running child inline",
        );

        let outcome = runner::run_inline(&mut task.children[index], resource, provider)?;
        merge_child_outputs(task, index, outcome);
    }

    Ok(())
}

/// Fork-join composition: every child becomes an independent parallel
/// sub-unit with its own resource scope; the parent blocks until all children
/// join, then merges their outputs in declaration order.
///
/// Child failures are isolated: all children run to completion, successful
/// children's outputs stay merged, and the composite fails with the first
/// error in declaration order if any child failed.
pub(crate) fn run_children_forkjoin<R>(
    task: &mut Task<R>,
    provider: &dyn ResourceProvider<R>,
) -> Result<(), TaskError> {
    if task.children.is_empty() {
        return Ok(());
    }

    let children = std::mem::take(&mut task.children);
    let count = children.len();
    let (sender, receiver) = channel::<(usize, Task<R>, Result<Outcome, TaskError>)>();

    rayon::scope(|s| {
        for (index, mut child) in children.into_iter().enumerate() {
            let sender = sender.clone();
            s.spawn(move |_| {
                let result = runner::run_scoped(&mut child, provider, Composition::ForkJoin);
                sender.send((index, child, result)).unwrap();
            });
        }
    });
    drop(sender);

    let mut joined: Vec<Option<(Task<R>, Result<Outcome, TaskError>)>> =
        (0..count).map(|_| None).collect();
    for (index, child, result) in receiver {
        joined[index] = Some((child, result));
    }

    let mut first_error = None;
    for slot in joined {
        let (child, result) = slot.unwrap();
        task.children.push(child);

        match result {
            Ok(outcome) => {
                let index = task.children.len() - 1;
                merge_child_outputs(task, index, outcome);
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

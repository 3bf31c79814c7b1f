use thiserror::Error;

/// Why a task run was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `terminate()` was called on the task or its token.
    Terminated,
    /// The deadline armed at the start of the run has passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Terminated => write!(f, "terminated"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// The terminal error of a task run.
///
/// The pooled and parallel adapters surface this to the caller; the detached
/// adapter absorbs it after delivering it through the registered callbacks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task's own work function raised or panicked.
    #[error("task '{task}': {source}")]
    Execution {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// One or more declared dependencies failed or exceeded the deadline.
    /// Dependencies which did resolve remain available in the output map.
    #[error("task '{task}': dependencies failed: {}", failed.join(", "))]
    Dependency { task: String, failed: Vec<String> },

    /// The run was cancelled, either explicitly or by the deadline.
    #[error("task '{task}' cancelled: {reason}")]
    Cancelled { task: String, reason: CancelReason },

    /// A portable envelope could not be produced or reconstructed.
    #[error(transparent)]
    Serialization(#[from] EnvelopeError),
}

impl TaskError {
    pub(crate) fn execution(task: &str, source: anyhow::Error) -> Self {
        TaskError::Execution {
            task: task.to_string(),
            source,
        }
    }

    /// True when this error belongs to the cancellation class.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }
}

/// Errors produced while sealing or opening a portable envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode payload for task '{task}': {source}")]
    Encode {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode payload of kind '{kind}': {source}")]
    Decode {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task '{0}' carries no portable work and cannot be sealed")]
    NotPortable(String),

    #[error("unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("unsupported envelope version {found}, expected {expected}")]
    Version { found: u16, expected: u16 },

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

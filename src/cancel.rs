use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CancelReason, TaskError};

/// Cooperative cancellation token threaded through every task run.
///
/// The token never interrupts a thread. It holds a terminate flag and an
/// optional deadline, and task logic running loops is expected to call
/// [`checked`](Self::checked) periodically. A blocking third-party call inside
/// a work function will not be cut short unless it observes the token itself
/// or is wrapped in a time-bounded wait.
///
/// Cloning the token shares the underlying state.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the deadline as `now + timeout`. Called once, at the moment
    /// a run begins. A zero timeout means no deadline.
    pub(crate) fn arm(&self, timeout: Duration) {
        if !timeout.is_zero() {
            *self.deadline.lock().unwrap() = Some(Instant::now() + timeout);
        }
    }

    /// Sets the terminate flag. Idempotent; in-flight work is not interrupted.
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True if the terminate flag is set or the deadline has passed.
    pub fn is_terminated(&self) -> bool {
        self.cancel_reason().is_some()
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        if self.flag.load(Ordering::SeqCst) {
            return Some(CancelReason::Terminated);
        }

        match *self.deadline.lock().unwrap() {
            Some(deadline) if Instant::now() >= deadline => {
                Some(CancelReason::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// The time budget left until the deadline, or `None` when unbounded.
    /// Returns `Some(Duration::ZERO)` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .lock()
            .unwrap()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The cooperative cancellation primitive. Raises a cancellation error
    /// when the task was terminated or the deadline has passed.
    pub fn checked(&self, task: &str) -> Result<(), TaskError> {
        match self.cancel_reason() {
            Some(reason) => Err(TaskError::Cancelled {
                task: task.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("terminated", &self.flag.load(Ordering::SeqCst))
            .field("deadline", &*self.deadline.lock().unwrap())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminate_is_immediate_and_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_terminated());

        token.terminate();
        assert!(token.is_terminated());
        token.terminate();
        assert!(token.is_terminated());

        let err = token.checked("job").unwrap_err();
        assert!(matches!(
            err,
            TaskError::Cancelled {
                reason: CancelReason::Terminated,
                ..
            }
        ));
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let token = CancelToken::new();
        token.arm(Duration::ZERO);
        assert_eq!(token.remaining(), None);
        assert!(!token.is_terminated());
    }

    #[test]
    fn deadline_expiry_reports_timeout() {
        let token = CancelToken::new();
        token.arm(Duration::from_millis(10));
        assert!(token.remaining().is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(token.is_terminated());
        assert_eq!(token.remaining(), Some(Duration::ZERO));

        let err = token.checked("job").unwrap_err();
        assert!(matches!(
            err,
            TaskError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
                ..
            }
        ));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.terminate();
        assert!(clone.is_terminated());
    }
}

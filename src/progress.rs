//! Progress records and cooperative cancellation.
//!
//! Workers publish `Progress` records over a bounded channel after each
//! decoded chunk; the terminal record is delivered exactly once per job.
//! Cancellation is a shared flag every stage checks at chunk boundaries, so
//! a cancel resolves within roughly one chunk's processing budget.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

/// One record in a job's progress stream.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Completion fraction in [0, 1]; non-decreasing within a job.
    pub fraction: f32,
    /// Optional human-readable stage description.
    pub status: Option<String>,
    /// Un-normalized amplitude points emitted so far. Only attached when the
    /// job opted in via `report_partial`.
    pub partial: Option<Vec<f32>>,
    /// True on the terminal record; no further records follow it.
    pub is_final: bool,
    /// Terminal error description, if the job did not succeed.
    pub error: Option<String>,
}

impl Progress {
    pub(crate) fn interim(fraction: f32, partial: Option<Vec<f32>>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            status: None,
            partial,
            is_final: false,
            error: None,
        }
    }

    pub(crate) fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub(crate) fn completed() -> Self {
        Self {
            fraction: 1.0,
            status: Some("completed".into()),
            partial: None,
            is_final: true,
            error: None,
        }
    }

    pub(crate) fn terminal_error(fraction: f32, err: &Error) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            status: None,
            partial: None,
            is_final: true,
            error: Some(err.to_string()),
        }
    }
}

/// Why a job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `cancel` from the caller.
    User,
    /// The job's wall-clock deadline expired.
    Deadline,
    /// The pool is shutting down.
    Shutdown,
}

/// A cloneable handle requesting cooperative cancellation.
///
/// Cancelling is idempotent; the first recorded reason wins. Stages poll
/// `is_cancelled` between I/O operations and at every chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation on behalf of the caller.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::User);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        let mut slot = self.inner.reason.lock().expect("cancel reason lock");
        if slot.is_none() {
            *slot = Some(reason);
        }
        // Store after the reason so observers of the flag see a reason.
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock().expect("cancel reason lock")
    }

    /// The error a cancelled job resolves with.
    pub(crate) fn as_error(&self) -> Error {
        match self.reason() {
            Some(CancelReason::Deadline) => Error::Deadline,
            _ => Error::Cancelled,
        }
    }
}

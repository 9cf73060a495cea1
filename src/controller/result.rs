//! Step results and their translation into reconcile outcomes

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Result of one step, sub-step, or per-item unit of work.
///
/// `Stop` is scoped to the level that produced it: it ends the current
/// item, and is cleared by [`demote_to_parent`] before the result crosses
/// into an enclosing level. When results are combined the precedence is
/// `Error > Requeue > Stop > Success`.
#[derive(Debug)]
pub enum StepResult {
    Success,
    Stop,
    Requeue(Duration),
    Error(Error),
}

impl StepResult {
    /// Whether the level that received this result stops dispatching work
    pub fn should_return(&self) -> bool {
        match self {
            StepResult::Success => false,
            StepResult::Stop | StepResult::Error(_) => true,
            StepResult::Requeue(after) => !after.is_zero(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StepResult::Error(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success)
    }

    fn rank(&self) -> u8 {
        match self {
            StepResult::Success => 0,
            StepResult::Stop => 1,
            StepResult::Requeue(_) => 2,
            StepResult::Error(_) => 3,
        }
    }

    /// Combine two results, keeping the one with higher precedence.
    ///
    /// Two requeues keep the shorter delay; two errors keep the first.
    pub fn merge(self, other: StepResult) -> StepResult {
        match (self, other) {
            (StepResult::Requeue(a), StepResult::Requeue(b)) => StepResult::Requeue(a.min(b)),
            (a, b) if b.rank() > a.rank() => b,
            (a, _) => a,
        }
    }

    /// Translate into the pipeline's outward result
    pub fn into_outcome(self) -> Result<Outcome> {
        match self {
            StepResult::Error(e) => Err(e),
            StepResult::Requeue(after) if !after.is_zero() => Ok(Outcome::RequeueAfter(after)),
            _ => Ok(Outcome::Done),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepResult::Success => "success",
            StepResult::Stop => "stop",
            StepResult::Requeue(_) => "requeue",
            StepResult::Error(_) => "error",
        }
    }
}

impl From<Result<()>> for StepResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => StepResult::Success,
            Err(e) => StepResult::Error(e),
        }
    }
}

impl From<Error> for StepResult {
    fn from(e: Error) -> Self {
        StepResult::Error(e)
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Success => write!(f, "success"),
            StepResult::Stop => write!(f, "stop"),
            StepResult::Requeue(after) => write!(f, "requeue after {after:?}"),
            StepResult::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Clear the step-scoped `Stop` before handing a result to the parent level.
///
/// Errors and requeues pass through unchanged.
pub fn demote_to_parent(result: StepResult) -> StepResult {
    match result {
        StepResult::Stop => StepResult::Success,
        other => other,
    }
}

/// What the caller should do after a pipeline run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RequeueAfter(Duration),
}

/// Unwrap a `Result`, returning `StepResult::Error` from the enclosing function on failure
#[macro_export]
macro_rules! try_step {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return $crate::controller::StepResult::Error(e.into()),
        }
    };
}

//! Error categories for the motion core.
//!
//! The four categories mirror the ones a command dispatcher needs to act on
//! differently: a [`MotionError::Parse`] is replied to the sender without
//! touching any state, a range error rejects a single move before it ever
//! reaches the look-ahead queue, [`MotionError::Stall`] is normally
//! swallowed internally (surfaced only when the caller can no longer pause),
//! and [`MotionError::Fatal`] means the toolhead must shut down.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("parse error in '{command}': {reason}")]
    Parse { command: String, reason: String },

    #[error("Must home axis {axis} first")]
    MustHomeFirst { axis: char },

    #[error("Move out of range: {axis}={value} (limit {min}..{max})")]
    OutOfRange {
        axis: char,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("toolhead stalled: buffered time {buffered:.3}s exceeds high water {high_water:.3}s")]
    Stall { buffered: f64, high_water: f64 },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MotionError {
    pub fn parse(command: impl Into<String>, reason: impl Into<String>) -> Self {
        MotionError::Parse {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// True for the categories that must not mutate state (parse, range).
    pub fn is_rejected_before_enqueue(&self) -> bool {
        matches!(
            self,
            MotionError::Parse { .. }
                | MotionError::MustHomeFirst { .. }
                | MotionError::OutOfRange { .. }
        )
    }
}

pub type MotionResult<T> = Result<T, MotionError>;

//! Error types for the fitting, calibration and batch stages.

use crate::kernel::{ConfigError, ExecInvariantViolation};
use crate::linalg::LmError;
use thiserror::Error;

/// Failure of one channel's resonator fit. Recovered at the channel boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// The solver failed to converge.
    #[error("resonator fit did not converge: {0}")]
    Convergence(LmError),
    /// The per-channel deadline expired inside the solver.
    #[error("resonator fit timed out after {iterations} iterations")]
    Timeout {
        /// Iterations completed before the deadline.
        iterations: usize,
    },
    /// Adjacent-resonator exclusion left too few points to fit.
    #[error("channel {channel}: {usable} usable points in window, need {required}")]
    Windowing {
        /// Channel index.
        channel: usize,
        /// Points left after windowing.
        usable: usize,
        /// Minimum points required.
        required: usize,
    },
    /// A numeric kernel rejected its inputs.
    #[error(transparent)]
    Kernel(#[from] ExecInvariantViolation),
}

impl From<LmError> for FitError {
    fn from(err: LmError) -> Self {
        match err {
            LmError::Timeout { iterations } => FitError::Timeout { iterations },
            other => FitError::Convergence(other),
        }
    }
}

/// Failure of one channel's calibration. Recovered at the channel boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// Input data cannot support a calibration stage.
    #[error("calibration degenerate at {stage}: {reason}")]
    Degenerate {
        /// Stage name.
        stage: &'static str,
        /// Human readable reason.
        reason: &'static str,
    },
    /// A numeric kernel rejected its inputs.
    #[error(transparent)]
    Kernel(#[from] ExecInvariantViolation),
    /// A numeric helper failed.
    #[error("calibration numeric failure: {0}")]
    Numeric(#[from] kid_rs_core::Error),
}

/// Fatal batch-entry errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Record shapes disagree.
    #[error("shape mismatch on `{what}`: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which dimension disagreed.
        what: &'static str,
        /// Required size.
        expected: usize,
        /// Received size.
        got: usize,
    },
    /// A frequency column or the packet counter is not strictly increasing.
    #[error("`{array}` is not strictly increasing (column {column:?}, row {row})")]
    NonMonotonic {
        /// Array name.
        array: &'static str,
        /// Offending column, if the array is 2D.
        column: Option<usize>,
        /// First offending row.
        row: usize,
    },
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The cross-channel PCA stage failed.
    #[error("pca stage failed: {0}")]
    Pca(#[from] ExecInvariantViolation),
    /// The bounded worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

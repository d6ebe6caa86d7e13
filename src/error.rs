//! Crate-wide error types.
//!
//! The split follows the failure taxonomy of the pipeline: configuration and
//! grid-consistency problems are fatal before any numeric work starts, a
//! singular restricted solve is fatal for the whole worker group, and
//! everything recoverable (solver fallbacks, degenerate statistics) is
//! handled where it occurs and only logged.

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum NmfkError {
    /// Grid shape and worker count disagree. Detected before any worker is
    /// spawned; nothing runs on a misconfigured grid.
    CollectiveMismatch {
        grid_rows: usize,
        grid_cols: usize,
        workers: usize,
    },
    /// A symmetric solve restricted to a passive set hit a singular or
    /// severely ill-conditioned system. Retrying would hit the same
    /// conditioning, so this aborts the worker group.
    NumericalSingularity(String),
    /// A peer worker aborted the group; carries the originating rank and its
    /// reason so every released worker can report the same cause.
    GroupAborted { origin: usize, reason: String },
    /// Configuration value rejected by validation.
    InvalidConfig(String),
    /// Interacting matrices disagree on dimensions.
    ShapeMismatch(String),
    /// Shard or result file could not be read or written.
    Io(String),
}

impl fmt::Display for NmfkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmfkError::CollectiveMismatch {
                grid_rows,
                grid_cols,
                workers,
            } => write!(
                f,
                "grid {}x{} needs {} workers, got {}",
                grid_rows,
                grid_cols,
                grid_rows * grid_cols,
                workers
            ),
            NmfkError::NumericalSingularity(detail) => {
                write!(f, "singular restricted solve: {detail}")
            }
            NmfkError::GroupAborted { origin, reason } => {
                write!(f, "worker group aborted by rank {origin}: {reason}")
            }
            NmfkError::InvalidConfig(detail) => write!(f, "invalid configuration: {detail}"),
            NmfkError::ShapeMismatch(detail) => write!(f, "shape mismatch: {detail}"),
            NmfkError::Io(detail) => write!(f, "i/o error: {detail}"),
        }
    }
}

impl Error for NmfkError {}

impl From<std::io::Error> for NmfkError {
    fn from(e: std::io::Error) -> Self {
        NmfkError::Io(e.to_string())
    }
}

impl From<ndarray_linalg::error::LinalgError> for NmfkError {
    fn from(e: ndarray_linalg::error::LinalgError) -> Self {
        NmfkError::NumericalSingularity(e.to_string())
    }
}

impl From<ndarray_npy::ReadNpyError> for NmfkError {
    fn from(e: ndarray_npy::ReadNpyError) -> Self {
        NmfkError::Io(e.to_string())
    }
}

impl From<ndarray_npy::WriteNpyError> for NmfkError {
    fn from(e: ndarray_npy::WriteNpyError) -> Self {
        NmfkError::Io(e.to_string())
    }
}

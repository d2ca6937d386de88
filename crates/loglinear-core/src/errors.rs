//! Error types for model construction, inference, learning and persistence.

use thiserror::Error;

/// Errors that can occur while building models, running inference, training
/// weights, or reading and writing persisted records.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// without breaking changes.
///
/// All public APIs return `Result<T, LoglinearError>` rather than panicking.
/// Contradictory evidence is *not* an error: inference reports uniform
/// marginals and a partition function of 1.0 instead.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LoglinearError {
    /// Configuration error reported at the call that introduced it (dimension
    /// mismatch, cardinality disagreement, out-of-range observation, bad
    /// optimizer settings).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Numerical self-check failure (e.g. per-tree partition functions disagree).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying reader or writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The training loop stopped abnormally (worker panic, poisoned state).
    #[error("training error: {0}")]
    Training(String),

    /// Internal invariant violation (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "serde")]
impl From<bincode::Error> for LoglinearError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => LoglinearError::Io(io),
            other => LoglinearError::Serialization(other.to_string()),
        }
    }
}

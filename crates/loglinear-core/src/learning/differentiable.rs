//! The per-instance objective consumed by the batch optimizer.

use crate::errors::LoglinearError;
use crate::model::ConcatVector;

/// An objective that is a sum of per-datum terms, each with a gradient.
///
/// Implementations are shared across worker threads and must not keep
/// per-call mutable state.
pub trait DifferentiableFunction<T>: Send + Sync {
    /// Adds the gradient of `datum`'s term at `weights` into `gradient` and
    /// returns the term's value (a log-likelihood; higher is better).
    fn summary_for_instance(
        &self,
        datum: &T,
        weights: &ConcatVector,
        gradient: &mut ConcatVector,
    ) -> Result<f64, LoglinearError>;

    /// Relative cost of [`summary_for_instance`](Self::summary_for_instance)
    /// on `datum`, used to balance work across threads.
    fn estimate_relative_runtime(&self, _datum: &T) -> usize {
        1
    }
}

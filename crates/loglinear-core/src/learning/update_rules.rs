//! Weight update rules for the batch optimizer.
//!
//! A rule sees the full-batch gradient and log-likelihood once per iteration
//! and moves the weights uphill. Rules keep their own state between
//! iterations in [`UpdateRule::State`], created fresh for every training run.

use crate::model::ConcatVector;

/// Step size used by [`BacktrackingAdaGrad`] unless configured otherwise.
pub const DEFAULT_ADAGRAD_ALPHA: f64 = 0.1;

/// Squared norm of the halved step below which backtracking gives up.
pub const BACKTRACK_CONVERGENCE_NORM: f64 = 1.0e-10;

pub trait UpdateRule: Send + Sync {
    type State: Send;

    fn fresh_state(&self, initial_weights: &ConcatVector) -> Self::State;

    /// Updates `weights` in place. Returns `true` once the rule considers
    /// training converged.
    fn update_weights(
        &self,
        weights: &mut ConcatVector,
        gradient: &ConcatVector,
        log_likelihood: f64,
        state: &mut Self::State,
        quiet: bool,
    ) -> bool;
}

/// Plain fixed-rate gradient ascent. Never reports convergence on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientAscent {
    pub learning_rate: f64,
}

impl Default for GradientAscent {
    fn default() -> Self {
        Self { learning_rate: 0.1 }
    }
}

impl UpdateRule for GradientAscent {
    type State = ();

    fn fresh_state(&self, _initial_weights: &ConcatVector) -> Self::State {}

    fn update_weights(
        &self,
        weights: &mut ConcatVector,
        gradient: &ConcatVector,
        _log_likelihood: f64,
        _state: &mut Self::State,
        _quiet: bool,
    ) -> bool {
        weights.add_scaled_in_place(gradient, self.learning_rate);
        false
    }
}

/// AdaGrad that undoes half of its last step whenever the log-likelihood
/// drops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktrackingAdaGrad {
    pub alpha: f64,
}

impl Default for BacktrackingAdaGrad {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ADAGRAD_ALPHA,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaGradState {
    accumulator: ConcatVector,
    last_step: ConcatVector,
    last_log_likelihood: f64,
}

impl UpdateRule for BacktrackingAdaGrad {
    type State = AdaGradState;

    fn fresh_state(&self, _initial_weights: &ConcatVector) -> Self::State {
        AdaGradState {
            accumulator: ConcatVector::new(0),
            last_step: ConcatVector::new(0),
            last_log_likelihood: f64::NEG_INFINITY,
        }
    }

    fn update_weights(
        &self,
        weights: &mut ConcatVector,
        gradient: &ConcatVector,
        log_likelihood: f64,
        state: &mut Self::State,
        quiet: bool,
    ) -> bool {
        let change = log_likelihood - state.last_log_likelihood;
        if change == 0.0 {
            log_progress(quiet, "log-likelihood unchanged; stopping");
            return true;
        }

        if change < 0.0 {
            state.last_step.map_in_place(|d| d / 2.0);
            weights.add_scaled_in_place(&state.last_step, -1.0);
            let norm = state.last_step.dot(&state.last_step);
            log_progress(quiet, "log-likelihood dropped; backtracking");
            return norm < BACKTRACK_CONVERGENCE_NORM;
        }

        let mut squared = gradient.deep_clone();
        squared.map_in_place(|d| d * d);
        state.accumulator.add_scaled_in_place(&squared, 1.0);

        let alpha = self.alpha;
        let mut rates = state.accumulator.deep_clone();
        rates.map_in_place(|d| if d == 0.0 { alpha } else { alpha / d.sqrt() });

        let mut step = gradient.deep_clone();
        step.elementwise_multiply_in_place(&rates);
        weights.add_scaled_in_place(&step, 1.0);

        state.last_step = step;
        state.last_log_likelihood = log_likelihood;
        false
    }
}

fn log_progress(quiet: bool, message: &str) {
    #[cfg(feature = "tracing")]
    {
        if quiet {
            tracing::debug!("{message}");
        } else {
            tracing::info!("{message}");
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (quiet, message);
}

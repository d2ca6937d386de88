//! Weight learning.
//!
//! - **differentiable**: the per-instance objective trait
//! - **log_likelihood**: conditional log-likelihood of labeled models
//! - **update_rules**: gradient ascent and backtracking AdaGrad
//! - **batch_optimizer**: sharded full-batch training with cancellation

pub mod batch_optimizer;
pub mod differentiable;
pub mod log_likelihood;
pub mod update_rules;

pub use batch_optimizer::{
    BatchOptimizer, BatchOptimizerConfig, Termination, TrainingHandle, TrainingOutcome,
    WeightConstraint,
};
pub use differentiable::DifferentiableFunction;
pub use log_likelihood::LogLikelihoodFunction;
pub use update_rules::{
    AdaGradState, BacktrackingAdaGrad, GradientAscent, UpdateRule, BACKTRACK_CONVERGENCE_NORM,
    DEFAULT_ADAGRAD_ALPHA,
};

//! # Loglinear Core
//!
//! Log-linear factor graphs: feature vectors, models, exact clique-tree
//! inference and batch weight learning.

#![forbid(unsafe_code)]

pub mod errors;
pub mod inference;
pub mod kernels;
pub mod learning;
pub mod model;
#[cfg(feature = "serde")]
pub mod storage;

// Re-export commonly used types
pub use errors::LoglinearError;
pub use inference::{CliqueTree, CliqueTreeConfig, MarginalResult, TableFactor};
pub use kernels::KernelBackend;
pub use learning::{
    BacktrackingAdaGrad, BatchOptimizer, BatchOptimizerConfig, DifferentiableFunction,
    GradientAscent, LogLikelihoodFunction, Termination, TrainingOutcome,
};
pub use model::{
    ConcatVector, ConcatVectorNamespace, ConcatVectorTable, Factor, FactorId, GraphicalModel,
    NdArrayDoubles,
};

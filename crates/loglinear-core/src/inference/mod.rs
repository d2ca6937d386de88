//! Exact inference over factor graphs.
//!
//! - **table_factor**: scalar tables with product, observation and marginalization
//! - **clique_tree**: cached sum-/max-product message passing

pub mod clique_tree;
pub mod table_factor;

pub use clique_tree::{
    CliqueTree, CliqueTreeConfig, InferenceDiagnostics, MarginalResult,
    PARTITION_RELATIVE_TOLERANCE,
};
pub use table_factor::TableFactor;

//! The factor-graph data model.
//!
//! This module provides:
//! - **concat_vector**: zero-padded sparse/dense feature vectors
//! - **nd_array**: row-major N-dimensional tables and assignment cursors
//! - **concat_vector_table**: lazily evaluated feature tables
//! - **graphical_model**: factors, observations and metadata
//! - **namespace**: named feature blocks for building vectors

pub mod concat_vector;
pub mod concat_vector_table;
pub mod graphical_model;
pub mod namespace;
pub mod nd_array;

pub use concat_vector::{ComponentRecord, ConcatVector, ConcatVectorRecord};
pub use concat_vector_table::{
    ConcatVectorTable, ConcatVectorTableRecord, FeatureCell, FeatureProducer, FeatureThunk,
};
pub use graphical_model::{
    Factor, FactorId, FactorRecord, FactorTable, FactorTableRecord, GraphicalModel,
    GraphicalModelRecord, Metadata, MetadataRecord, VARIABLE_OBSERVED_VALUE,
    VARIABLE_TRAINING_VALUE,
};
pub use namespace::{ConcatVectorNamespace, NamespaceRecord, SparseFeatureRecord};
pub use nd_array::{AssignmentCursor, Assignments, NdArray, NdArrayDoubles, NdArrayRecord};

use crate::errors::LoglinearError;

/// Tolerant float comparison; exact matches (including infinities) always pass.
pub(crate) fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    a == b || (a - b).abs() <= tolerance
}

/// Axis bookkeeping for the product of two tables over overlapping variables.
///
/// The joint variable order is the left neighbors followed by the right
/// neighbors not already present.
#[derive(Debug, Clone)]
pub(crate) struct JointLayout {
    pub neighbors: Vec<usize>,
    pub dimensions: Vec<usize>,
    right_axes: Vec<usize>,
}

impl JointLayout {
    pub fn new(
        left_neighbors: &[usize],
        left_dimensions: &[usize],
        right_neighbors: &[usize],
        right_dimensions: &[usize],
    ) -> Result<Self, LoglinearError> {
        if left_neighbors.len() != left_dimensions.len()
            || right_neighbors.len() != right_dimensions.len()
        {
            return Err(LoglinearError::ValidationError(
                "multiply: neighbor count does not match table dimensionality".into(),
            ));
        }
        let mut neighbors = left_neighbors.to_vec();
        let mut dimensions = left_dimensions.to_vec();
        let mut right_axes = Vec::with_capacity(right_neighbors.len());
        for (&variable, &size) in right_neighbors.iter().zip(right_dimensions) {
            match neighbors.iter().position(|&n| n == variable) {
                Some(axis) => {
                    if dimensions[axis] != size {
                        return Err(LoglinearError::ValidationError(format!(
                            "multiply: variable {variable} has size {} on the left but {size} on the right",
                            dimensions[axis]
                        )));
                    }
                    right_axes.push(axis);
                }
                None => {
                    right_axes.push(neighbors.len());
                    neighbors.push(variable);
                    dimensions.push(size);
                }
            }
        }
        Ok(Self {
            neighbors,
            dimensions,
            right_axes,
        })
    }

    pub fn project_left(&self, joint: &[usize], out: &mut [usize]) {
        let len = out.len();
        out.copy_from_slice(&joint[..len]);
    }

    pub fn project_right(&self, joint: &[usize], out: &mut [usize]) {
        for (slot, &axis) in out.iter_mut().zip(&self.right_axes) {
            *slot = joint[axis];
        }
    }
}

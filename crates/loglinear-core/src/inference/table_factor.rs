//! Scalar tables over named variables, used as cliques and messages.
//!
//! Values are in probability space (already exponentiated), so products are
//! pointwise multiplications and marginalization is a sum or a max.

use std::fmt;

use smallvec::SmallVec;

use crate::errors::LoglinearError;
use crate::kernels::KernelBackend;
use crate::model::nd_array::{AssignmentCursor, NdArray, NdArrayDoubles};
use crate::model::{ConcatVector, FactorTable, JointLayout};

/// A non-negative table over an ordered tuple of variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TableFactor {
    neighbors: SmallVec<[usize; 4]>,
    values: NdArrayDoubles,
}

impl TableFactor {
    pub fn new(neighbors: &[usize], values: NdArrayDoubles) -> Result<Self, LoglinearError> {
        if neighbors.len() != values.dimensions().len() {
            return Err(LoglinearError::ValidationError(format!(
                "table factor over {} variables has {} dimensions",
                neighbors.len(),
                values.dimensions().len()
            )));
        }
        Ok(Self {
            neighbors: SmallVec::from_slice(neighbors),
            values,
        })
    }

    /// All-zero table.
    pub fn zeros(neighbors: &[usize], dimensions: &[usize]) -> Result<Self, LoglinearError> {
        Self::new(neighbors, NdArrayDoubles::zeros(dimensions)?)
    }

    /// Exponentiated log values of a factor table under `weights`. The table
    /// may already have observed axes restricted away; `neighbors` names the
    /// axes that remain.
    pub fn from_log_table(
        neighbors: &[usize],
        table: &FactorTable,
        weights: &ConcatVector,
        backend: KernelBackend,
    ) -> Result<Self, LoglinearError> {
        let values = table.log_values(weights, backend).map(|v| v.exp());
        Self::new(neighbors, values)
    }

    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    pub fn dimensions(&self) -> &[usize] {
        self.values.dimensions()
    }

    pub fn values(&self) -> &NdArrayDoubles {
        &self.values
    }

    /// Position of `variable` among the neighbors.
    pub fn axis_of(&self, variable: usize) -> Option<usize> {
        self.neighbors.iter().position(|&n| n == variable)
    }

    pub fn get(&self, assignment: &[usize]) -> Result<f64, LoglinearError> {
        self.values.try_get(assignment).copied()
    }

    pub fn set(&mut self, assignment: &[usize], value: f64) -> Result<(), LoglinearError> {
        self.values.checked_offset(assignment)?;
        self.values.set(assignment, value);
        Ok(())
    }

    pub fn cursor(&self) -> AssignmentCursor {
        self.values.cursor()
    }

    pub fn value_sum(&self) -> f64 {
        self.values.value_sum()
    }

    /// True if the tables share a variable.
    pub fn overlaps(&self, other: &TableFactor) -> bool {
        self.neighbors.iter().any(|n| other.neighbors.contains(n))
    }

    fn require_axis(&self, variable: usize) -> Result<usize, LoglinearError> {
        self.axis_of(variable).ok_or_else(|| {
            LoglinearError::ValidationError(format!(
                "variable {variable} is not a neighbor of table over {:?}",
                self.neighbors
            ))
        })
    }

    /// Restricts `variable` to `value`, dropping it from the table.
    pub fn observe(&self, variable: usize, value: usize) -> Result<TableFactor, LoglinearError> {
        let axis = self.require_axis(variable)?;
        let mut neighbors = self.neighbors.clone();
        neighbors.remove(axis);
        Ok(Self {
            neighbors,
            values: self.values.observe(axis, value)?,
        })
    }

    /// Pointwise product over the union of both variable sets. The result
    /// lists `self`'s variables first.
    pub fn multiply(&self, other: &TableFactor) -> Result<TableFactor, LoglinearError> {
        let layout = JointLayout::new(
            &self.neighbors,
            self.dimensions(),
            &other.neighbors,
            other.dimensions(),
        )?;
        let mut left = vec![0; self.neighbors.len()];
        let mut right = vec![0; other.neighbors.len()];
        let values = NdArray::from_fn(&layout.dimensions, |joint| {
            layout.project_left(joint, &mut left);
            layout.project_right(joint, &mut right);
            self.values.get(&left) * other.values.get(&right)
        })?;
        Self::new(&layout.neighbors, values)
    }

    pub fn sum_out(&self, variable: usize) -> Result<TableFactor, LoglinearError> {
        self.fold_out(variable, |acc, next| *acc += next)
    }

    pub fn max_out(&self, variable: usize) -> Result<TableFactor, LoglinearError> {
        self.fold_out(variable, |acc, next| {
            if *next > *acc {
                *acc = *next;
            }
        })
    }

    fn fold_out(
        &self,
        variable: usize,
        combine: impl FnMut(&mut f64, &f64),
    ) -> Result<TableFactor, LoglinearError> {
        let axis = self.require_axis(variable)?;
        let mut neighbors = self.neighbors.clone();
        neighbors.remove(axis);
        Ok(Self {
            neighbors,
            values: self.values.fold_axis(axis, combine)?,
        })
    }

    /// Normalized sum-marginal of every neighbor, in neighbor order.
    pub fn summed_marginals(&self) -> Vec<Vec<f64>> {
        self.marginals(|acc, value| *acc += value)
    }

    /// Normalized max-marginal of every neighbor, in neighbor order.
    pub fn maxed_marginals(&self) -> Vec<Vec<f64>> {
        self.marginals(|acc, value| *acc = acc.max(value))
    }

    /// Accumulates every cell into each axis' per-state slot, then
    /// normalizes. An all-zero marginal becomes uniform.
    fn marginals(&self, combine: impl Fn(&mut f64, f64)) -> Vec<Vec<f64>> {
        let mut result: Vec<Vec<f64>> = self.dimensions().iter().map(|&d| vec![0.0; d]).collect();
        let mut cursor = self.cursor();
        while cursor.advance() {
            let assignment = cursor.current();
            let value = *self.values.get(assignment);
            for (slots, &state) in result.iter_mut().zip(assignment) {
                combine(&mut slots[state], value);
            }
        }
        for marginal in &mut result {
            normalize(marginal);
        }
        result
    }
}

/// Scales `values` to sum to 1; an all-zero slice becomes uniform.
pub(crate) fn normalize(values: &mut [f64]) {
    let sum: f64 = values.iter().sum();
    if sum == 0.0 {
        let uniform = 1.0 / values.len() as f64;
        values.iter_mut().for_each(|v| *v = uniform);
    } else {
        values.iter_mut().for_each(|v| *v /= sum);
    }
}

impl fmt::Display for TableFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TableFactor {:?} {:?}", self.neighbors, self.dimensions())?;
        let mut cursor = self.cursor();
        while cursor.advance() {
            writeln!(f, "\t{:?}: {}", cursor.current(), self.values.get(cursor.current()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(neighbors: &[usize], dimensions: &[usize], values: &[f64]) -> TableFactor {
        TableFactor::new(
            neighbors,
            NdArrayDoubles::from_values(dimensions, values.to_vec()).expect("values"),
        )
        .expect("table")
    }

    #[test]
    fn log_tables_are_exponentiated_under_weights() {
        let mut model = crate::model::GraphicalModel::new();
        let id = model
            .add_factor(&[2, 5], &[2, 2], |a: &[usize]| {
                let mut features = ConcatVector::new(1);
                features.set_sparse(0, a[0] * 2 + a[1], 1.0);
                features
            })
            .expect("factor");
        let factor = model.factor(id).expect("factor");
        let mut weights = ConcatVector::new(1);
        weights.set_dense(0, vec![0.0, 1.0, 2.0, 3.0]);

        let full = TableFactor::from_log_table(
            factor.neighbors(),
            factor.table(),
            &weights,
            KernelBackend::Scalar,
        )
        .expect("table");
        assert_eq!(full.neighbors(), &[2, 5]);
        assert!((full.get(&[1, 0]).expect("cell") - 2.0f64.exp()).abs() < 1e-12);

        let observed = factor.table().observe(0, 1).expect("observe");
        let restricted =
            TableFactor::from_log_table(&[5], &observed, &weights, KernelBackend::Scalar)
                .expect("table");
        assert_eq!(restricted.dimensions(), &[2]);
        assert!((restricted.get(&[1]).expect("cell") - 3.0f64.exp()).abs() < 1e-12);

        assert!(
            TableFactor::from_log_table(&[5], factor.table(), &weights, KernelBackend::Scalar)
                .is_err()
        );
    }

    #[test]
    fn multiply_joins_on_shared_variables() {
        let a = table(&[0, 1], &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = table(&[1, 2], &[2, 3], &[1.0, 10.0, 100.0, 2.0, 20.0, 200.0]);
        let product = a.multiply(&b).expect("product");
        assert_eq!(product.neighbors(), &[0, 1, 2]);
        assert_eq!(product.dimensions(), &[2, 2, 3]);
        assert_eq!(product.get(&[1, 1, 2]).expect("cell"), 4.0 * 200.0);
        assert_eq!(product.get(&[0, 0, 1]).expect("cell"), 10.0);
    }

    #[test]
    fn multiply_by_subset_keeps_variable_order() {
        let clique = table(&[3, 1], &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let message = table(&[1], &[2], &[0.5, 2.0]);
        let product = clique.multiply(&message).expect("product");
        assert_eq!(product.neighbors(), &[3, 1]);
        assert_eq!(product.values().values(), &[0.5, 4.0, 1.5, 8.0]);
    }

    #[test]
    fn sum_and_max_out() {
        let t = table(&[0, 1], &[2, 3], &[1.0, 5.0, 2.0, 4.0, 0.0, 3.0]);
        let summed = t.sum_out(0).expect("sum");
        assert_eq!(summed.neighbors(), &[1]);
        assert_eq!(summed.values().values(), &[5.0, 5.0, 5.0]);
        let maxed = t.max_out(1).expect("max");
        assert_eq!(maxed.neighbors(), &[0]);
        assert_eq!(maxed.values().values(), &[5.0, 4.0]);
        assert!(t.sum_out(7).is_err());
    }

    #[test]
    fn observe_drops_the_variable() {
        let t = table(&[4, 2], &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let observed = t.observe(2, 1).expect("observe");
        assert_eq!(observed.neighbors(), &[4]);
        assert_eq!(observed.values().values(), &[2.0, 5.0]);
        assert!(t.observe(2, 3).is_err());
    }

    #[test]
    fn marginals_normalize_and_fall_back_to_uniform() {
        let t = table(&[0, 1], &[2, 2], &[1.0, 1.0, 0.0, 2.0]);
        let summed = t.summed_marginals();
        assert_eq!(summed[0], vec![0.5, 0.5]);
        assert_eq!(summed[1], vec![0.25, 0.75]);
        let maxed = t.maxed_marginals();
        assert_eq!(maxed[0], vec![1.0 / 3.0, 2.0 / 3.0]);

        let zero = TableFactor::zeros(&[5], &[4]).expect("zeros");
        assert_eq!(zero.summed_marginals()[0], vec![0.25; 4]);
    }

    #[test]
    fn set_rejects_out_of_range_assignments() {
        let mut t = TableFactor::zeros(&[0], &[2]).expect("zeros");
        t.set(&[1], 3.0).expect("set");
        assert_eq!(t.value_sum(), 3.0);
        assert!(t.set(&[2], 1.0).is_err());
        assert!(t.set(&[0, 0], 1.0).is_err());
    }
}

//! Feature tables whose cells are lazily computed [`ConcatVector`]s.
//!
//! Every cell is a shared [`FeatureCell`] holding either an unevaluated
//! thunk or its memoized result. Restricting a table with
//! [`observe`](ConcatVectorTable::observe) or cloning it copies cell handles,
//! not cell contents, so a feature computed through one view is visible
//! through every other view and is never recomputed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::LoglinearError;
use crate::kernels::KernelBackend;
use crate::model::concat_vector::{ConcatVector, ConcatVectorRecord};
use crate::model::nd_array::{AssignmentCursor, Assignments, NdArray, NdArrayDoubles};
use crate::model::JointLayout;

/// Per-assignment feature producer. Must be a pure function of the assignment.
pub type FeatureProducer = Arc<dyn Fn(&[usize]) -> ConcatVector + Send + Sync>;

/// Deferred computation of one cell.
pub type FeatureThunk = Arc<dyn Fn() -> ConcatVector + Send + Sync>;

enum CellState {
    Unevaluated(FeatureThunk),
    Evaluated(ConcatVector),
}

/// One memoized table cell.
pub struct FeatureCell {
    state: Mutex<CellState>,
}

impl FeatureCell {
    pub fn lazy(thunk: FeatureThunk) -> Self {
        Self {
            state: Mutex::new(CellState::Unevaluated(thunk)),
        }
    }

    pub fn evaluated(value: ConcatVector) -> Self {
        Self {
            state: Mutex::new(CellState::Evaluated(value)),
        }
    }

    /// The cell's vector, running the thunk on first access only.
    pub fn value(&self) -> ConcatVector {
        let mut state = self.state.lock();
        let value = match &*state {
            CellState::Evaluated(value) => return value.clone(),
            CellState::Unevaluated(thunk) => thunk(),
        };
        *state = CellState::Evaluated(value.clone());
        value
    }

    pub fn is_evaluated(&self) -> bool {
        matches!(&*self.state.lock(), CellState::Evaluated(_))
    }
}

impl fmt::Debug for FeatureCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            CellState::Evaluated(value) => write!(f, "Evaluated({value})"),
            CellState::Unevaluated(_) => write!(f, "Unevaluated"),
        }
    }
}

/// N-dimensional table of lazily evaluated feature vectors.
#[derive(Clone)]
pub struct ConcatVectorTable {
    cells: NdArray<Arc<FeatureCell>>,
}

impl ConcatVectorTable {
    /// Table whose cells all lazily produce the empty vector until replaced
    /// with [`set_assignment_value`](Self::set_assignment_value).
    pub fn new(dimensions: &[usize]) -> Result<Self, LoglinearError> {
        let empty: FeatureThunk = Arc::new(ConcatVector::default);
        let cells = NdArray::from_fn(dimensions, |_| Arc::new(FeatureCell::lazy(empty.clone())))?;
        Ok(Self { cells })
    }

    /// Table whose cell at `a` lazily evaluates `producer(a)`.
    pub fn from_producer(
        dimensions: &[usize],
        producer: FeatureProducer,
    ) -> Result<Self, LoglinearError> {
        let cells = NdArray::from_fn(dimensions, |assignment| {
            let producer = producer.clone();
            let assignment = assignment.to_vec();
            Arc::new(FeatureCell::lazy(Arc::new(move || producer(assignment.as_slice()))))
        })?;
        Ok(Self { cells })
    }

    pub fn dimensions(&self) -> &[usize] {
        self.cells.dimensions()
    }

    pub fn num_assignments(&self) -> usize {
        self.cells.num_assignments()
    }

    /// Memoized feature vector at `assignment`.
    pub fn assignment_value(&self, assignment: &[usize]) -> Result<ConcatVector, LoglinearError> {
        Ok(self.cells.try_get(assignment)?.value())
    }

    pub fn is_evaluated(&self, assignment: &[usize]) -> Result<bool, LoglinearError> {
        Ok(self.cells.try_get(assignment)?.is_evaluated())
    }

    /// Replaces one cell with a fresh lazy thunk.
    pub fn set_assignment_value(
        &mut self,
        assignment: &[usize],
        thunk: FeatureThunk,
    ) -> Result<(), LoglinearError> {
        self.cells.checked_offset(assignment)?;
        self.cells.set(assignment, Arc::new(FeatureCell::lazy(thunk)));
        Ok(())
    }

    /// Replaces one cell with an already computed vector.
    pub fn set_assignment_vector(
        &mut self,
        assignment: &[usize],
        value: ConcatVector,
    ) -> Result<(), LoglinearError> {
        self.cells.checked_offset(assignment)?;
        self.cells.set(assignment, Arc::new(FeatureCell::evaluated(value)));
        Ok(())
    }

    /// Restricts `axis` to `value`. The result shares cells with `self`.
    pub fn observe(&self, axis: usize, value: usize) -> Result<ConcatVectorTable, LoglinearError> {
        Ok(Self {
            cells: self.cells.observe(axis, value)?,
        })
    }

    /// Product of two feature factors over the union of their variables.
    ///
    /// A factor's value is `exp(w · f)`, so the product's features are the sum
    /// of both cells' features. Cells of the result are lazy and evaluate
    /// neither source until first read. Returns the table together with its
    /// variable order: `neighbors` followed by the new variables of
    /// `other_neighbors`.
    pub fn multiply(
        &self,
        neighbors: &[usize],
        other: &ConcatVectorTable,
        other_neighbors: &[usize],
    ) -> Result<(ConcatVectorTable, Vec<usize>), LoglinearError> {
        let layout = JointLayout::new(
            neighbors,
            self.dimensions(),
            other_neighbors,
            other.dimensions(),
        )?;
        let mut left = vec![0; neighbors.len()];
        let mut right = vec![0; other_neighbors.len()];
        let cells = NdArray::from_fn(&layout.dimensions, |joint| {
            layout.project_left(joint, &mut left);
            layout.project_right(joint, &mut right);
            let a = self.cells.get(&left).clone();
            let b = other.cells.get(&right).clone();
            Arc::new(FeatureCell::lazy(Arc::new(move || {
                let mut sum = a.value();
                sum.add_scaled_in_place(&b.value(), 1.0);
                sum
            })))
        })?;
        Ok((Self { cells }, layout.neighbors))
    }

    /// Dot product of every cell with `weights`.
    pub fn weighted(&self, weights: &ConcatVector, backend: KernelBackend) -> NdArrayDoubles {
        self.cells
            .map(|cell| cell.value().dot_with_backend(weights, backend))
    }

    pub fn cursor(&self) -> AssignmentCursor {
        self.cells.cursor()
    }

    pub fn assignments(&self) -> Assignments {
        self.cells.assignments()
    }

    /// Same dimensions and every cell vector-equal within `tolerance`.
    /// Evaluates every cell of both tables.
    pub fn value_equals(&self, other: &ConcatVectorTable, tolerance: f64) -> bool {
        self.dimensions() == other.dimensions()
            && self
                .cells
                .values()
                .iter()
                .zip(other.cells.values())
                .all(|(a, b)| Arc::ptr_eq(a, b) || a.value().value_equals(&b.value(), tolerance))
    }

    /// Materializes every cell into the persisted layout.
    pub fn to_record(&self) -> ConcatVectorTableRecord {
        ConcatVectorTableRecord {
            dimensions: self.dimensions().to_vec(),
            cells: self
                .cells
                .values()
                .iter()
                .map(|cell| cell.value().to_record())
                .collect(),
        }
    }

    pub fn from_record(record: ConcatVectorTableRecord) -> Result<Self, LoglinearError> {
        let cells = record
            .cells
            .into_iter()
            .map(|cell| ConcatVector::from_record(cell).map(|v| Arc::new(FeatureCell::evaluated(v))))
            .collect::<Result<Vec<_>, _>>()?;
        let cells = NdArray::from_values(&record.dimensions, cells)
            .map_err(|err| LoglinearError::Serialization(err.to_string()))?;
        Ok(Self { cells })
    }
}

impl fmt::Debug for ConcatVectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let evaluated = self
            .cells
            .values()
            .iter()
            .filter(|cell| cell.is_evaluated())
            .count();
        f.debug_struct("ConcatVectorTable")
            .field("dimensions", &self.dimensions())
            .field("evaluated", &evaluated)
            .field("cells", &self.num_assignments())
            .finish()
    }
}

/// Persisted form of a [`ConcatVectorTable`]: dimensions plus one vector per
/// cell in row-major order.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConcatVectorTableRecord {
    pub dimensions: Vec<usize>,
    pub cells: Vec<ConcatVectorRecord>,
}

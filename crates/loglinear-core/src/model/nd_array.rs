//! Dense N-dimensional arrays addressed by row-major assignments.
//!
//! [`NdArray<T>`] backs both scalar tables ([`NdArrayDoubles`]) and the
//! lazily evaluated feature tables in `concat_vector_table`. Traversal goes
//! through an [`AssignmentCursor`], which reuses a single buffer, or through
//! the owned [`Assignments`] iterator when callers keep assignments around.

use crate::errors::LoglinearError;
use crate::model::approx_eq;

/// Scalar-valued N-dimensional table.
pub type NdArrayDoubles = NdArray<f64>;

/// Dense N-dimensional array with row-major layout.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray<T> {
    dimensions: Vec<usize>,
    values: Vec<T>,
}

fn validate_dimensions(dimensions: &[usize]) -> Result<usize, LoglinearError> {
    if let Some(axis) = dimensions.iter().position(|&d| d == 0) {
        return Err(LoglinearError::ValidationError(format!(
            "dimension {axis} has size 0; all dimensions must be > 0"
        )));
    }
    dimensions.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| {
            LoglinearError::ValidationError(format!("table of dimensions {dimensions:?} is too large"))
        })
    })
}

impl<T> NdArray<T> {
    /// Builds a table by evaluating `f` at every assignment.
    pub fn from_fn(
        dimensions: &[usize],
        mut f: impl FnMut(&[usize]) -> T,
    ) -> Result<Self, LoglinearError> {
        let len = validate_dimensions(dimensions)?;
        let mut values = Vec::with_capacity(len);
        let mut cursor = AssignmentCursor::new(dimensions);
        while cursor.advance() {
            values.push(f(cursor.current()));
        }
        Ok(Self {
            dimensions: dimensions.to_vec(),
            values,
        })
    }

    /// Wraps a flat row-major value buffer.
    pub fn from_values(dimensions: &[usize], values: Vec<T>) -> Result<Self, LoglinearError> {
        let len = validate_dimensions(dimensions)?;
        if values.len() != len {
            return Err(LoglinearError::ValidationError(format!(
                "dimensions {dimensions:?} need {len} values, got {}",
                values.len()
            )));
        }
        Ok(Self {
            dimensions: dimensions.to_vec(),
            values,
        })
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    /// Number of cells (product of dimensions).
    pub fn num_assignments(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Row-major offset of an assignment.
    ///
    /// The assignment must have one entry per dimension, each in range; this is
    /// only checked in debug builds. Use [`checked_offset`](Self::checked_offset)
    /// for untrusted input.
    pub fn offset(&self, assignment: &[usize]) -> usize {
        debug_assert_eq!(assignment.len(), self.dimensions.len());
        assignment
            .iter()
            .zip(&self.dimensions)
            .fold(0, |acc, (&a, &d)| {
                debug_assert!(a < d, "assignment {a} out of range for dimension {d}");
                acc * d + a
            })
    }

    pub fn checked_offset(&self, assignment: &[usize]) -> Result<usize, LoglinearError> {
        if assignment.len() != self.dimensions.len() {
            return Err(LoglinearError::ValidationError(format!(
                "assignment {assignment:?} has {} entries, table has {} dimensions",
                assignment.len(),
                self.dimensions.len()
            )));
        }
        for (axis, (&a, &d)) in assignment.iter().zip(&self.dimensions).enumerate() {
            if a >= d {
                return Err(LoglinearError::ValidationError(format!(
                    "assignment {a} out of range for dimension {axis} of size {d}"
                )));
            }
        }
        Ok(self.offset(assignment))
    }

    /// Cell at `assignment`.
    ///
    /// # Panics
    ///
    /// Panics if the assignment addresses a cell outside the table.
    pub fn get(&self, assignment: &[usize]) -> &T {
        &self.values[self.offset(assignment)]
    }

    pub fn try_get(&self, assignment: &[usize]) -> Result<&T, LoglinearError> {
        let offset = self.checked_offset(assignment)?;
        Ok(&self.values[offset])
    }

    /// # Panics
    ///
    /// Panics if the assignment addresses a cell outside the table.
    pub fn set(&mut self, assignment: &[usize], value: T) {
        let offset = self.offset(assignment);
        self.values[offset] = value;
    }

    /// Cursor over every assignment in row-major order.
    pub fn cursor(&self) -> AssignmentCursor {
        AssignmentCursor::new(&self.dimensions)
    }

    /// Owned iterator over every assignment in row-major order.
    pub fn assignments(&self) -> Assignments {
        Assignments {
            cursor: self.cursor(),
        }
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> NdArray<U> {
        NdArray {
            dimensions: self.dimensions.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }

    fn axis_strides(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.dimensions[..axis].iter().product();
        let inner = self.dimensions[axis + 1..].iter().product();
        (outer, self.dimensions[axis], inner)
    }

    fn check_axis(&self, axis: usize) -> Result<(), LoglinearError> {
        if axis >= self.dimensions.len() {
            return Err(LoglinearError::ValidationError(format!(
                "axis {axis} out of range for {} dimensions",
                self.dimensions.len()
            )));
        }
        Ok(())
    }

    /// Combines the slices along `axis` into one, dropping that dimension.
    ///
    /// `combine(acc, next)` folds each later slice into the first.
    pub fn fold_axis(
        &self,
        axis: usize,
        mut combine: impl FnMut(&mut T, &T),
    ) -> Result<NdArray<T>, LoglinearError>
    where
        T: Clone,
    {
        self.check_axis(axis)?;
        let (outer, size, inner) = self.axis_strides(axis);
        let mut values = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let first = o * size * inner;
            values.extend_from_slice(&self.values[first..first + inner]);
            let out = &mut values[o * inner..(o + 1) * inner];
            for k in 1..size {
                let base = (o * size + k) * inner;
                for (acc, next) in out.iter_mut().zip(&self.values[base..base + inner]) {
                    combine(acc, next);
                }
            }
        }
        let mut dimensions = self.dimensions.clone();
        dimensions.remove(axis);
        Ok(NdArray { dimensions, values })
    }

    /// Restricts `axis` to `value`, dropping that dimension. Cells are cloned,
    /// so shared handles keep their identity.
    pub fn observe(&self, axis: usize, value: usize) -> Result<NdArray<T>, LoglinearError>
    where
        T: Clone,
    {
        self.check_axis(axis)?;
        let (outer, size, inner) = self.axis_strides(axis);
        if value >= size {
            return Err(LoglinearError::ValidationError(format!(
                "observed value {value} out of range for dimension {axis} of size {size}"
            )));
        }
        let mut values = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let base = (o * size + value) * inner;
            values.extend_from_slice(&self.values[base..base + inner]);
        }
        let mut dimensions = self.dimensions.clone();
        dimensions.remove(axis);
        Ok(NdArray { dimensions, values })
    }
}

impl NdArray<f64> {
    /// Table of zeros.
    pub fn zeros(dimensions: &[usize]) -> Result<Self, LoglinearError> {
        let len = validate_dimensions(dimensions)?;
        Ok(Self {
            dimensions: dimensions.to_vec(),
            values: vec![0.0; len],
        })
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn value_sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Same dimensions and every value within `tolerance`.
    pub fn value_equals(&self, other: &NdArrayDoubles, tolerance: f64) -> bool {
        self.dimensions == other.dimensions
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(&a, &b)| approx_eq(a, b, tolerance))
    }

    pub fn to_record(&self) -> NdArrayRecord {
        NdArrayRecord {
            dimensions: self.dimensions.clone(),
            values: self.values.clone(),
        }
    }

    pub fn from_record(record: NdArrayRecord) -> Result<Self, LoglinearError> {
        Self::from_values(&record.dimensions, record.values)
            .map_err(|err| LoglinearError::Serialization(err.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<(), LoglinearError> {
        crate::storage::write_record(writer, &self.to_record())
    }

    #[cfg(feature = "serde")]
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self, LoglinearError> {
        Self::from_record(crate::storage::read_record(reader)?)
    }
}

/// Persisted form of an [`NdArrayDoubles`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NdArrayRecord {
    pub dimensions: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Fresh,
    Active,
    Exhausted,
}

/// Row-major walk over all assignments of a set of dimensions.
///
/// The cursor owns a single assignment buffer that it rewrites on every
/// [`advance`](Self::advance); [`current`](Self::current) borrows that buffer,
/// so copy it out if it must outlive the next step. The last axis varies
/// fastest, matching [`NdArray::offset`]. A zero-dimensional cursor yields one
/// empty assignment.
///
/// ```
/// use loglinear_core::model::AssignmentCursor;
///
/// let mut cursor = AssignmentCursor::new(&[2, 2]);
/// let mut seen = Vec::new();
/// while cursor.advance() {
///     seen.push(cursor.current().to_vec());
/// }
/// assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
/// ```
#[derive(Debug, Clone)]
pub struct AssignmentCursor {
    dimensions: Vec<usize>,
    current: Vec<usize>,
    state: CursorState,
}

impl AssignmentCursor {
    pub fn new(dimensions: &[usize]) -> Self {
        Self {
            dimensions: dimensions.to_vec(),
            current: vec![0; dimensions.len()],
            state: CursorState::Fresh,
        }
    }

    /// Moves to the next assignment. Returns `false` once every assignment
    /// has been visited.
    pub fn advance(&mut self) -> bool {
        match self.state {
            CursorState::Fresh => {
                self.state = if self.dimensions.contains(&0) {
                    CursorState::Exhausted
                } else {
                    CursorState::Active
                };
            }
            CursorState::Active => {
                let mut axis = self.dimensions.len();
                loop {
                    if axis == 0 {
                        self.state = CursorState::Exhausted;
                        break;
                    }
                    axis -= 1;
                    self.current[axis] += 1;
                    if self.current[axis] < self.dimensions[axis] {
                        break;
                    }
                    self.current[axis] = 0;
                }
            }
            CursorState::Exhausted => {}
        }
        self.state == CursorState::Active
    }

    /// The assignment the cursor is on. Only meaningful after `advance`
    /// returned `true`.
    pub fn current(&self) -> &[usize] {
        &self.current
    }

    /// Rewinds to before the first assignment.
    pub fn reset(&mut self) {
        self.current.iter_mut().for_each(|a| *a = 0);
        self.state = CursorState::Fresh;
    }
}

/// Owned iterator over assignments; each item is a fresh `Vec`.
#[derive(Debug, Clone)]
pub struct Assignments {
    cursor: AssignmentCursor,
}

impl Assignments {
    pub fn new(dimensions: &[usize]) -> Self {
        Self {
            cursor: AssignmentCursor::new(dimensions),
        }
    }
}

impl Iterator for Assignments {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.advance() {
            Some(self.cursor.current().to_vec())
        } else {
            None
        }
    }
}

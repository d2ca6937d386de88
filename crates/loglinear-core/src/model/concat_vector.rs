//! Concatenated sparse/dense feature vectors.
//!
//! A [`ConcatVector`] is an ordered list of independently sized components
//! ("feature blocks"). Each component is either dense or a list of
//! `(index, value)` pairs. Every operation treats the vector as infinite and
//! zero-padded: missing components, and slots past the end of a dense
//! component, read as zero. Mutations grow storage and convert sparse blocks
//! to dense ones when that is cheaper, so length mismatches never fail.
//!
//! Component buffers are reference counted and shared between clones until
//! one side writes, at which point only that side copies (`Arc::make_mut`).
//! Cloning weights every optimizer round therefore costs one pointer copy per
//! component.

use std::fmt;
use std::sync::Arc;

use crate::errors::LoglinearError;
use crate::kernels::{self, KernelBackend};
use crate::model::approx_eq;

#[derive(Debug, Clone, PartialEq)]
enum Component {
    Dense(Arc<Vec<f64>>),
    Sparse(Arc<Vec<(usize, f64)>>),
}

impl Component {
    fn is_empty(&self) -> bool {
        match self {
            Component::Dense(values) => values.is_empty(),
            Component::Sparse(entries) => entries.is_empty(),
        }
    }

    /// One past the largest addressable offset.
    fn extent(&self) -> usize {
        match self {
            Component::Dense(values) => values.len(),
            Component::Sparse(entries) => sparse_extent(entries),
        }
    }

    fn value_at(&self, offset: usize) -> f64 {
        match self {
            Component::Dense(values) => values.get(offset).copied().unwrap_or(0.0),
            Component::Sparse(entries) => entries
                .iter()
                .find(|(index, _)| *index == offset)
                .map_or(0.0, |(_, value)| *value),
        }
    }

    fn dot(&self, other: &Component, backend: KernelBackend) -> f64 {
        match (self, other) {
            (Component::Sparse(a), Component::Sparse(b)) => {
                let mut sum = 0.0;
                for &(index, value) in a.iter() {
                    if let Some(&(_, theirs)) = b.iter().find(|(j, _)| *j == index) {
                        sum += value * theirs;
                    }
                }
                sum
            }
            (Component::Sparse(entries), Component::Dense(values))
            | (Component::Dense(values), Component::Sparse(entries)) => entries
                .iter()
                .filter_map(|&(index, value)| values.get(index).map(|d| d * value))
                .sum(),
            (Component::Dense(a), Component::Dense(b)) => {
                kernels::dense_dot_with_backend(a, b, backend)
            }
        }
    }

    fn scaled(&self, scale: f64) -> Component {
        match self {
            Component::Dense(values) => {
                Component::Dense(Arc::new(values.iter().map(|v| v * scale).collect()))
            }
            Component::Sparse(entries) => Component::Sparse(Arc::new(
                entries.iter().map(|&(i, v)| (i, v * scale)).collect(),
            )),
        }
    }

    fn add_scaled(&mut self, other: &Component, scale: f64) {
        let replacement = match (&mut *self, other) {
            (Component::Sparse(mine), Component::Dense(theirs)) => {
                let mut dense = vec![0.0; sparse_extent(mine).max(theirs.len())];
                for &(index, value) in mine.iter() {
                    dense[index] += value;
                }
                kernels::dense_axpy(&mut dense, theirs, scale);
                Some(Component::Dense(Arc::new(dense)))
            }
            (Component::Sparse(mine), Component::Sparse(theirs)) => {
                let max_index = mine
                    .iter()
                    .chain(theirs.iter())
                    .map(|&(index, _)| index)
                    .max()
                    .unwrap_or(0);
                let combined = mine.len() + theirs.len();
                if 2 * combined > max_index + 1 {
                    let mut dense = vec![0.0; max_index + 1];
                    for &(index, value) in mine.iter() {
                        dense[index] += value;
                    }
                    for &(index, value) in theirs.iter() {
                        dense[index] += value * scale;
                    }
                    Some(Component::Dense(Arc::new(dense)))
                } else {
                    let entries = Arc::make_mut(mine);
                    for &(index, value) in theirs.iter() {
                        match entries.iter_mut().find(|(i, _)| *i == index) {
                            Some(entry) => entry.1 += value * scale,
                            None => entries.push((index, value * scale)),
                        }
                    }
                    None
                }
            }
            (Component::Dense(mine), Component::Sparse(theirs)) => {
                if let Some(max_index) = theirs.iter().map(|&(index, _)| index).max() {
                    let values = Arc::make_mut(mine);
                    if max_index >= values.len() {
                        let mut new_len = values.len().max(1);
                        while new_len <= max_index {
                            new_len *= 2;
                        }
                        values.resize(new_len, 0.0);
                    }
                    for &(index, value) in theirs.iter() {
                        values[index] += value * scale;
                    }
                }
                None
            }
            (Component::Dense(mine), Component::Dense(theirs)) => {
                let values = Arc::make_mut(mine);
                if theirs.len() > values.len() {
                    values.resize(theirs.len(), 0.0);
                }
                kernels::dense_axpy(values, theirs, scale);
                None
            }
        };
        if let Some(component) = replacement {
            *self = component;
        }
    }

    fn multiply(&mut self, other: &Component) {
        match (self, other) {
            (Component::Sparse(mine), theirs) => {
                for entry in Arc::make_mut(mine).iter_mut() {
                    entry.1 *= theirs.value_at(entry.0);
                }
            }
            (Component::Dense(mine), Component::Sparse(theirs)) => {
                let values = Arc::make_mut(mine);
                let mut product = vec![0.0; values.len()];
                for &(index, value) in theirs.iter() {
                    if index < values.len() {
                        product[index] = values[index] * value;
                    }
                }
                *values = product;
            }
            (Component::Dense(mine), Component::Dense(theirs)) => {
                for (i, value) in Arc::make_mut(mine).iter_mut().enumerate() {
                    *value *= theirs.get(i).copied().unwrap_or(0.0);
                }
            }
        }
    }

    fn map(&mut self, f: &impl Fn(f64) -> f64) {
        match self {
            Component::Dense(values) => {
                for value in Arc::make_mut(values).iter_mut() {
                    *value = f(*value);
                }
            }
            Component::Sparse(entries) => {
                for entry in Arc::make_mut(entries).iter_mut() {
                    entry.1 = f(entry.1);
                }
            }
        }
    }
}

fn sparse_extent(entries: &[(usize, f64)]) -> usize {
    entries.iter().map(|&(index, _)| index + 1).max().unwrap_or(0)
}

/// A zero-padded concatenation of sparse or dense feature blocks.
#[derive(Debug, Clone, Default)]
pub struct ConcatVector {
    components: Vec<Option<Component>>,
}

impl ConcatVector {
    /// Creates a vector with `num_components` unset components.
    pub fn new(num_components: usize) -> Self {
        Self {
            components: vec![None; num_components],
        }
    }

    fn slot_mut(&mut self, component: usize) -> &mut Option<Component> {
        if component >= self.components.len() {
            self.components.resize(component + 1, None);
        }
        &mut self.components[component]
    }

    fn component(&self, component: usize) -> Option<&Component> {
        self.components.get(component).and_then(Option::as_ref)
    }

    /// Replaces `component` with a dense block.
    pub fn set_dense(&mut self, component: usize, values: impl Into<Vec<f64>>) {
        *self.slot_mut(component) = Some(Component::Dense(Arc::new(values.into())));
    }

    /// Replaces `component` with a one-hot sparse block.
    pub fn set_sparse(&mut self, component: usize, index: usize, value: f64) {
        *self.slot_mut(component) = Some(Component::Sparse(Arc::new(vec![(index, value)])));
    }

    /// Replaces `component` with a sparse block built from parallel slices.
    ///
    /// Empty slices produce an explicitly empty sparse component, which is
    /// distinct from an unset one for [`is_sparse`](Self::is_sparse).
    pub fn set_sparse_multi(
        &mut self,
        component: usize,
        indices: &[usize],
        values: &[f64],
    ) -> Result<(), LoglinearError> {
        if indices.len() != values.len() {
            return Err(LoglinearError::ValidationError(format!(
                "set_sparse_multi: {} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        let entries = indices.iter().copied().zip(values.iter().copied()).collect();
        *self.slot_mut(component) = Some(Component::Sparse(Arc::new(entries)));
        Ok(())
    }

    /// Sets a single slot, keeping the rest of the component.
    pub fn set_value(&mut self, component: usize, index: usize, value: f64) {
        let slot = self.slot_mut(component);
        match slot {
            None => *slot = Some(Component::Sparse(Arc::new(vec![(index, value)]))),
            Some(Component::Sparse(entries)) => {
                let entries = Arc::make_mut(entries);
                match entries.iter_mut().find(|(i, _)| *i == index) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((index, value)),
                }
            }
            Some(Component::Dense(values)) => {
                let values = Arc::make_mut(values);
                if index >= values.len() {
                    values.resize(index + 1, 0.0);
                }
                values[index] = value;
            }
        }
    }

    /// Unsets `component`; it reads as zero afterwards.
    pub fn clear_component(&mut self, component: usize) {
        if let Some(slot) = self.components.get_mut(component) {
            *slot = None;
        }
    }

    /// Number of declared component slots, set or not.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Whether `component` holds a value (dense, sparse or explicitly empty sparse).
    pub fn is_set(&self, component: usize) -> bool {
        self.component(component).is_some()
    }

    pub fn is_sparse(&self, component: usize) -> bool {
        matches!(self.component(component), Some(Component::Sparse(_)))
    }

    /// Borrow a dense component. Unset components read as an empty slice.
    pub fn dense(&self, component: usize) -> Result<&[f64], LoglinearError> {
        match self.component(component) {
            None => Ok(&[]),
            Some(Component::Dense(values)) => Ok(values.as_slice()),
            Some(Component::Sparse(_)) => Err(LoglinearError::ValidationError(format!(
                "component {component} is sparse, not dense"
            ))),
        }
    }

    /// Stored indices of a sparse component. Unset components have none.
    pub fn sparse_indices(&self, component: usize) -> Result<Vec<usize>, LoglinearError> {
        match self.component(component) {
            None => Ok(Vec::new()),
            Some(Component::Sparse(entries)) => Ok(entries.iter().map(|&(i, _)| i).collect()),
            Some(Component::Dense(_)) => Err(LoglinearError::ValidationError(format!(
                "component {component} is dense, not sparse"
            ))),
        }
    }

    /// Zero-padded read of one slot.
    pub fn value_at(&self, component: usize, offset: usize) -> f64 {
        self.component(component)
            .map_or(0.0, |c| c.value_at(offset))
    }

    /// Zero-padded dot product.
    pub fn dot(&self, other: &ConcatVector) -> f64 {
        self.dot_with_backend(other, KernelBackend::Auto)
    }

    /// Zero-padded dot product with an explicit dense-kernel backend.
    pub fn dot_with_backend(&self, other: &ConcatVector, backend: KernelBackend) -> f64 {
        self.components
            .iter()
            .zip(&other.components)
            .filter_map(|pair| match pair {
                (Some(a), Some(b)) => Some(a.dot(b, backend)),
                _ => None,
            })
            .sum()
    }

    /// `self += other * scale`.
    pub fn add_scaled_in_place(&mut self, other: &ConcatVector, scale: f64) {
        if other.components.len() > self.components.len() {
            self.components.resize(other.components.len(), None);
        }
        for (slot, theirs) in self.components.iter_mut().zip(&other.components) {
            let Some(theirs) = theirs else {
                continue;
            };
            if let Some(mine) = slot.as_mut().filter(|mine| !mine.is_empty()) {
                mine.add_scaled(theirs, scale);
            } else if scale == 1.0 {
                *slot = Some(theirs.clone());
            } else {
                *slot = Some(theirs.scaled(scale));
            }
        }
    }

    /// Elementwise product. Components missing from `other` become unset.
    pub fn elementwise_multiply_in_place(&mut self, other: &ConcatVector) {
        for (i, slot) in self.components.iter_mut().enumerate() {
            let Some(theirs) = other.component(i) else {
                *slot = None;
                continue;
            };
            if let Some(mine) = slot.as_mut() {
                mine.multiply(theirs);
            }
        }
    }

    /// Applies `f` to every stored value: each dense slot and each sparse
    /// pair, never to implicit zeros.
    pub fn map_in_place(&mut self, f: impl Fn(f64) -> f64) {
        for component in self.components.iter_mut().flatten() {
            component.map(&f);
        }
    }

    /// Copy-on-write clone. Buffers are shared until either side writes.
    pub fn deep_clone(&self) -> ConcatVector {
        self.clone()
    }

    /// Zero vector with the same dense component shapes; sparse and unset
    /// components are left unset.
    pub fn new_empty_clone(&self) -> ConcatVector {
        let components = self
            .components
            .iter()
            .map(|slot| match slot {
                Some(Component::Dense(values)) => {
                    Some(Component::Dense(Arc::new(vec![0.0; values.len()])))
                }
                _ => None,
            })
            .collect();
        ConcatVector { components }
    }

    /// Zero-padded numeric equality, independent of representation.
    pub fn value_equals(&self, other: &ConcatVector, tolerance: f64) -> bool {
        let count = self.components.len().max(other.components.len());
        (0..count).all(|c| {
            let extent = self
                .component(c)
                .map_or(0, Component::extent)
                .max(other.component(c).map_or(0, Component::extent));
            (0..extent).all(|offset| {
                approx_eq(self.value_at(c, offset), other.value_at(c, offset), tolerance)
            })
        })
    }

    /// Flattens into the persisted record layout.
    pub fn to_record(&self) -> ConcatVectorRecord {
        let components = self
            .components
            .iter()
            .map(|slot| match slot {
                None => ComponentRecord::Unset,
                Some(Component::Dense(values)) => ComponentRecord::Dense(values.to_vec()),
                Some(Component::Sparse(entries)) => ComponentRecord::Sparse(
                    entries
                        .iter()
                        .flat_map(|&(index, value)| [index as f64, value])
                        .collect(),
                ),
            })
            .collect();
        ConcatVectorRecord { components }
    }

    /// Rebuilds a vector from its persisted record.
    pub fn from_record(record: ConcatVectorRecord) -> Result<Self, LoglinearError> {
        let mut vector = ConcatVector::new(record.components.len());
        for (c, component) in record.components.into_iter().enumerate() {
            let data = match component {
                ComponentRecord::Unset => continue,
                ComponentRecord::Dense(values) => {
                    vector.set_dense(c, values);
                    continue;
                }
                ComponentRecord::Sparse(data) => data,
            };
            if data.len() % 2 != 0 {
                return Err(LoglinearError::Serialization(format!(
                    "sparse component {c} has odd data length {}",
                    data.len()
                )));
            }
            let mut entries = Vec::with_capacity(data.len() / 2);
            for pair in data.chunks_exact(2) {
                let index = pair[0];
                if !index.is_finite() || index < 0.0 || index.fract() != 0.0 {
                    return Err(LoglinearError::Serialization(format!(
                        "sparse component {c} has invalid index {index}"
                    )));
                }
                entries.push((index as usize, pair[1]));
            }
            *vector.slot_mut(c) = Some(Component::Sparse(Arc::new(entries)));
        }
        Ok(vector)
    }

    /// Writes one length-prefixed record.
    #[cfg(feature = "serde")]
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<(), LoglinearError> {
        crate::storage::write_record(writer, &self.to_record())
    }

    /// Reads one length-prefixed record.
    #[cfg(feature = "serde")]
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self, LoglinearError> {
        Self::from_record(crate::storage::read_record(reader)?)
    }

    #[cfg(test)]
    fn shares_storage(&self, other: &ConcatVector, component: usize) -> bool {
        match (self.component(component), other.component(component)) {
            (Some(Component::Dense(a)), Some(Component::Dense(b))) => Arc::ptr_eq(a, b),
            (Some(Component::Sparse(a)), Some(Component::Sparse(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for ConcatVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (c, slot) in self.components.iter().enumerate() {
            if c > 0 {
                write!(f, ", ")?;
            }
            match slot {
                None => write!(f, "{c}: -")?,
                Some(Component::Dense(values)) => write!(f, "{c}: {values:?}")?,
                Some(Component::Sparse(entries)) => {
                    write!(f, "{c}: {{")?;
                    for (k, (index, value)) in entries.iter().enumerate() {
                        if k > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{index}: {value}")?;
                    }
                    write!(f, "}}")?;
                }
            }
        }
        write!(f, "]")
    }
}

/// Persisted form of a [`ConcatVector`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConcatVectorRecord {
    pub components: Vec<ComponentRecord>,
}

/// One persisted component.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ComponentRecord {
    /// Never written; reads as zero everywhere.
    #[default]
    Unset,
    Dense(Vec<f64>),
    /// Interleaved `[index, value, ...]` pairs.
    Sparse(Vec<f64>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed() -> ConcatVector {
        let mut v = ConcatVector::new(3);
        v.set_dense(0, vec![1.0, 2.0, 3.0]);
        v.set_sparse(1, 4, 2.5);
        v
    }

    #[test]
    fn dot_is_zero_padded_across_representations() {
        let mut dense = ConcatVector::new(0);
        dense.set_dense(1, vec![0.0, 0.0, 0.0, 0.0, 1.0, 7.0]);
        dense.set_dense(5, vec![3.0]);
        let v = mixed();
        assert_eq!(v.dot(&dense), 2.5);
        assert_eq!(dense.dot(&v), 2.5);

        let mut sparse = ConcatVector::new(1);
        sparse
            .set_sparse_multi(0, &[0, 2, 9], &[1.0, 1.0, 1.0])
            .expect("sparse");
        assert_eq!(v.dot(&sparse), 4.0);
        assert_eq!(sparse.dot(&v), 4.0);
    }

    #[test]
    fn set_sparse_multi_rejects_mismatched_lengths() {
        let mut v = ConcatVector::new(1);
        assert!(matches!(
            v.set_sparse_multi(0, &[1, 2], &[1.0]),
            Err(LoglinearError::ValidationError(_))
        ));
    }

    #[test]
    fn empty_sparse_component_is_distinct_from_unset() {
        let mut v = ConcatVector::new(2);
        v.set_sparse_multi(1, &[], &[]).expect("empty sparse");
        assert!(v.is_sparse(1));
        assert!(v.is_set(1));
        assert!(!v.is_set(0));
        assert!(v.sparse_indices(1).expect("indices").is_empty());
    }

    #[test]
    fn setters_grow_component_list() {
        let mut v = ConcatVector::new(0);
        v.set_sparse(4, 1, 1.0);
        assert_eq!(v.component_count(), 5);
        assert_eq!(v.value_at(4, 1), 1.0);
        assert_eq!(v.value_at(9, 9), 0.0);
    }

    #[test]
    fn dense_accessor_rejects_sparse_component() {
        let v = mixed();
        assert_eq!(v.dense(0).expect("dense"), &[1.0, 2.0, 3.0]);
        assert!(v.dense(1).is_err());
        assert!(v.dense(2).expect("unset").is_empty());
        assert!(v.sparse_indices(0).is_err());
    }

    #[test]
    fn sparse_plus_sparse_stays_sparse_when_thin() {
        let mut a = ConcatVector::new(1);
        a.set_sparse(0, 100, 1.0);
        let mut b = ConcatVector::new(1);
        b.set_sparse(0, 50, 2.0);
        a.add_scaled_in_place(&b, 2.0);
        assert!(a.is_sparse(0));
        assert_eq!(a.value_at(0, 100), 1.0);
        assert_eq!(a.value_at(0, 50), 4.0);

        a.add_scaled_in_place(&b, 1.0);
        assert_eq!(a.value_at(0, 50), 6.0);
        assert_eq!(a.sparse_indices(0).expect("sparse").len(), 2);
    }

    #[test]
    fn sparse_plus_sparse_densifies_when_crowded() {
        let mut a = ConcatVector::new(1);
        a.set_sparse(0, 1, 1.0);
        let mut b = ConcatVector::new(1);
        b.set_sparse(0, 2, 1.0);
        a.add_scaled_in_place(&b, -1.0);
        assert!(!a.is_sparse(0));
        assert_eq!(a.dense(0).expect("dense"), &[0.0, 1.0, -1.0]);
    }

    #[test]
    fn sparse_plus_dense_becomes_dense() {
        let mut a = ConcatVector::new(1);
        a.set_sparse(0, 5, 1.0);
        let mut b = ConcatVector::new(1);
        b.set_dense(0, vec![1.0, 1.0]);
        a.add_scaled_in_place(&b, 3.0);
        assert_eq!(a.dense(0).expect("dense"), &[3.0, 3.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn dense_plus_sparse_grows_buffer() {
        let mut a = ConcatVector::new(1);
        a.set_dense(0, vec![1.0, 1.0]);
        let mut b = ConcatVector::new(1);
        b.set_sparse(0, 6, 2.0);
        a.add_scaled_in_place(&b, 1.0);
        assert!(a.dense(0).expect("dense").len() > 6);
        assert_eq!(a.value_at(0, 6), 2.0);
        assert_eq!(a.value_at(0, 0), 1.0);
    }

    #[test]
    fn add_into_unset_shares_or_scales() {
        let b = mixed();
        let mut a = ConcatVector::new(0);
        a.add_scaled_in_place(&b, 1.0);
        assert!(a.shares_storage(&b, 0));
        assert!(a.value_equals(&b, 0.0));

        let mut c = ConcatVector::new(0);
        c.add_scaled_in_place(&b, -2.0);
        assert_eq!(c.value_at(0, 2), -6.0);
        assert_eq!(c.value_at(1, 4), -5.0);
    }

    #[test]
    fn deep_clone_copies_on_write() {
        let original = mixed();
        let mut copy = original.deep_clone();
        assert!(copy.shares_storage(&original, 0));

        copy.map_in_place(|x| x * 10.0);
        assert!(!copy.shares_storage(&original, 0));
        assert_eq!(original.value_at(0, 1), 2.0);
        assert_eq!(copy.value_at(0, 1), 20.0);
        assert_eq!(copy.value_at(1, 4), 25.0);
    }

    #[test]
    fn map_skips_implicit_sparse_zeros() {
        let mut v = mixed();
        v.map_in_place(|x| x + 1.0);
        assert_eq!(v.value_at(1, 4), 3.5);
        assert_eq!(v.value_at(1, 0), 0.0);
        assert_eq!(v.value_at(0, 0), 2.0);
    }

    #[test]
    fn elementwise_multiply_drops_missing_components() {
        let mut a = mixed();
        let mut b = ConcatVector::new(1);
        b.set_sparse_multi(0, &[0, 2], &[2.0, 3.0]).expect("sparse");
        a.elementwise_multiply_in_place(&b);
        assert_eq!(a.dense(0).expect("dense"), &[2.0, 0.0, 9.0]);
        assert!(!a.is_set(1));

        let mut s = ConcatVector::new(1);
        s.set_sparse_multi(0, &[1, 7], &[4.0, 4.0]).expect("sparse");
        let mut d = ConcatVector::new(1);
        d.set_dense(0, vec![1.0, 0.5]);
        s.elementwise_multiply_in_place(&d);
        assert_eq!(s.value_at(0, 1), 2.0);
        assert_eq!(s.value_at(0, 7), 0.0);
    }

    #[test]
    fn new_empty_clone_keeps_dense_shapes_only() {
        let v = mixed();
        let empty = v.new_empty_clone();
        assert_eq!(empty.component_count(), 3);
        assert_eq!(empty.dense(0).expect("dense"), &[0.0, 0.0, 0.0]);
        assert!(!empty.is_set(1));
    }

    #[test]
    fn set_value_pins_single_slot() {
        let mut v = mixed();
        v.set_value(0, 5, 9.0);
        v.set_value(1, 4, -1.0);
        v.set_value(2, 3, 1.0);
        assert_eq!(v.dense(0).expect("dense"), &[1.0, 2.0, 3.0, 0.0, 0.0, 9.0]);
        assert_eq!(v.value_at(1, 4), -1.0);
        assert!(v.is_sparse(2));
    }

    #[test]
    fn value_equals_ignores_representation_and_padding() {
        let mut dense = ConcatVector::new(4);
        dense.set_dense(0, vec![1.0, 2.0, 3.0, 0.0]);
        dense.set_dense(1, vec![0.0, 0.0, 0.0, 0.0, 2.5]);
        assert!(dense.value_equals(&mixed(), 1e-9));
        dense.set_value(3, 0, 1e-3);
        assert!(!dense.value_equals(&mixed(), 1e-6));
    }

    #[test]
    fn record_preserves_layout() {
        let v = mixed();
        let record = v.to_record();
        assert_eq!(record.components.len(), 3);
        assert_eq!(record.components[1], ComponentRecord::Sparse(vec![4.0, 2.5]));
        assert_eq!(record.components[2], ComponentRecord::Unset);
        let back = ConcatVector::from_record(record).expect("record");
        assert!(back.value_equals(&v, 0.0));
        assert!(back.is_sparse(1));
        for c in 0..3 {
            assert_eq!(back.is_set(c), v.is_set(c), "component {c}");
            assert_eq!(back.is_sparse(c), v.is_sparse(c), "component {c}");
        }
        assert!(!back.is_set(2));
    }

    #[test]
    fn record_rejects_odd_sparse_payload() {
        let record = ConcatVectorRecord {
            components: vec![ComponentRecord::Sparse(vec![1.0])],
        };
        assert!(matches!(
            ConcatVector::from_record(record),
            Err(LoglinearError::Serialization(_))
        ));
    }

    #[test]
    fn display_renders_each_component() {
        let text = mixed().to_string();
        assert!(text.contains("0: [1.0, 2.0, 3.0]"));
        assert!(text.contains("1: {4: 2.5}"));
        assert!(text.contains("2: -"));
    }
}

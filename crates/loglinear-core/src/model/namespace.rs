//! Named feature blocks.
//!
//! A [`ConcatVectorNamespace`] assigns each feature name a component index and,
//! for sparse features, each feature value a slot within that component, so
//! featurizers can build [`ConcatVector`]s by name. Lookups insert on first
//! use and may run from several featurizer threads at once.

use std::collections::HashMap;
use std::io::Write;

use parking_lot::RwLock;

use crate::errors::LoglinearError;
use crate::model::concat_vector::ConcatVector;

/// Feature name reserved for the bias component.
pub const ALWAYS_ONE_FEATURE: &str = "__loglinear__.always_one";

#[derive(Debug, Default)]
struct NamespaceState {
    feature_to_index: HashMap<String, usize>,
    sparse_index: HashMap<String, HashMap<String, usize>>,
    reverse_sparse_index: HashMap<String, HashMap<usize, String>>,
}

impl NamespaceState {
    fn insert_sparse(&mut self, feature: &str, value: &str, index: usize) {
        self.sparse_index
            .entry(feature.to_string())
            .or_default()
            .insert(value.to_string(), index);
        self.reverse_sparse_index
            .entry(feature.to_string())
            .or_default()
            .insert(index, value.to_string());
    }
}

/// Thread-safe mapping from feature names to vector layout.
#[derive(Debug, Default)]
pub struct ConcatVectorNamespace {
    state: RwLock<NamespaceState>,
}

impl ConcatVectorNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feature_count(&self) -> usize {
        self.state.read().feature_to_index.len()
    }

    /// Component index of `feature`, allocating one if needed.
    pub fn ensure_feature(&self, feature: &str) -> usize {
        if let Some(&index) = self.state.read().feature_to_index.get(feature) {
            return index;
        }
        let mut state = self.state.write();
        let next = state.feature_to_index.len();
        *state
            .feature_to_index
            .entry(feature.to_string())
            .or_insert(next)
    }

    /// Slot of `value` within sparse `feature`, allocating both if needed.
    pub fn ensure_sparse_feature(&self, feature: &str, value: &str) -> usize {
        self.ensure_feature(feature);
        if let Some(&index) = self
            .state
            .read()
            .sparse_index
            .get(feature)
            .and_then(|values| values.get(value))
        {
            return index;
        }
        let mut state = self.state.write();
        let existing = state
            .sparse_index
            .get(feature)
            .and_then(|values| values.get(value))
            .copied();
        if let Some(index) = existing {
            return index;
        }
        let next = state.sparse_index.get(feature).map_or(0, HashMap::len);
        state.insert_sparse(feature, value, next);
        next
    }

    /// Empty vector sized for every known feature.
    pub fn new_vector(&self) -> ConcatVector {
        ConcatVector::new(self.feature_count())
    }

    /// Weight vector with a dense zero block for every sparse feature, sized
    /// to the values seen so far.
    pub fn new_weights_vector(&self) -> ConcatVector {
        let state = self.state.read();
        let mut vector = ConcatVector::new(state.feature_to_index.len());
        for (feature, values) in &state.sparse_index {
            if let Some(&component) = state.feature_to_index.get(feature) {
                vector.set_dense(component, vec![0.0; values.len()]);
            }
        }
        vector
    }

    pub fn set_always_one_feature(&self, vector: &mut ConcatVector, value: f64) {
        self.set_dense_feature(vector, ALWAYS_ONE_FEATURE, vec![value]);
    }

    pub fn set_dense_feature(&self, vector: &mut ConcatVector, feature: &str, values: Vec<f64>) {
        vector.set_dense(self.ensure_feature(feature), values);
    }

    /// One-hot sparse feature `feature = value` with weight `weight`.
    pub fn set_sparse_feature(
        &self,
        vector: &mut ConcatVector,
        feature: &str,
        value: &str,
        weight: f64,
    ) {
        let index = self.ensure_sparse_feature(feature, value);
        vector.set_sparse(self.ensure_feature(feature), index, weight);
    }

    /// Sparse feature with several weighted values.
    pub fn set_sparse_features<'a>(
        &self,
        vector: &mut ConcatVector,
        feature: &str,
        values: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Result<(), LoglinearError> {
        let (indices, weights): (Vec<usize>, Vec<f64>) = values
            .into_iter()
            .map(|(value, weight)| (self.ensure_sparse_feature(feature, value), weight))
            .unzip();
        vector.set_sparse_multi(self.ensure_feature(feature), &indices, &weights)
    }

    /// Sparse feature with weight 1.0 on each listed value.
    pub fn set_sparse_indicators<'a>(
        &self,
        vector: &mut ConcatVector,
        feature: &str,
        values: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), LoglinearError> {
        self.set_sparse_features(vector, feature, values.into_iter().map(|v| (v, 1.0)))
    }

    /// Writes `vector` one feature per block, with sparse slots shown by value
    /// name, in component order.
    pub fn debug_vector<W: Write>(
        &self,
        vector: &ConcatVector,
        out: &mut W,
    ) -> Result<(), LoglinearError> {
        let state = self.state.read();
        let mut features: Vec<(&String, &usize)> = state.feature_to_index.iter().collect();
        features.sort_by_key(|entry| *entry.1);
        for (feature, &component) in features {
            writeln!(out, "{feature}:")?;
            let offsets: Vec<usize> = if vector.is_sparse(component) {
                vector.sparse_indices(component)?
            } else {
                (0..vector.dense(component)?.len()).collect()
            };
            let names = state.reverse_sparse_index.get(feature.as_str());
            for offset in offsets {
                let value = vector.value_at(component, offset);
                match names.and_then(|n| n.get(&offset)) {
                    Some(name) => writeln!(out, "\t{name}: {value}")?,
                    None => writeln!(out, "\t{offset}: {value}")?,
                }
            }
        }
        Ok(())
    }

    pub fn to_record(&self) -> NamespaceRecord {
        let state = self.state.read();
        let mut features: Vec<(String, usize)> = state
            .feature_to_index
            .iter()
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        features.sort_by_key(|(_, index)| *index);
        let mut sparse: Vec<SparseFeatureRecord> = state
            .sparse_index
            .iter()
            .map(|(feature, values)| {
                let mut values: Vec<(String, usize)> =
                    values.iter().map(|(k, &v)| (k.clone(), v)).collect();
                values.sort_by_key(|(_, index)| *index);
                SparseFeatureRecord {
                    feature: feature.clone(),
                    values,
                }
            })
            .collect();
        sparse.sort_by(|a, b| a.feature.cmp(&b.feature));
        NamespaceRecord { features, sparse }
    }

    pub fn from_record(record: NamespaceRecord) -> Self {
        let mut state = NamespaceState {
            feature_to_index: record.features.into_iter().collect(),
            ..NamespaceState::default()
        };
        for sparse in record.sparse {
            for (value, index) in sparse.values {
                state.insert_sparse(&sparse.feature, &value, index);
            }
        }
        Self {
            state: RwLock::new(state),
        }
    }

    #[cfg(feature = "serde")]
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), LoglinearError> {
        crate::storage::write_record(writer, &self.to_record())
    }

    #[cfg(feature = "serde")]
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self, LoglinearError> {
        Ok(Self::from_record(crate::storage::read_record(reader)?))
    }
}

/// Persisted namespace: feature indices and sparse value indices.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NamespaceRecord {
    pub features: Vec<(String, usize)>,
    pub sparse: Vec<SparseFeatureRecord>,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseFeatureRecord {
    pub feature: String,
    pub values: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_are_indexed_in_first_use_order() {
        let namespace = ConcatVectorNamespace::new();
        assert_eq!(namespace.ensure_feature("word"), 0);
        assert_eq!(namespace.ensure_feature("shape"), 1);
        assert_eq!(namespace.ensure_feature("word"), 0);
        assert_eq!(namespace.ensure_sparse_feature("word", "the"), 0);
        assert_eq!(namespace.ensure_sparse_feature("word", "cat"), 1);
        assert_eq!(namespace.ensure_sparse_feature("word", "the"), 0);
        assert_eq!(namespace.ensure_sparse_feature("tag", "NN"), 0);
        assert_eq!(namespace.feature_count(), 3);
    }

    #[test]
    fn feature_vectors_dot_against_weights() {
        let namespace = ConcatVectorNamespace::new();
        let mut features = namespace.new_vector();
        namespace.set_sparse_feature(&mut features, "word", "cat", 1.0);
        namespace.set_always_one_feature(&mut features, 1.0);
        namespace
            .set_sparse_indicators(&mut features, "suffix", ["at", "t"])
            .expect("indicators");

        let mut weights = namespace.new_weights_vector();
        assert_eq!(weights.dense(0).expect("dense").len(), 1);
        weights.set_value(0, 0, 2.0);
        weights.set_dense(1, vec![0.5]);
        weights.set_dense(2, vec![1.0, 1.0]);
        assert_eq!(features.dot(&weights), 4.5);
    }

    #[test]
    fn debug_vector_names_sparse_slots() {
        let namespace = ConcatVectorNamespace::new();
        let mut v = namespace.new_vector();
        namespace
            .set_sparse_features(&mut v, "word", [("dog", 2.0), ("cat", -1.0)])
            .expect("sparse");
        namespace.set_dense_feature(&mut v, "len", vec![3.0]);
        let mut out = Vec::new();
        namespace.debug_vector(&v, &mut out).expect("debug");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "word:\n\tdog: 2\n\tcat: -1\nlen:\n\t0: 3\n");
    }

    #[test]
    fn record_round_trip_restores_reverse_index() {
        let namespace = ConcatVectorNamespace::new();
        namespace.ensure_sparse_feature("word", "a");
        namespace.ensure_sparse_feature("word", "b");
        namespace.ensure_feature("bias");
        let restored = ConcatVectorNamespace::from_record(namespace.to_record());
        assert_eq!(restored.to_record(), namespace.to_record());
        assert_eq!(restored.ensure_sparse_feature("word", "b"), 1);
        assert_eq!(restored.ensure_feature("fresh"), 2);

        let mut v = restored.new_vector();
        restored.set_sparse_feature(&mut v, "word", "b", 1.0);
        let mut out = Vec::new();
        restored.debug_vector(&v, &mut out).expect("debug");
        assert!(String::from_utf8(out).expect("utf8").contains("\tb: 1"));
    }
}

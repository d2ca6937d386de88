//! Factor graphs over integer-indexed discrete variables.
//!
//! A [`GraphicalModel`] is a set of factors plus free-form string metadata on
//! the model and on each variable. Observations and training labels are
//! stored in variable metadata under the reserved keys
//! [`VARIABLE_OBSERVED_VALUE`] and [`VARIABLE_TRAINING_VALUE`], so a model
//! can be re-observed between inference calls without rebuilding factors.
//!
//! ## Factor values
//!
//! Every factor table holds *log* values: a vector factor's log value at an
//! assignment is `features · weights`, a static factor's is the stored number.
//! Inference exponentiates them.
//!
//! ## Identity
//!
//! Factors are set members by identity. Each factor gets a [`FactorId`] when
//! it is added, unique within its model; inference caches key on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::errors::LoglinearError;
use crate::kernels::KernelBackend;
use crate::model::concat_vector::ConcatVector;
use crate::model::concat_vector_table::{ConcatVectorTable, ConcatVectorTableRecord};
use crate::model::nd_array::{Assignments, NdArray, NdArrayDoubles, NdArrayRecord};

/// Variable metadata key holding the observed value as a decimal string.
pub const VARIABLE_OBSERVED_VALUE: &str = "loglinear.inference.observed_value";

/// Variable metadata key holding the gold training label as a decimal string.
pub const VARIABLE_TRAINING_VALUE: &str = "loglinear.learning.training_value";

/// Free-form string metadata.
pub type Metadata = HashMap<String, String>;

static NEXT_MODEL_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn next_model_instance() -> u64 {
    NEXT_MODEL_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Identifier of a factor within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FactorId(pub u64);

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factor#{}", self.0)
    }
}

/// The value table behind a factor.
#[derive(Debug, Clone)]
pub enum FactorTable {
    /// Per-assignment feature vectors, scored against the weights.
    Vector(ConcatVectorTable),
    /// Fixed log values, independent of the weights.
    Static(NdArrayDoubles),
}

impl FactorTable {
    pub fn dimensions(&self) -> &[usize] {
        match self {
            FactorTable::Vector(table) => table.dimensions(),
            FactorTable::Static(table) => table.dimensions(),
        }
    }

    /// Restricts `axis` to `value`. Feature cells stay shared and unevaluated.
    pub fn observe(&self, axis: usize, value: usize) -> Result<FactorTable, LoglinearError> {
        Ok(match self {
            FactorTable::Vector(table) => FactorTable::Vector(table.observe(axis, value)?),
            FactorTable::Static(table) => FactorTable::Static(table.observe(axis, value)?),
        })
    }

    /// Log value of every cell under `weights`.
    pub fn log_values(&self, weights: &ConcatVector, backend: KernelBackend) -> NdArrayDoubles {
        match self {
            FactorTable::Vector(table) => table.weighted(weights, backend),
            FactorTable::Static(table) => table.clone(),
        }
    }

    pub fn log_value(
        &self,
        assignment: &[usize],
        weights: &ConcatVector,
        backend: KernelBackend,
    ) -> Result<f64, LoglinearError> {
        match self {
            FactorTable::Vector(table) => Ok(table
                .assignment_value(assignment)?
                .dot_with_backend(weights, backend)),
            FactorTable::Static(table) => table.try_get(assignment).copied(),
        }
    }

    pub fn value_equals(&self, other: &FactorTable, tolerance: f64) -> bool {
        match (self, other) {
            (FactorTable::Vector(a), FactorTable::Vector(b)) => a.value_equals(b, tolerance),
            (FactorTable::Static(a), FactorTable::Static(b)) => a.value_equals(b, tolerance),
            _ => false,
        }
    }
}

/// A factor: an ordered tuple of variables plus a table over their states.
#[derive(Debug, Clone)]
pub struct Factor {
    id: FactorId,
    neighbors: SmallVec<[usize; 4]>,
    table: FactorTable,
    metadata: Metadata,
}

impl Factor {
    pub fn id(&self) -> FactorId {
        self.id
    }

    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    /// Cardinality of each neighbor, in neighbor order.
    pub fn dimensions(&self) -> &[usize] {
        self.table.dimensions()
    }

    pub fn table(&self) -> &FactorTable {
        &self.table
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.table, FactorTable::Vector(_))
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Log value at `assignment` under `weights`.
    pub fn log_value(
        &self,
        assignment: &[usize],
        weights: &ConcatVector,
    ) -> Result<f64, LoglinearError> {
        self.table.log_value(assignment, weights, KernelBackend::Auto)
    }

    /// Feature vector at `assignment`; `None` for static factors.
    pub fn features(&self, assignment: &[usize]) -> Result<Option<ConcatVector>, LoglinearError> {
        match &self.table {
            FactorTable::Vector(table) => table.assignment_value(assignment).map(Some),
            FactorTable::Static(_) => Ok(None),
        }
    }

    /// Number of joint states of the neighbors; a proxy for inference cost.
    pub fn combinatorial_state_count(&self) -> usize {
        self.dimensions().iter().product()
    }

    /// Same neighbors, metadata and table values. Ids are ignored.
    pub fn value_equals(&self, other: &Factor, tolerance: f64) -> bool {
        self.neighbors == other.neighbors
            && self.metadata == other.metadata
            && self.table.value_equals(&other.table, tolerance)
    }
}

/// A set of factors over integer-indexed variables, plus metadata.
#[derive(Debug)]
pub struct GraphicalModel {
    instance: u64,
    model_metadata: Metadata,
    variable_metadata: Vec<Metadata>,
    factors: Vec<Factor>,
    next_factor_id: u64,
}

impl Default for GraphicalModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for GraphicalModel {
    /// Deep copy of tables and metadata. Feature producers and already
    /// computed feature cells are shared. The clone is a distinct model
    /// instance for inference caching purposes.
    fn clone(&self) -> Self {
        Self {
            instance: next_model_instance(),
            model_metadata: self.model_metadata.clone(),
            variable_metadata: self.variable_metadata.clone(),
            factors: self.factors.clone(),
            next_factor_id: self.next_factor_id,
        }
    }
}

impl GraphicalModel {
    pub fn new() -> Self {
        Self {
            instance: next_model_instance(),
            model_metadata: Metadata::new(),
            variable_metadata: Vec::new(),
            factors: Vec::new(),
            next_factor_id: 0,
        }
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance
    }

    /// Deep copy; see the `Clone` impl.
    pub fn clone_model(&self) -> GraphicalModel {
        self.clone()
    }

    pub fn model_metadata(&self) -> &Metadata {
        &self.model_metadata
    }

    pub fn model_metadata_mut(&mut self) -> &mut Metadata {
        &mut self.model_metadata
    }

    /// Metadata of `variable`, if it was ever created.
    pub fn variable_metadata(&self, variable: usize) -> Option<&Metadata> {
        self.variable_metadata.get(variable)
    }

    /// Metadata of `variable`, growing the metadata list as needed. Repeated
    /// calls return the same map.
    pub fn variable_metadata_mut(&mut self, variable: usize) -> &mut Metadata {
        if variable >= self.variable_metadata.len() {
            self.variable_metadata.resize_with(variable + 1, Metadata::new);
        }
        &mut self.variable_metadata[variable]
    }

    fn metadata_value(&self, variable: usize, key: &str) -> Result<Option<usize>, LoglinearError> {
        let Some(raw) = self.variable_metadata(variable).and_then(|m| m.get(key)) else {
            return Ok(None);
        };
        raw.trim().parse::<usize>().map(Some).map_err(|_| {
            LoglinearError::ValidationError(format!(
                "variable {variable}: metadata {key} = {raw:?} is not a state index"
            ))
        })
    }

    /// Fixes `variable` to `value` for subsequent inference.
    pub fn observe(&mut self, variable: usize, value: usize) {
        self.variable_metadata_mut(variable)
            .insert(VARIABLE_OBSERVED_VALUE.to_string(), value.to_string());
    }

    /// Clears an observation. Returns the previous value, if any.
    pub fn unobserve(&mut self, variable: usize) -> Option<String> {
        self.variable_metadata
            .get_mut(variable)
            .and_then(|m| m.remove(VARIABLE_OBSERVED_VALUE))
    }

    pub fn observed_value(&self, variable: usize) -> Result<Option<usize>, LoglinearError> {
        self.metadata_value(variable, VARIABLE_OBSERVED_VALUE)
    }

    pub fn set_training_label(&mut self, variable: usize, value: usize) {
        self.variable_metadata_mut(variable)
            .insert(VARIABLE_TRAINING_VALUE.to_string(), value.to_string());
    }

    pub fn training_label(&self, variable: usize) -> Result<Option<usize>, LoglinearError> {
        self.metadata_value(variable, VARIABLE_TRAINING_VALUE)
    }

    /// One past the largest variable index touched by any factor.
    pub fn num_variables(&self) -> usize {
        self.factors
            .iter()
            .flat_map(|f| f.neighbors().iter())
            .map(|&n| n + 1)
            .max()
            .unwrap_or(0)
    }

    /// Smallest variable index no factor touches yet.
    pub fn next_variable_index(&self) -> usize {
        self.num_variables()
    }

    /// Cardinality of `variable`, if any factor touches it.
    pub fn variable_size(&self, variable: usize) -> Option<usize> {
        self.factors.iter().find_map(|f| {
            f.neighbors()
                .iter()
                .position(|&n| n == variable)
                .map(|axis| f.dimensions()[axis])
        })
    }

    /// Cardinality of every variable below [`num_variables`](Self::num_variables).
    pub fn variable_sizes(&self) -> Vec<Option<usize>> {
        let mut sizes = vec![None; self.num_variables()];
        for factor in &self.factors {
            for (&n, &d) in factor.neighbors().iter().zip(factor.dimensions()) {
                sizes[n] = Some(d);
            }
        }
        sizes
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    pub fn factor(&self, id: FactorId) -> Option<&Factor> {
        self.factors.iter().find(|f| f.id == id)
    }

    pub fn factor_metadata_mut(&mut self, id: FactorId) -> Option<&mut Metadata> {
        self.factors
            .iter_mut()
            .find(|f| f.id == id)
            .map(Factor::metadata_mut)
    }

    pub fn remove_factor(&mut self, id: FactorId) -> Option<Factor> {
        let position = self.factors.iter().position(|f| f.id == id)?;
        Some(self.factors.remove(position))
    }

    fn insert_factor(
        &mut self,
        neighbors: &[usize],
        table: FactorTable,
        metadata: Metadata,
    ) -> Result<FactorId, LoglinearError> {
        let dimensions = table.dimensions();
        if dimensions.len() != neighbors.len() {
            return Err(LoglinearError::ValidationError(format!(
                "factor over {} neighbors has a {}-dimensional table",
                neighbors.len(),
                dimensions.len()
            )));
        }
        for (i, &n) in neighbors.iter().enumerate() {
            if neighbors[..i].contains(&n) {
                return Err(LoglinearError::ValidationError(format!(
                    "variable {n} appears twice in factor neighbors {neighbors:?}"
                )));
            }
            if let Some(existing) = self.variable_size(n) {
                if existing != dimensions[i] {
                    return Err(LoglinearError::ValidationError(format!(
                        "variable {n} has cardinality {existing} in existing factors but {} in the new one",
                        dimensions[i]
                    )));
                }
            }
        }

        let id = FactorId(self.next_factor_id);
        self.next_factor_id += 1;
        self.factors.push(Factor {
            id,
            neighbors: SmallVec::from_slice(neighbors),
            table,
            metadata,
        });
        Ok(id)
    }

    /// Adds a vector factor whose features at an assignment are
    /// `featurizer(assignment)`, computed lazily and at most once per cell.
    pub fn add_factor<F>(
        &mut self,
        neighbors: &[usize],
        dimensions: &[usize],
        featurizer: F,
    ) -> Result<FactorId, LoglinearError>
    where
        F: Fn(&[usize]) -> ConcatVector + Send + Sync + 'static,
    {
        let table = ConcatVectorTable::from_producer(dimensions, Arc::new(featurizer))?;
        self.add_factor_table(table, neighbors)
    }

    /// Adds a vector factor from a prebuilt feature table.
    pub fn add_factor_table(
        &mut self,
        table: ConcatVectorTable,
        neighbors: &[usize],
    ) -> Result<FactorId, LoglinearError> {
        self.insert_factor(neighbors, FactorTable::Vector(table), Metadata::new())
    }

    /// Pairwise vector factor.
    pub fn add_binary_factor<F>(
        &mut self,
        a: usize,
        card_a: usize,
        b: usize,
        card_b: usize,
        featurizer: F,
    ) -> Result<FactorId, LoglinearError>
    where
        F: Fn(usize, usize) -> ConcatVector + Send + Sync + 'static,
    {
        self.add_factor(&[a, b], &[card_a, card_b], move |assignment: &[usize]| {
            featurizer(assignment[0], assignment[1])
        })
    }

    /// Pairwise vector factor between two variables that existing factors
    /// already size.
    pub fn add_binary_factor_between<F>(
        &mut self,
        a: usize,
        b: usize,
        featurizer: F,
    ) -> Result<FactorId, LoglinearError>
    where
        F: Fn(usize, usize) -> ConcatVector + Send + Sync + 'static,
    {
        let size_of = |variable: usize| {
            self.variable_size(variable).ok_or_else(|| {
                LoglinearError::ValidationError(format!(
                    "variable {variable} has no known cardinality; add a factor over it first"
                ))
            })
        };
        let (card_a, card_b) = (size_of(a)?, size_of(b)?);
        self.add_binary_factor(a, card_a, b, card_b, featurizer)
    }

    /// Adds a static factor with log values `value(assignment)`.
    pub fn add_static_factor(
        &mut self,
        neighbors: &[usize],
        dimensions: &[usize],
        value: impl FnMut(&[usize]) -> f64,
    ) -> Result<FactorId, LoglinearError> {
        let table = NdArray::from_fn(dimensions, value)?;
        self.add_static_factor_table(table, neighbors)
    }

    pub fn add_static_factor_table(
        &mut self,
        table: NdArrayDoubles,
        neighbors: &[usize],
    ) -> Result<FactorId, LoglinearError> {
        self.insert_factor(neighbors, FactorTable::Static(table), Metadata::new())
    }

    /// Pairwise static factor.
    pub fn add_static_binary_factor(
        &mut self,
        a: usize,
        card_a: usize,
        b: usize,
        card_b: usize,
        value: impl Fn(usize, usize) -> f64,
    ) -> Result<FactorId, LoglinearError> {
        self.add_static_factor(&[a, b], &[card_a, card_b], |assignment| {
            value(assignment[0], assignment[1])
        })
    }

    /// Adds a static factor from unnormalized log values, shifted so that the
    /// factor alone sums to 1 in probability space.
    pub fn add_static_normalized_factor(
        &mut self,
        neighbors: &[usize],
        dimensions: &[usize],
        log_value: impl FnMut(&[usize]) -> f64,
    ) -> Result<FactorId, LoglinearError> {
        let mut table = NdArray::from_fn(dimensions, log_value)?;
        let log_partition = log_sum_exp(table.values());
        for value in table.values_mut() {
            *value -= log_partition;
        }
        self.add_static_factor_table(table, neighbors)
    }

    /// Adds a Bayes-net style factor `P(consequent | antecedents)`.
    ///
    /// `probability(antecedent_assignment, consequent_value)` may be
    /// unnormalized; it is normalized over the consequent for each antecedent
    /// assignment and stored as log values. The factor's neighbors are the
    /// antecedents followed by the consequent.
    pub fn add_static_conditional_factor(
        &mut self,
        antecedents: &[usize],
        consequent: usize,
        antecedent_dimensions: &[usize],
        consequent_dimension: usize,
        probability: impl Fn(&[usize], usize) -> f64,
    ) -> Result<FactorId, LoglinearError> {
        if antecedents.len() != antecedent_dimensions.len() {
            return Err(LoglinearError::ValidationError(format!(
                "{} antecedents but {} antecedent dimensions",
                antecedents.len(),
                antecedent_dimensions.len()
            )));
        }
        let mut neighbors = antecedents.to_vec();
        neighbors.push(consequent);
        let mut dimensions = antecedent_dimensions.to_vec();
        dimensions.push(consequent_dimension);

        // Consequent is the last axis, so this visits cells in row-major order.
        let mut values = Vec::new();
        for antecedent in Assignments::new(antecedent_dimensions) {
            let local: Vec<f64> = (0..consequent_dimension)
                .map(|c| probability(antecedent.as_slice(), c))
                .collect();
            let total: f64 = local.iter().sum();
            if !(total.is_finite() && total > 0.0) || local.iter().any(|&p| p < 0.0) {
                return Err(LoglinearError::ValidationError(format!(
                    "conditional probabilities for antecedent assignment {antecedent:?} \
                     sum to {total}; rows must be non-negative with a positive finite sum"
                )));
            }
            let log_partition = total.ln();
            values.extend(local.iter().map(|p| p.ln() - log_partition));
        }
        let table = NdArray::from_values(&dimensions, values)?;
        self.add_static_factor_table(table, &neighbors)
    }

    /// Tolerant, order-independent equality: metadata must match and factors
    /// must pair up one-to-one by [`Factor::value_equals`].
    pub fn value_equals(&self, other: &GraphicalModel, tolerance: f64) -> bool {
        if self.model_metadata != other.model_metadata {
            return false;
        }
        let longest = self.variable_metadata.len().max(other.variable_metadata.len());
        let empty = Metadata::new();
        for v in 0..longest {
            let mine = self.variable_metadata.get(v).unwrap_or(&empty);
            let theirs = other.variable_metadata.get(v).unwrap_or(&empty);
            if mine != theirs {
                return false;
            }
        }
        if self.factors.len() != other.factors.len() {
            return false;
        }
        let mut unmatched: Vec<&Factor> = self.factors.iter().collect();
        for theirs in &other.factors {
            match unmatched
                .iter()
                .position(|mine| mine.value_equals(theirs, tolerance))
            {
                Some(position) => {
                    unmatched.swap_remove(position);
                }
                None => return false,
            }
        }
        unmatched.is_empty()
    }

    /// Flattens into the persisted layout, evaluating every feature cell.
    pub fn to_record(&self) -> GraphicalModelRecord {
        GraphicalModelRecord {
            metadata: MetadataRecord::from_metadata(&self.model_metadata),
            variable_metadata: self
                .variable_metadata
                .iter()
                .map(MetadataRecord::from_metadata)
                .collect(),
            factors: self
                .factors
                .iter()
                .map(|factor| FactorRecord {
                    neighbors: factor.neighbors.to_vec(),
                    table: match &factor.table {
                        FactorTable::Vector(table) => FactorTableRecord::Vector(table.to_record()),
                        FactorTable::Static(table) => FactorTableRecord::Static(table.to_record()),
                    },
                    metadata: MetadataRecord::from_metadata(&factor.metadata),
                })
                .collect(),
        }
    }

    /// Rebuilds a model from its persisted layout. Factors get fresh ids.
    pub fn from_record(record: GraphicalModelRecord) -> Result<Self, LoglinearError> {
        let mut model = GraphicalModel::new();
        model.model_metadata = record.metadata.into_metadata()?;
        model.variable_metadata = record
            .variable_metadata
            .into_iter()
            .map(MetadataRecord::into_metadata)
            .collect::<Result<_, _>>()?;
        for factor in record.factors {
            let table = match factor.table {
                FactorTableRecord::Vector(table) => {
                    FactorTable::Vector(ConcatVectorTable::from_record(table)?)
                }
                FactorTableRecord::Static(table) => {
                    FactorTable::Static(NdArrayDoubles::from_record(table)?)
                }
            };
            let metadata = factor.metadata.into_metadata()?;
            model.insert_factor(&factor.neighbors, table, metadata)?;
        }
        Ok(model)
    }

    /// Writes one length-prefixed model record.
    #[cfg(feature = "serde")]
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<(), LoglinearError> {
        crate::storage::write_record(writer, &self.to_record())
    }

    /// Reads one length-prefixed model record.
    #[cfg(feature = "serde")]
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self, LoglinearError> {
        Self::from_record(crate::storage::read_record(reader)?)
    }
}

impl fmt::Display for GraphicalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        for factor in &self.factors {
            let kind = if factor.is_vector() { "vector" } else { "static" };
            writeln!(
                f,
                "\t{} {:?} {kind} {:?}",
                factor.id,
                factor.neighbors(),
                factor.dimensions()
            )?;
        }
        write!(f, "}}")
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Persisted metadata as parallel key/value arrays, keys sorted.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataRecord {
    pub keys: Vec<String>,
    pub values: Vec<String>,
}

impl MetadataRecord {
    fn from_metadata(metadata: &Metadata) -> Self {
        let mut entries: Vec<(&String, &String)> = metadata.iter().collect();
        entries.sort();
        let (keys, values) = entries
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .unzip();
        Self { keys, values }
    }

    fn into_metadata(self) -> Result<Metadata, LoglinearError> {
        if self.keys.len() != self.values.len() {
            return Err(LoglinearError::Serialization(format!(
                "metadata has {} keys but {} values",
                self.keys.len(),
                self.values.len()
            )));
        }
        Ok(self.keys.into_iter().zip(self.values).collect())
    }
}

/// Persisted factor table, tagged by kind.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum FactorTableRecord {
    Vector(ConcatVectorTableRecord),
    Static(NdArrayRecord),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct FactorRecord {
    pub neighbors: Vec<usize>,
    pub table: FactorTableRecord,
    pub metadata: MetadataRecord,
}

/// Persisted form of a [`GraphicalModel`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphicalModelRecord {
    pub metadata: MetadataRecord,
    pub variable_metadata: Vec<MetadataRecord>,
    pub factors: Vec<FactorRecord>,
}

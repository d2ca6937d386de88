//! Exact inference by message passing over a forest of cliques.
//!
//! Each factor of the model becomes one clique: its table under the weights,
//! exponentiated, with observed variables restricted away. Cliques that share
//! a variable are linked, a BFS spanning forest is laid over those links, and
//! one upward and one downward pass of sum- or max-product messages converge
//! every clique. The model is assumed tree- or forest-structured; on loopy
//! structure the results are approximate.
//!
//! A [`CliqueTree`] is built once per (model, weights) pair and then queried
//! repeatedly while the caller edits observations. Clique tables are cached
//! per factor and reused as long as the observations on that factor's
//! neighbors are unchanged.
//!
//! ## Impossible evidence
//!
//! If some clique has no positive-valued assignment after observation, or a
//! fully observed factor has an infinite log value, the evidence is
//! contradictory. This is not an error: every unobserved clique variable
//! gets a uniform marginal, the partition function is 1.0, and every joint
//! marginal is all zeros.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::LoglinearError;
use crate::inference::table_factor::TableFactor;
use crate::kernels::KernelBackend;
use crate::model::{ConcatVector, Factor, FactorId, FactorTable, GraphicalModel};

/// Default relative tolerance when checking that every clique of a tree
/// agrees on the tree's partition function.
pub const PARTITION_RELATIVE_TOLERANCE: f64 = 1.0e-3;

/// Configuration for clique-tree inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CliqueTreeConfig {
    /// Dense kernel used for feature/weight dot products.
    pub kernel_backend: KernelBackend,
    /// Check that all cliques of a tree converge to the same partition
    /// function. A mismatch is reported as [`LoglinearError::Numerical`].
    pub verify_partition_function: bool,
    /// Relative disagreement allowed by that check.
    pub partition_tolerance: f64,
}

impl Default for CliqueTreeConfig {
    fn default() -> Self {
        Self {
            kernel_backend: KernelBackend::Auto,
            verify_partition_function: cfg!(debug_assertions),
            partition_tolerance: PARTITION_RELATIVE_TOLERANCE,
        }
    }
}

impl CliqueTreeConfig {
    pub fn validate(self) -> Result<Self, LoglinearError> {
        if !(self.partition_tolerance.is_finite() && self.partition_tolerance > 0.0) {
            return Err(LoglinearError::ValidationError(format!(
                "partition_tolerance must be positive and finite, got {}",
                self.partition_tolerance
            )));
        }
        Ok(self)
    }
}

/// Counters from the most recent inference call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InferenceDiagnostics {
    /// Cliques that took part in message passing.
    pub cliques: usize,
    /// Connected components of the clique forest.
    pub trees: usize,
    /// Cliques served from the per-factor cache.
    pub cache_hits: usize,
    /// Cliques rebuilt from their factor.
    pub cache_misses: usize,
    /// Factors whose neighbors were all observed.
    pub fully_observed: usize,
    /// Whether contradictory evidence short-circuited the call.
    pub impossible: bool,
}

/// Output of a marginals query.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginalResult {
    /// Per-variable distribution, indexed by variable. `None` for variables
    /// no factor touches.
    pub marginals: Vec<Option<Vec<f64>>>,
    /// Sum over all joint assignments of the product of factor values.
    pub partition_function: f64,
    /// Normalized joint distribution over each factor's neighbors, in the
    /// factor's own variable order and dimensions.
    pub joint_marginals: FxHashMap<FactorId, TableFactor>,
}

impl MarginalResult {
    pub fn marginal(&self, variable: usize) -> Option<&[f64]> {
        self.marginals.get(variable).and_then(|m| m.as_deref())
    }

    pub fn joint_marginal(&self, factor: FactorId) -> Option<&TableFactor> {
        self.joint_marginals.get(&factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marginalization {
    Sum,
    Max,
}

#[derive(Debug)]
struct CachedClique {
    clique: Arc<TableFactor>,
    observations: Vec<Option<usize>>,
    impossible: bool,
}

/// BFS spanning forest over cliques.
#[derive(Debug)]
struct Forest {
    order: Vec<usize>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    links: Vec<Vec<usize>>,
    tree: Vec<usize>,
    tree_count: usize,
}

impl Forest {
    /// Each tree is rooted at the unvisited clique with the most variables
    /// (first on ties).
    fn build(cliques: &[Arc<TableFactor>]) -> Self {
        let n = cliques.len();
        let mut seen = vec![false; n];
        let mut forest = Forest {
            order: Vec::with_capacity(n),
            parent: vec![None; n],
            children: vec![Vec::new(); n],
            links: vec![Vec::new(); n],
            tree: vec![0; n],
            tree_count: 0,
        };

        while forest.order.len() < n {
            let mut root: Option<usize> = None;
            for i in (0..n).filter(|&i| !seen[i]) {
                match root {
                    Some(r) if cliques[i].neighbors().len() <= cliques[r].neighbors().len() => {}
                    _ => root = Some(i),
                }
            }
            let Some(root) = root else { break };

            seen[root] = true;
            let mut queue = VecDeque::from([root]);
            while let Some(cursor) = queue.pop_front() {
                forest.tree[cursor] = forest.tree_count;
                forest.order.push(cursor);
                for i in 0..n {
                    if seen[i] || !cliques[cursor].overlaps(&cliques[i]) {
                        continue;
                    }
                    seen[i] = true;
                    forest.parent[i] = Some(cursor);
                    forest.children[cursor].push(i);
                    forest.links[cursor].push(i);
                    forest.links[i].push(cursor);
                    queue.push_back(i);
                }
            }
            forest.tree_count += 1;
        }

        for links in &mut forest.links {
            links.sort_unstable();
        }
        forest
    }
}

/// Exact marginal and MAP inference for one model instance and one weight
/// vector.
///
/// Weights are copied at construction; build a new tree to change them. The
/// tree is bound to the model instance it was built for (clones of a model
/// are different instances), and queries take `&mut self` because they
/// update the clique cache.
#[derive(Debug)]
pub struct CliqueTree {
    model_instance: u64,
    weights: ConcatVector,
    config: CliqueTreeConfig,
    cache: FxHashMap<FactorId, CachedClique>,
    diagnostics: InferenceDiagnostics,
}

impl CliqueTree {
    pub fn new(model: &GraphicalModel, weights: &ConcatVector) -> Self {
        Self {
            model_instance: model.instance_id(),
            weights: weights.deep_clone(),
            config: CliqueTreeConfig::default(),
            cache: FxHashMap::default(),
            diagnostics: InferenceDiagnostics::default(),
        }
    }

    pub fn with_config(
        model: &GraphicalModel,
        weights: &ConcatVector,
        config: CliqueTreeConfig,
    ) -> Result<Self, LoglinearError> {
        let config = config.validate()?;
        Ok(Self {
            config,
            ..Self::new(model, weights)
        })
    }

    pub fn weights(&self) -> &ConcatVector {
        &self.weights
    }

    pub fn config(&self) -> CliqueTreeConfig {
        self.config
    }

    /// Counters from the most recent query.
    pub fn diagnostics(&self) -> InferenceDiagnostics {
        self.diagnostics
    }

    /// Drops every cached clique.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Singleton marginals, joint marginals per factor, and the partition
    /// function.
    pub fn calculate_marginals(
        &mut self,
        model: &GraphicalModel,
    ) -> Result<MarginalResult, LoglinearError> {
        self.message_passing(model, Marginalization::Sum, true)
    }

    /// Singleton marginals only. Skips joint marginals and the partition
    /// function, and converges only as many cliques as needed to cover every
    /// variable.
    pub fn calculate_marginals_just_singletons(
        &mut self,
        model: &GraphicalModel,
    ) -> Result<Vec<Option<Vec<f64>>>, LoglinearError> {
        Ok(self
            .message_passing(model, Marginalization::Sum, false)?
            .marginals)
    }

    /// Most likely joint assignment, indexed by variable. Observed variables
    /// report their observed value; variables no factor touches are `None`.
    pub fn calculate_map(
        &mut self,
        model: &GraphicalModel,
    ) -> Result<Vec<Option<usize>>, LoglinearError> {
        let max_marginals = self
            .message_passing(model, Marginalization::Max, false)?
            .marginals;
        let observed = observed_values(model, max_marginals.len())?;
        Ok(max_marginals
            .iter()
            .zip(observed)
            .map(|(marginal, observed)| observed.or_else(|| marginal.as_deref().map(argmax)))
            .collect())
    }

    fn check_model(&self, model: &GraphicalModel) -> Result<(), LoglinearError> {
        if model.instance_id() != self.model_instance {
            return Err(LoglinearError::ValidationError(
                "clique tree queried with a different model instance than it was built for".into(),
            ));
        }
        Ok(())
    }

    fn message_passing(
        &mut self,
        model: &GraphicalModel,
        method: Marginalization,
        include_joint: bool,
    ) -> Result<MarginalResult, LoglinearError> {
        self.check_model(model)?;
        let backend = self.config.kernel_backend;
        let num_variables = model.num_variables();
        let observed = observed_values(model, num_variables)?;
        validate_observations(model, &observed)?;

        let mut diagnostics = InferenceDiagnostics::default();
        let mut impossible = false;
        let mut partition_function = 1.0;

        // Fully observed factors take no part in message passing but still
        // scale the partition function.
        for factor in model.factors() {
            let Some(assignment) = observed_assignment(factor, &observed) else {
                continue;
            };
            diagnostics.fully_observed += 1;
            if include_joint {
                let log_value = factor.table().log_value(&assignment, &self.weights, backend)?;
                if log_value.is_infinite() {
                    impossible = true;
                } else {
                    partition_function *= log_value.exp();
                }
            }
        }

        let live: FxHashSet<FactorId> = model.factors().iter().map(Factor::id).collect();
        self.cache.retain(|id, _| live.contains(id));

        let mut cliques: Vec<Arc<TableFactor>> = Vec::new();
        let mut clique_factor: Vec<usize> = Vec::new();
        for (index, factor) in model.factors().iter().enumerate() {
            let snapshot: Vec<Option<usize>> =
                factor.neighbors().iter().map(|&n| observed[n]).collect();
            if snapshot.iter().all(Option::is_some) {
                continue;
            }
            let fresh = self
                .cache
                .get(&factor.id())
                .map_or(false, |cached| cached.observations == snapshot);
            if fresh {
                diagnostics.cache_hits += 1;
            } else {
                diagnostics.cache_misses += 1;
                let built = build_clique(factor, snapshot, &self.weights, backend)?;
                self.cache.insert(factor.id(), built);
            }
            let cached = self.cache.get(&factor.id()).ok_or_else(|| {
                LoglinearError::Internal(format!("clique for {} missing from cache", factor.id()))
            })?;
            impossible |= cached.impossible;
            cliques.push(cached.clique.clone());
            clique_factor.push(index);
        }
        diagnostics.cliques = cliques.len();

        if impossible {
            diagnostics.impossible = true;
            self.finish(diagnostics);
            return impossible_result(model, &cliques, &observed, include_joint);
        }

        let forest = Forest::build(&cliques);
        diagnostics.trees = forest.tree_count;

        let mut messages: FxHashMap<(usize, usize), TableFactor> = FxHashMap::default();
        for &cursor in forest.order.iter().rev() {
            let Some(parent) = forest.parent[cursor] else {
                continue;
            };
            let message = incoming_product(&cliques, &forest, &messages, cursor, Some(parent))?;
            let message = marginalize_message(message, cliques[parent].neighbors(), method)?;
            messages.insert((cursor, parent), message);
        }
        for &cursor in &forest.order {
            for &child in &forest.children[cursor] {
                let message = incoming_product(&cliques, &forest, &messages, cursor, Some(child))?;
                let message = marginalize_message(message, cliques[child].neighbors(), method)?;
                messages.insert((cursor, child), message);
            }
        }

        let mut marginals = observed_marginals(model, &observed);
        let mut joint_marginals = FxHashMap::default();

        if method == Marginalization::Sum && include_joint {
            let mut tree_partitions: Vec<Option<f64>> = vec![None; forest.tree_count];
            for i in 0..cliques.len() {
                let converged = incoming_product(&cliques, &forest, &messages, i, None)?;
                let sum = converged.value_sum();
                match tree_partitions[forest.tree[i]] {
                    None => {
                        tree_partitions[forest.tree[i]] = Some(sum);
                        partition_function *= sum;
                    }
                    Some(expected) if self.config.verify_partition_function => {
                        verify_partition(expected, sum, i, self.config.partition_tolerance)?;
                    }
                    Some(_) => {}
                }

                let factor = &model.factors()[clique_factor[i]];
                joint_marginals.insert(
                    factor.id(),
                    back_fill_joint(factor, &observed, &converged, sum)?,
                );
                fill_marginals(&mut marginals, &converged, method);
            }
        } else {
            // Cliques whose variables are all still missing first, so a chain
            // converges about half of its cliques.
            for i in 0..cliques.len() {
                if cliques[i].neighbors().iter().all(|&n| marginals[n].is_none()) {
                    let converged = incoming_product(&cliques, &forest, &messages, i, None)?;
                    fill_marginals(&mut marginals, &converged, method);
                }
            }
            for i in 0..cliques.len() {
                if cliques[i].neighbors().iter().any(|&n| marginals[n].is_none()) {
                    let converged = incoming_product(&cliques, &forest, &messages, i, None)?;
                    fill_marginals(&mut marginals, &converged, method);
                }
            }
        }

        if method == Marginalization::Sum && include_joint {
            for factor in model.factors() {
                if let Some(assignment) = observed_assignment(factor, &observed) {
                    let mut joint = TableFactor::zeros(factor.neighbors(), factor.dimensions())?;
                    joint.set(&assignment, 1.0)?;
                    joint_marginals.insert(factor.id(), joint);
                }
            }
        }

        self.finish(diagnostics);
        Ok(MarginalResult {
            marginals,
            partition_function,
            joint_marginals,
        })
    }

    fn finish(&mut self, diagnostics: InferenceDiagnostics) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            cliques = diagnostics.cliques,
            trees = diagnostics.trees,
            cache_hits = diagnostics.cache_hits,
            cache_misses = diagnostics.cache_misses,
            fully_observed = diagnostics.fully_observed,
            impossible = diagnostics.impossible,
            "clique tree message passing finished"
        );
        self.diagnostics = diagnostics;
    }
}

/// Observed value of every variable below `num_variables`.
fn observed_values(
    model: &GraphicalModel,
    num_variables: usize,
) -> Result<Vec<Option<usize>>, LoglinearError> {
    (0..num_variables)
        .map(|variable| model.observed_value(variable))
        .collect()
}

fn validate_observations(
    model: &GraphicalModel,
    observed: &[Option<usize>],
) -> Result<(), LoglinearError> {
    for factor in model.factors() {
        for (&variable, &size) in factor.neighbors().iter().zip(factor.dimensions()) {
            if let Some(value) = observed[variable] {
                if value >= size {
                    return Err(LoglinearError::ValidationError(format!(
                        "variable {variable}: observed value {value} is out of range for cardinality {size}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// The factor's assignment if every neighbor is observed.
fn observed_assignment(factor: &Factor, observed: &[Option<usize>]) -> Option<Vec<usize>> {
    factor.neighbors().iter().map(|&n| observed[n]).collect()
}

fn build_clique(
    factor: &Factor,
    observations: Vec<Option<usize>>,
    weights: &ConcatVector,
    backend: KernelBackend,
) -> Result<CachedClique, LoglinearError> {
    let mut neighbors = factor.neighbors().to_vec();
    let mut restricted: Option<FactorTable> = None;
    // Last axis first, so earlier axis indices stay valid.
    for axis in (0..observations.len()).rev() {
        if let Some(value) = observations[axis] {
            let next = restricted.as_ref().unwrap_or(factor.table()).observe(axis, value)?;
            restricted = Some(next);
            neighbors.remove(axis);
        }
    }
    let table = restricted.as_ref().unwrap_or(factor.table());
    let clique = TableFactor::from_log_table(&neighbors, table, weights, backend)?;
    let impossible = !clique.values().values().iter().any(|&v| v > 0.0);
    Ok(CachedClique {
        clique: Arc::new(clique),
        observations,
        impossible,
    })
}

fn impossible_result(
    model: &GraphicalModel,
    cliques: &[Arc<TableFactor>],
    observed: &[Option<usize>],
    include_joint: bool,
) -> Result<MarginalResult, LoglinearError> {
    let mut marginals = observed_marginals(model, observed);
    for clique in cliques {
        for (&variable, &size) in clique.neighbors().iter().zip(clique.dimensions()) {
            marginals[variable] = Some(vec![1.0 / size as f64; size]);
        }
    }
    let mut joint_marginals = FxHashMap::default();
    if include_joint {
        for factor in model.factors() {
            joint_marginals.insert(
                factor.id(),
                TableFactor::zeros(factor.neighbors(), factor.dimensions())?,
            );
        }
    }
    Ok(MarginalResult {
        marginals,
        partition_function: 1.0,
        joint_marginals,
    })
}

/// One-hot marginals for observed variables that some factor touches.
fn observed_marginals(model: &GraphicalModel, observed: &[Option<usize>]) -> Vec<Option<Vec<f64>>> {
    let mut marginals = vec![None; observed.len()];
    for factor in model.factors() {
        for (&variable, &size) in factor.neighbors().iter().zip(factor.dimensions()) {
            if let Some(value) = observed[variable] {
                let mut deterministic = vec![0.0; size];
                deterministic[value] = 1.0;
                marginals[variable] = Some(deterministic);
            }
        }
    }
    marginals
}

/// Clique `target` times every message it has received, except the one from
/// `exclude`.
fn incoming_product(
    cliques: &[Arc<TableFactor>],
    forest: &Forest,
    messages: &FxHashMap<(usize, usize), TableFactor>,
    target: usize,
    exclude: Option<usize>,
) -> Result<TableFactor, LoglinearError> {
    let mut product = cliques[target].as_ref().clone();
    for &source in &forest.links[target] {
        if Some(source) == exclude {
            continue;
        }
        if let Some(message) = messages.get(&(source, target)) {
            product = product.multiply(message)?;
        }
    }
    Ok(product)
}

/// Eliminates every variable the recipient does not have.
fn marginalize_message(
    message: TableFactor,
    relevant: &[usize],
    method: Marginalization,
) -> Result<TableFactor, LoglinearError> {
    let mut result = message;
    let irrelevant: Vec<usize> = result
        .neighbors()
        .iter()
        .copied()
        .filter(|n| !relevant.contains(n))
        .collect();
    for variable in irrelevant {
        result = match method {
            Marginalization::Sum => result.sum_out(variable)?,
            Marginalization::Max => result.max_out(variable)?,
        };
    }
    Ok(result)
}

/// Fills marginals still missing for the clique's variables. Already known
/// entries, including observed ones, are never overwritten.
fn fill_marginals(
    marginals: &mut [Option<Vec<f64>>],
    converged: &TableFactor,
    method: Marginalization,
) {
    if converged.neighbors().iter().all(|&n| marginals[n].is_some()) {
        return;
    }
    let clique_marginals = match method {
        Marginalization::Sum => converged.summed_marginals(),
        Marginalization::Max => converged.maxed_marginals(),
    };
    for (&variable, marginal) in converged.neighbors().iter().zip(clique_marginals) {
        if marginals[variable].is_none() {
            marginals[variable] = Some(marginal);
        }
    }
}

/// Normalized converged clique, placed back into the factor's full
/// dimensionality with observed axes pinned to their values.
fn back_fill_joint(
    factor: &Factor,
    observed: &[Option<usize>],
    converged: &TableFactor,
    sum: f64,
) -> Result<TableFactor, LoglinearError> {
    let mut joint = TableFactor::zeros(factor.neighbors(), factor.dimensions())?;
    let mut full = vec![0; factor.neighbors().len()];
    let mut free_axes = Vec::with_capacity(converged.neighbors().len());
    for (axis, &variable) in factor.neighbors().iter().enumerate() {
        match observed[variable] {
            Some(value) => full[axis] = value,
            None => free_axes.push(axis),
        }
    }
    let mut cursor = converged.cursor();
    while cursor.advance() {
        let assignment = cursor.current();
        for (&axis, &state) in free_axes.iter().zip(assignment) {
            full[axis] = state;
        }
        joint.set(&full, converged.get(assignment)? / sum)?;
    }
    Ok(joint)
}

fn verify_partition(
    expected: f64,
    actual: f64,
    clique: usize,
    tolerance: f64,
) -> Result<(), LoglinearError> {
    if !expected.is_finite() || !actual.is_finite() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            clique,
            expected,
            actual,
            "non-finite partition function; skipping consistency check"
        );
        return Ok(());
    }
    if (expected - actual).abs() > tolerance * expected.abs() {
        #[cfg(feature = "tracing")]
        tracing::warn!(clique, expected, actual, "partition functions disagree within tree");
        return Err(LoglinearError::Numerical(format!(
            "clique {clique} converged to partition function {actual}, tree has {expected}"
        )));
    }
    Ok(())
}

/// First index of the largest value.
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

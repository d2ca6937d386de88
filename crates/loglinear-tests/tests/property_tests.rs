//! Property tests for feature vector algebra, persistence and exact inference.

use std::collections::BTreeMap;
use std::io::Cursor;

use loglinear_core::inference::CliqueTree;
use loglinear_core::model::{
    Assignments, ConcatVector, GraphicalModel, GraphicalModelRecord, Metadata, NdArrayDoubles,
};
use loglinear_core::storage;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Block {
    Dense(Vec<f64>),
    Sparse(BTreeMap<usize, f64>),
}

fn block() -> impl Strategy<Value = Option<Block>> {
    prop_oneof![
        1 => Just(None),
        2 => prop::collection::vec(-10.0f64..10.0, 0..8).prop_map(|v| Some(Block::Dense(v))),
        2 => prop::collection::btree_map(0usize..12, -10.0f64..10.0, 0..5)
            .prop_map(|m| Some(Block::Sparse(m))),
    ]
}

fn blocks() -> impl Strategy<Value = Vec<Option<Block>>> {
    prop::collection::vec(block(), 0..5)
}

fn build(blocks: &[Option<Block>]) -> ConcatVector {
    let mut v = ConcatVector::new(blocks.len());
    for (component, block) in blocks.iter().enumerate() {
        match block {
            None => {}
            Some(Block::Dense(values)) => v.set_dense(component, values.clone()),
            Some(Block::Sparse(entries)) => {
                let indices: Vec<usize> = entries.keys().copied().collect();
                let values: Vec<f64> = entries.values().copied().collect();
                v.set_sparse_multi(component, &indices, &values).unwrap();
            }
        }
    }
    v
}

/// Same values with every sparse block stored densely.
fn build_dense(blocks: &[Option<Block>]) -> ConcatVector {
    let mut v = ConcatVector::new(blocks.len());
    for (component, block) in blocks.iter().enumerate() {
        match block {
            None => {}
            Some(Block::Dense(values)) => v.set_dense(component, values.clone()),
            Some(Block::Sparse(entries)) => {
                let len = entries.keys().max().map_or(0, |m| m + 1);
                let mut values = vec![0.0; len];
                for (&i, &x) in entries {
                    values[i] = x;
                }
                v.set_dense(component, values);
            }
        }
    }
    v
}

/// Reference dot product over the zero-padded block layout.
fn reference_dot(a: &[Option<Block>], b: &[Option<Block>]) -> (f64, f64) {
    let value = |block: &Option<Block>, i: usize| match block {
        None => 0.0,
        Some(Block::Dense(values)) => values.get(i).copied().unwrap_or(0.0),
        Some(Block::Sparse(entries)) => entries.get(&i).copied().unwrap_or(0.0),
    };
    let mut sum = 0.0;
    let mut scale = 0.0;
    for (x, y) in a.iter().zip(b) {
        for i in 0..12 {
            let p = value(x, i) * value(y, i);
            sum += p;
            scale += p.abs();
        }
    }
    (sum, scale)
}

fn close(a: f64, b: f64, scale: f64) -> bool {
    (a - b).abs() <= 1e-9 * (1.0 + scale)
}

proptest! {
    #[test]
    fn dot_matches_reference_for_every_layout(a in blocks(), b in blocks()) {
        let (expected, scale) = reference_dot(&a, &b);
        let (sparse_a, sparse_b) = (build(&a), build(&b));
        let (dense_a, dense_b) = (build_dense(&a), build_dense(&b));
        prop_assert!(close(sparse_a.dot(&sparse_b), expected, scale));
        prop_assert!(close(sparse_a.dot(&dense_b), expected, scale));
        prop_assert!(close(dense_a.dot(&sparse_b), expected, scale));
        prop_assert!(close(dense_a.dot(&dense_b), expected, scale));
    }

    #[test]
    fn dot_is_commutative(a in blocks(), b in blocks()) {
        let (_, scale) = reference_dot(&a, &b);
        let (a, b) = (build(&a), build(&b));
        prop_assert!(close(a.dot(&b), b.dot(&a), scale));
    }

    #[test]
    fn add_scaled_is_linear_in_dot(
        a in blocks(),
        b in blocks(),
        c in blocks(),
        scale in -3.0f64..3.0,
    ) {
        let (_, s1) = reference_dot(&a, &c);
        let (_, s2) = reference_dot(&b, &c);
        let (a, b, c) = (build(&a), build(&b), build(&c));
        let a_dot_c = a.dot(&c);
        let expected = a_dot_c + scale * b.dot(&c);
        let mut sum = a.deep_clone();
        sum.add_scaled_in_place(&b, scale);
        prop_assert!(close(sum.dot(&c), expected, s1 + 3.0 * s2));
        // Writing through the clone leaves the shared source alone.
        prop_assert_eq!(a.dot(&c), a_dot_c);
    }

    #[test]
    fn representation_does_not_affect_equality(a in blocks()) {
        prop_assert!(build(&a).value_equals(&build_dense(&a), 0.0));
    }

    #[test]
    fn clone_is_equal_and_independent(a in blocks(), bump in 0.5f64..5.0) {
        let original = build(&a);
        let mut copy = original.deep_clone();
        prop_assert!(copy.value_equals(&original, 0.0));
        let before = original.dot(&original);
        copy.map_in_place(|x| x + bump);
        copy.set_value(0, 0, 99.0);
        prop_assert_eq!(original.dot(&original), before);
        prop_assert!(!copy.value_equals(&original, 0.0));
    }

    #[test]
    fn concat_vector_persists(a in blocks()) {
        let v = build(&a);
        let mut buffer = Vec::new();
        v.write_to(&mut buffer).unwrap();
        let restored = ConcatVector::read_from(&mut Cursor::new(buffer)).unwrap();
        prop_assert!(restored.value_equals(&v, 0.0));
        for component in 0..a.len() {
            prop_assert_eq!(restored.is_set(component), v.is_set(component));
            prop_assert_eq!(restored.is_sparse(component), v.is_sparse(component));
        }
    }

    #[test]
    fn nd_array_persists(
        dims in prop::collection::vec(1usize..4, 0..4),
        seed in -5.0f64..5.0,
    ) {
        let table = NdArrayDoubles::from_fn(&dims, |a| {
            a.iter().enumerate().map(|(i, x)| (i + 1) as f64 * *x as f64).sum::<f64>() + seed
        })
        .unwrap();
        let mut buffer = Vec::new();
        table.write_to(&mut buffer).unwrap();
        let restored = NdArrayDoubles::read_from(&mut Cursor::new(buffer)).unwrap();
        prop_assert!(restored.value_equals(&table, 0.0));
        prop_assert_eq!(restored.dimensions(), table.dimensions());
    }
}

#[derive(Debug, Clone, Copy)]
enum FeatureLayout {
    Sparse,
    Dense,
    Mixed,
}

#[derive(Debug, Clone)]
struct FactorPlan {
    neighbors: Vec<usize>,
    /// `None` for a static factor.
    layout: Option<FeatureLayout>,
    metadata: Metadata,
}

fn metadata() -> impl Strategy<Value = Metadata> {
    prop::collection::hash_map("[a-z]{1,3}", "[a-z0-9 ]{0,4}", 0..3)
}

fn factor_plan() -> impl Strategy<Value = FactorPlan> {
    (
        prop::sample::subsequence(vec![0usize, 1, 2, 3], 1..=3).prop_shuffle(),
        prop_oneof![
            Just(None),
            Just(Some(FeatureLayout::Sparse)),
            Just(Some(FeatureLayout::Dense)),
            Just(Some(FeatureLayout::Mixed)),
        ],
        metadata(),
    )
        .prop_map(|(neighbors, layout, metadata)| FactorPlan {
            neighbors,
            layout,
            metadata,
        })
}

/// Deterministic table index for a cell of factor `salt`.
fn cell(assignment: &[usize], salt: usize) -> usize {
    assignment.iter().fold(salt * 5, |acc, &x| acc * 3 + x) % 32
}

fn cell_features(layout: FeatureLayout, values: &[f64], k: usize) -> ConcatVector {
    let at = |i: usize| values[(k + i) % values.len()];
    let mut v = ConcatVector::new(2);
    match layout {
        FeatureLayout::Sparse => {
            v.set_sparse(0, k % 5, at(0));
            v.set_sparse(1, 2, at(1));
        }
        FeatureLayout::Dense => {
            v.set_dense(0, vec![at(0), at(1)]);
            v.set_dense(1, vec![at(2)]);
        }
        FeatureLayout::Mixed => {
            v.set_dense(0, vec![at(0), at(1), at(2)]);
            v.set_sparse(1, k % 3, at(3));
        }
    }
    v
}

fn build_model(
    sizes: &[usize],
    factors: &[FactorPlan],
    model_metadata: &Metadata,
    variable_metadata: &[Metadata],
    values: &[f64],
) -> GraphicalModel {
    let mut model = GraphicalModel::new();
    model.model_metadata_mut().extend(model_metadata.clone());
    for (v, entries) in variable_metadata.iter().enumerate() {
        model.variable_metadata_mut(v).extend(entries.clone());
    }
    for (f, plan) in factors.iter().enumerate() {
        let dimensions: Vec<usize> = plan.neighbors.iter().map(|&n| sizes[n]).collect();
        let values = values.to_vec();
        let id = match plan.layout {
            None => model.add_static_factor(&plan.neighbors, &dimensions, move |a| {
                values[cell(a, f)]
            }),
            Some(layout) => model.add_factor(&plan.neighbors, &dimensions, move |a: &[usize]| {
                cell_features(layout, &values, cell(a, f))
            }),
        }
        .unwrap();
        model
            .factor_metadata_mut(id)
            .unwrap()
            .extend(plan.metadata.clone());
    }
    model
}

fn indicator(index: usize) -> ConcatVector {
    let mut v = ConcatVector::new(1);
    v.set_sparse(0, index, 1.0);
    v
}

fn log_score(model: &GraphicalModel, weights: &ConcatVector, assignment: &[usize]) -> f64 {
    model
        .factors()
        .iter()
        .map(|f| {
            let local: Vec<usize> = f.neighbors().iter().map(|&n| assignment[n]).collect();
            f.log_value(&local, weights).unwrap()
        })
        .sum()
}

proptest! {
    #[test]
    fn model_records_and_clones_keep_value(
        sizes in prop::collection::vec(1usize..4, 4),
        factors in prop::collection::vec(factor_plan(), 0..5),
        model_metadata in metadata(),
        variable_metadata in prop::collection::vec(metadata(), 0..6),
        values in prop::collection::vec(-3.0f64..3.0, 32),
    ) {
        let model = build_model(&sizes, &factors, &model_metadata, &variable_metadata, &values);

        let restored = GraphicalModel::from_record(model.to_record()).unwrap();
        prop_assert_eq!(restored.factor_count(), model.factor_count());
        prop_assert!(restored.value_equals(&model, 0.0));

        let copy = model.clone_model();
        prop_assert!(copy.value_equals(&model, 0.0));

        let mut buffer = Vec::new();
        model.write_to(&mut buffer).unwrap();
        storage::write_record(&mut buffer, &copy.to_record()).unwrap();
        let records: Vec<GraphicalModelRecord> =
            storage::read_all_records(&mut Cursor::new(buffer)).unwrap();
        prop_assert_eq!(records.len(), 2);
        for record in records {
            prop_assert!(GraphicalModel::from_record(record).unwrap().value_equals(&model, 0.0));
        }

        let mut edited = model.clone_model();
        edited.model_metadata_mut().insert("edited".into(), "yes".into());
        prop_assert!(!edited.value_equals(&model, 0.0));
        prop_assert!(model.model_metadata().get("edited").is_none());
    }

    #[test]
    fn forest_inference_matches_enumeration(
        sizes in prop::collection::vec(1usize..4, 1..=4),
        parents in prop::collection::vec(prop::option::of(0usize..4), 3),
        unary in prop::collection::vec(any::<bool>(), 4),
        observed in prop::collection::vec(prop::option::of(0usize..4), 4),
        weight_values in prop::collection::vec(-1.5f64..1.5, 64),
        log_values in prop::collection::vec(-2.0f64..2.0, 64),
    ) {
        let n = sizes.len();
        let mut model = GraphicalModel::new();
        // Each variable after the first either hangs off an earlier one or
        // starts a new tree.
        for v in 1..n {
            if let Some(p) = parents[v - 1] {
                let p = p % v;
                let width = sizes[v];
                model
                    .add_binary_factor(p, sizes[p], v, sizes[v], move |a, b| {
                        indicator(v * 16 + a * width + b)
                    })
                    .unwrap();
            }
        }
        for v in (0..n).filter(|&v| unary[v]) {
            let table = log_values.clone();
            model
                .add_static_factor(&[v], &[sizes[v]], move |a| table[v * 4 + a[0]])
                .unwrap();
        }
        prop_assume!(model.factor_count() > 0);
        for v in 0..n {
            if let Some(raw) = observed[v] {
                model.observe(v, raw % sizes[v]);
            }
        }
        let mut weights = ConcatVector::new(1);
        weights.set_dense(0, weight_values.clone());

        // Variables no factor touches take no part in either computation.
        let touched = model.variable_sizes();
        let dimensions: Vec<usize> = touched.iter().map(|s| s.unwrap_or(1)).collect();
        let consistent = |assignment: &[usize]| {
            (0..dimensions.len()).all(|v| {
                touched[v].is_none()
                    || model.observed_value(v).unwrap().map_or(true, |o| o == assignment[v])
            })
        };

        let mut partition = 0.0;
        let mut best = f64::NEG_INFINITY;
        let mut marginals: Vec<Vec<f64>> = dimensions.iter().map(|&d| vec![0.0; d]).collect();
        for assignment in Assignments::new(&dimensions) {
            if !consistent(&assignment) {
                continue;
            }
            let score = log_score(&model, &weights, &assignment);
            best = best.max(score);
            partition += score.exp();
            for (v, &a) in assignment.iter().enumerate() {
                marginals[v][a] += score.exp();
            }
        }

        let mut tree = CliqueTree::new(&model, &weights);
        let result = tree.calculate_marginals(&model).unwrap();
        prop_assert!((result.partition_function - partition).abs() <= 1e-9 * partition);
        for (v, expected) in marginals.iter().enumerate() {
            if touched[v].is_none() {
                prop_assert!(result.marginal(v).is_none());
                continue;
            }
            let actual = result.marginal(v).unwrap();
            prop_assert!((actual.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            for (x, y) in actual.iter().zip(expected) {
                prop_assert!((x - y / partition).abs() < 1e-9);
            }
        }

        let map = tree.calculate_map(&model).unwrap();
        let decoded: Vec<usize> = (0..dimensions.len())
            .map(|v| if touched[v].is_some() { map[v].unwrap() } else { 0 })
            .collect();
        prop_assert!(consistent(&decoded));
        let score = log_score(&model, &weights, &decoded);
        prop_assert!((score - best).abs() <= 1e-9 * (1.0 + best.abs()));
    }
}

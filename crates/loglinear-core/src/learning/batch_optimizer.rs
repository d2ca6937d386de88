//! Full-batch gradient training.
//!
//! Each iteration evaluates the objective and its gradient over the whole
//! dataset, adds L2 regularization, zeroes the derivative on constrained
//! weights, and hands the result to an [`UpdateRule`].
//!
//! ## Work balancing
//!
//! The dataset is split into one shard per worker thread, greedily by
//! [`DifferentiableFunction::estimate_relative_runtime`]. Shards run in
//! parallel on a dedicated rayon pool (`parallel` feature; sequentially
//! otherwise). After every round the slowest shard hands
//! `floor(len * waiting_fraction * 0.5)` items from its tail to the fastest
//! one, where `waiting_fraction = (slowest - fastest) / slowest`.
//!
//! ## Cancellation
//!
//! A shared `AtomicBool` is polled before every iteration and after every
//! instance. A cancelled run still returns the weights reached so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::errors::LoglinearError;
use crate::learning::differentiable::DifferentiableFunction;
use crate::learning::update_rules::UpdateRule;
use crate::model::ConcatVector;

/// Configuration for [`BatchOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOptimizerConfig {
    /// Standard deviation of the Gaussian prior on the weights. The L2
    /// coefficient is `1 / (2 * sigma^2)`.
    pub l2_sigma: f64,
    /// Training stops once the squared norm of the regularized derivative
    /// falls below this.
    pub convergence_derivative_norm: f64,
    /// Worker threads; 0 means one per available core.
    pub num_threads: usize,
    /// Upper bound on weight updates.
    pub max_iterations: Option<usize>,
    /// Log per-iteration progress at debug instead of info.
    pub quiet: bool,
}

impl Default for BatchOptimizerConfig {
    fn default() -> Self {
        Self {
            l2_sigma: 1.0,
            convergence_derivative_norm: 1.0e-3,
            num_threads: 0,
            max_iterations: None,
            quiet: false,
        }
    }
}

impl BatchOptimizerConfig {
    pub fn validate(self) -> Result<Self, LoglinearError> {
        if self.l2_sigma == 0.0 || !self.l2_sigma.is_finite() {
            return Err(LoglinearError::ValidationError(
                "optimize: l2_sigma must be finite and non-zero (zero means infinite regularization)"
                    .into(),
            ));
        }
        if self.convergence_derivative_norm <= 0.0 || !self.convergence_derivative_norm.is_finite()
        {
            return Err(LoglinearError::ValidationError(
                "optimize: convergence_derivative_norm must be finite and > 0".into(),
            ));
        }
        Ok(self)
    }

    fn l2_coefficient(&self) -> f64 {
        1.0 / (2.0 * self.l2_sigma * self.l2_sigma)
    }

    fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

/// A weight held fixed during training.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightConstraint {
    /// One slot of a component pinned to `value`.
    Sparse {
        component: usize,
        index: usize,
        value: f64,
    },
    /// A whole component pinned to `values`.
    Dense { component: usize, values: Vec<f64> },
}

impl WeightConstraint {
    pub fn apply_to_weights(&self, weights: &mut ConcatVector) {
        match self {
            WeightConstraint::Sparse {
                component,
                index,
                value,
            } => weights.set_value(*component, *index, *value),
            WeightConstraint::Dense { component, values } => {
                weights.set_dense(*component, values.clone())
            }
        }
    }

    pub fn apply_to_derivative(&self, derivative: &mut ConcatVector) {
        match self {
            WeightConstraint::Sparse {
                component, index, ..
            } => {
                if derivative.is_set(*component) {
                    derivative.set_value(*component, *index, 0.0);
                }
            }
            WeightConstraint::Dense { component, .. } => derivative.clear_component(*component),
        }
    }
}

/// Why training stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Squared derivative norm fell below the configured threshold.
    DerivativeNorm,
    /// The update rule reported convergence.
    UpdateRuleConverged,
    /// The cancellation flag was raised.
    Cancelled,
    /// `max_iterations` weight updates were made.
    IterationLimit,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub weights: ConcatVector,
    /// Weight updates applied.
    pub iterations: usize,
    /// Regularized objective at the last evaluated weights.
    pub log_likelihood: f64,
    pub termination: Termination,
}

#[derive(Debug)]
struct ShardSummary {
    log_likelihood: f64,
    gradient: ConcatVector,
    elapsed: Duration,
    cancelled: bool,
}

fn evaluate_shard<T, F: DifferentiableFunction<T>>(
    items: &[usize],
    dataset: &[T],
    function: &F,
    weights: &ConcatVector,
    cancel: &AtomicBool,
) -> Result<ShardSummary, LoglinearError> {
    let start = Instant::now();
    let mut summary = ShardSummary {
        log_likelihood: 0.0,
        gradient: weights.new_empty_clone(),
        elapsed: Duration::ZERO,
        cancelled: false,
    };
    for &item in items {
        summary.log_likelihood +=
            function.summary_for_instance(&dataset[item], weights, &mut summary.gradient)?;
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }
    }
    summary.elapsed = start.elapsed();
    Ok(summary)
}

/// Greedy assignment of items to the shard with the lowest estimated cost
/// so far (first shard on ties).
fn assign_shards<T, F: DifferentiableFunction<T>>(
    dataset: &[T],
    function: &F,
    num_shards: usize,
) -> Vec<Vec<usize>> {
    let num_shards = num_shards.max(1);
    let mut shards = vec![Vec::new(); num_shards];
    let mut costs = vec![0usize; num_shards];
    for (item, datum) in dataset.iter().enumerate() {
        let mut cheapest = 0;
        for (shard, &cost) in costs.iter().enumerate() {
            if cost < costs[cheapest] {
                cheapest = shard;
            }
        }
        costs[cheapest] += function.estimate_relative_runtime(datum);
        shards[cheapest].push(item);
    }
    shards
}

/// Moves work from the slowest shard to the fastest. Returns the number of
/// items moved.
fn rebalance_shards(shards: &mut [Vec<usize>], elapsed: &[Duration]) -> usize {
    if shards.len() < 2 || elapsed.len() != shards.len() {
        return 0;
    }
    let mut fastest = 0;
    let mut slowest = 0;
    for (shard, time) in elapsed.iter().enumerate() {
        if *time < elapsed[fastest] {
            fastest = shard;
        }
        if *time > elapsed[slowest] {
            slowest = shard;
        }
    }
    let max = elapsed[slowest].as_secs_f64();
    if fastest == slowest || max == 0.0 {
        return 0;
    }
    let waiting = (max - elapsed[fastest].as_secs_f64()) / max;
    let count = (shards[slowest].len() as f64 * waiting * 0.5).floor() as usize;
    let split = shards[slowest].len() - count;
    let moved = shards[slowest].split_off(split);
    shards[fastest].extend(moved);
    count
}

/// Runs shards on a dedicated pool, or in order when there is one shard or
/// the `parallel` feature is off.
struct ShardRunner {
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl ShardRunner {
    fn new(threads: usize) -> Result<Self, LoglinearError> {
        #[cfg(feature = "parallel")]
        {
            let pool = if threads > 1 {
                Some(
                    rayon::ThreadPoolBuilder::new()
                        .num_threads(threads)
                        .thread_name(|i| format!("loglinear-gradient-{i}"))
                        .build()
                        .map_err(|e| {
                            LoglinearError::Training(format!("failed to start worker pool: {e}"))
                        })?,
                )
            } else {
                None
            };
            Ok(Self { pool })
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = threads;
            Ok(Self {})
        }
    }

    fn run<E>(&self, shards: &[Vec<usize>], evaluate: E) -> Result<Vec<ShardSummary>, LoglinearError>
    where
        E: Fn(&[usize]) -> Result<ShardSummary, LoglinearError> + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            if let Some(pool) = &self.pool {
                return pool.install(|| {
                    shards
                        .par_iter()
                        .map(|shard| evaluate(shard.as_slice()))
                        .collect()
                });
            }
        }
        shards.iter().map(|shard| evaluate(shard.as_slice())).collect()
    }
}

/// Full-batch optimizer driving an [`UpdateRule`].
#[derive(Debug, Clone)]
pub struct BatchOptimizer<R> {
    rule: R,
    config: BatchOptimizerConfig,
    constraints: Vec<WeightConstraint>,
}

impl<R: UpdateRule> BatchOptimizer<R> {
    pub fn new(rule: R, config: BatchOptimizerConfig) -> Result<Self, LoglinearError> {
        Ok(Self {
            rule,
            config: config.validate()?,
            constraints: Vec::new(),
        })
    }

    pub fn config(&self) -> BatchOptimizerConfig {
        self.config
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    /// Pins slot `index` of `component` to `value`.
    pub fn add_sparse_constraint(&mut self, component: usize, index: usize, value: f64) {
        self.constraints.push(WeightConstraint::Sparse {
            component,
            index,
            value,
        });
    }

    /// Pins all of `component` to `values`.
    pub fn add_dense_constraint(&mut self, component: usize, values: impl Into<Vec<f64>>) {
        self.constraints.push(WeightConstraint::Dense {
            component,
            values: values.into(),
        });
    }

    pub fn constraints(&self) -> &[WeightConstraint] {
        &self.constraints
    }

    /// Trains to completion on the calling thread.
    pub fn optimize<T, F>(
        &self,
        dataset: &[T],
        function: &F,
        initial_weights: &ConcatVector,
    ) -> Result<TrainingOutcome, LoglinearError>
    where
        T: Sync,
        F: DifferentiableFunction<T>,
    {
        self.optimize_cancellable(dataset, function, initial_weights, &AtomicBool::new(false))
    }

    /// Trains until convergence, the iteration limit, or `cancel` is raised.
    pub fn optimize_cancellable<T, F>(
        &self,
        dataset: &[T],
        function: &F,
        initial_weights: &ConcatVector,
        cancel: &AtomicBool,
    ) -> Result<TrainingOutcome, LoglinearError>
    where
        T: Sync,
        F: DifferentiableFunction<T>,
    {
        let threads = self.config.resolved_threads().min(dataset.len()).max(1);
        let runner = ShardRunner::new(threads)?;
        let mut shards = assign_shards(dataset, function, threads);
        let l2 = self.config.l2_coefficient();

        #[cfg(feature = "tracing")]
        tracing::info!(
            instances = dataset.len(),
            shards = shards.len(),
            quiet = self.config.quiet,
            "beginning training"
        );

        let mut weights = initial_weights.deep_clone();
        for constraint in &self.constraints {
            constraint.apply_to_weights(&mut weights);
        }
        let mut state = self.rule.fresh_state(&weights);
        let mut iterations = 0;
        let mut log_likelihood = f64::NEG_INFINITY;

        let termination = loop {
            if cancel.load(Ordering::Relaxed) {
                break Termination::Cancelled;
            }
            if self.config.max_iterations.is_some_and(|max| iterations >= max) {
                break Termination::IterationLimit;
            }

            let round_start = Instant::now();
            let summaries = runner.run(&shards, |items| {
                evaluate_shard(items, dataset, function, &weights, cancel)
            })?;
            if summaries.iter().any(|s| s.cancelled) {
                break Termination::Cancelled;
            }

            let mut derivative = weights.new_empty_clone();
            let mut round_log_likelihood = 0.0;
            for summary in &summaries {
                round_log_likelihood += summary.log_likelihood;
                derivative.add_scaled_in_place(&summary.gradient, 1.0);
            }
            let gradient_time = round_start.elapsed();
            let elapsed: Vec<Duration> = summaries.iter().map(|s| s.elapsed).collect();
            let moved = rebalance_shards(&mut shards, &elapsed);

            round_log_likelihood -= l2 * weights.dot(&weights);
            derivative.add_scaled_in_place(&weights, -2.0 * l2);
            for constraint in &self.constraints {
                constraint.apply_to_derivative(&mut derivative);
            }
            log_likelihood = round_log_likelihood;

            let derivative_norm = derivative.dot(&derivative);
            if derivative_norm < self.config.convergence_derivative_norm {
                log_iteration(
                    self.config.quiet,
                    iterations,
                    log_likelihood,
                    derivative_norm,
                    gradient_time,
                    moved,
                );
                break Termination::DerivativeNorm;
            }

            let converged = self.rule.update_weights(
                &mut weights,
                &derivative,
                log_likelihood,
                &mut state,
                self.config.quiet,
            );
            for constraint in &self.constraints {
                constraint.apply_to_weights(&mut weights);
            }
            iterations += 1;
            log_iteration(
                self.config.quiet,
                iterations,
                log_likelihood,
                derivative_norm,
                gradient_time,
                moved,
            );
            if converged {
                break Termination::UpdateRuleConverged;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(?termination, iterations, log_likelihood, "training finished");

        Ok(TrainingOutcome {
            weights,
            iterations,
            log_likelihood,
            termination,
        })
    }

    /// Trains on a background thread. The returned handle can cancel the run
    /// and wait for its outcome.
    pub fn spawn<T, F>(
        self,
        dataset: Vec<T>,
        function: F,
        initial_weights: ConcatVector,
    ) -> Result<TrainingHandle, LoglinearError>
    where
        R: 'static,
        T: Send + Sync + 'static,
        F: DifferentiableFunction<T> + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(Completion::default());
        let thread_cancel = Arc::clone(&cancel);
        let guard = CompletionGuard {
            completion: Arc::clone(&completion),
        };
        let thread = std::thread::Builder::new()
            .name("loglinear-trainer".into())
            .spawn(move || {
                let result =
                    self.optimize_cancellable(&dataset, &function, &initial_weights, &thread_cancel);
                guard.completion.finish(result);
            })?;
        Ok(TrainingHandle {
            cancel,
            completion,
            thread: Some(thread),
        })
    }
}

#[allow(unused_variables)]
fn log_iteration(
    quiet: bool,
    iteration: usize,
    log_likelihood: f64,
    derivative_norm: f64,
    gradient_time: Duration,
    moved: usize,
) {
    #[cfg(feature = "tracing")]
    {
        let gradient_ms = gradient_time.as_millis() as u64;
        if quiet {
            tracing::debug!(iteration, log_likelihood, derivative_norm, gradient_ms, moved, "training iteration");
        } else {
            tracing::info!(iteration, log_likelihood, derivative_norm, gradient_ms, moved, "training iteration");
        }
    }
}

#[derive(Default)]
struct Completion {
    result: Mutex<Option<Result<TrainingOutcome, LoglinearError>>>,
    finished: Condvar,
}

impl Completion {
    fn finish(&self, result: Result<TrainingOutcome, LoglinearError>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.finished.notify_all();
    }
}

/// Releases waiters even if the training thread unwinds.
struct CompletionGuard {
    completion: Arc<Completion>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.completion.finish(Err(LoglinearError::Training(
            "training thread exited without a result".into(),
        )));
    }
}

/// Handle to training running on a background thread.
pub struct TrainingHandle {
    cancel: Arc<AtomicBool>,
    completion: Arc<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl TrainingHandle {
    /// Asks the run to stop after the instance it is on.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Shared cancellation flag, for wiring into other shutdown paths.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_finished(&self) -> bool {
        self.completion.result.lock().is_some()
    }

    /// Waits up to `timeout` for the run to finish. Returns whether it has.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.completion.result.lock();
        while slot.is_none() {
            if self
                .completion
                .finished
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.is_some();
            }
        }
        true
    }

    /// Blocks until the run finishes and returns its outcome.
    pub fn wait(mut self) -> Result<TrainingOutcome, LoglinearError> {
        let result = {
            let mut slot = self.completion.result.lock();
            while slot.is_none() {
                self.completion.finished.wait(&mut slot);
            }
            slot.take()
        };
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| LoglinearError::Training("training thread panicked".into()))?;
        }
        result.unwrap_or_else(|| {
            Err(LoglinearError::Internal(
                "training result already taken".into(),
            ))
        })
    }
}

impl std::fmt::Debug for TrainingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingHandle")
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::update_rules::{BacktrackingAdaGrad, GradientAscent};

    /// Concave quadratic: each datum `t` contributes `-(w0 - t)^2`.
    struct Quadratic;

    impl DifferentiableFunction<f64> for Quadratic {
        fn summary_for_instance(
            &self,
            target: &f64,
            weights: &ConcatVector,
            gradient: &mut ConcatVector,
        ) -> Result<f64, LoglinearError> {
            let w = weights.value_at(0, 0);
            let mut g = ConcatVector::new(1);
            g.set_dense(0, vec![-2.0 * (w - target)]);
            gradient.add_scaled_in_place(&g, 1.0);
            Ok(-(w - target) * (w - target))
        }

        fn estimate_relative_runtime(&self, target: &f64) -> usize {
            *target as usize
        }
    }

    fn start() -> ConcatVector {
        let mut w = ConcatVector::new(1);
        w.set_dense(0, vec![0.0]);
        w
    }

    fn config() -> BatchOptimizerConfig {
        BatchOptimizerConfig {
            l2_sigma: 1.0e6,
            convergence_derivative_norm: 1.0e-10,
            num_threads: 2,
            max_iterations: Some(10_000),
            quiet: true,
        }
    }

    #[test]
    fn config_rejects_degenerate_settings() {
        let zero_sigma = BatchOptimizerConfig {
            l2_sigma: 0.0,
            ..BatchOptimizerConfig::default()
        };
        assert!(zero_sigma.validate().is_err());
        let zero_tolerance = BatchOptimizerConfig {
            convergence_derivative_norm: 0.0,
            ..BatchOptimizerConfig::default()
        };
        assert!(BatchOptimizer::new(GradientAscent::default(), zero_tolerance).is_err());
        assert!(BatchOptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn gradient_ascent_finds_the_mean() {
        let optimizer = BatchOptimizer::new(GradientAscent { learning_rate: 0.05 }, config())
            .expect("optimizer");
        let data = vec![1.0, 2.0, 6.0];
        let outcome = optimizer.optimize(&data, &Quadratic, &start()).expect("train");
        assert_eq!(outcome.termination, Termination::DerivativeNorm);
        assert!((outcome.weights.value_at(0, 0) - 3.0).abs() < 1e-4);
    }

    #[test]
    fn adagrad_converges() {
        let optimizer =
            BatchOptimizer::new(BacktrackingAdaGrad { alpha: 1.0 }, config()).expect("optimizer");
        let data = vec![2.0, 4.0];
        let outcome = optimizer.optimize(&data, &Quadratic, &start()).expect("train");
        assert_ne!(outcome.termination, Termination::IterationLimit);
        assert!((outcome.weights.value_at(0, 0) - 3.0).abs() < 1e-2);
    }

    #[test]
    fn regularization_shrinks_toward_zero() {
        let strong = BatchOptimizerConfig {
            l2_sigma: (0.5f64).sqrt(),
            ..config()
        };
        // l2 = 1, objective -(w - 4)^2 - w^2 peaks at w = 2.
        let optimizer = BatchOptimizer::new(GradientAscent { learning_rate: 0.1 }, strong)
            .expect("optimizer");
        let outcome = optimizer.optimize(&[4.0], &Quadratic, &start()).expect("train");
        assert!((outcome.weights.value_at(0, 0) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn constraints_pin_weights() {
        let mut optimizer =
            BatchOptimizer::new(GradientAscent { learning_rate: 0.1 }, config()).expect("optimizer");
        optimizer.add_sparse_constraint(0, 0, 1.5);
        let outcome = optimizer.optimize(&[4.0], &Quadratic, &start()).expect("train");
        assert_eq!(outcome.weights.value_at(0, 0), 1.5);
        assert_eq!(outcome.termination, Termination::DerivativeNorm);

        let mut dense = ConcatVector::new(2);
        dense.set_dense(1, vec![3.0, 4.0]);
        WeightConstraint::Dense {
            component: 1,
            values: vec![7.0],
        }
        .apply_to_derivative(&mut dense);
        assert_eq!(dense.value_at(1, 1), 0.0);
    }

    #[test]
    fn iteration_limit_is_reported() {
        let limited = BatchOptimizerConfig {
            max_iterations: Some(3),
            ..config()
        };
        let optimizer = BatchOptimizer::new(GradientAscent { learning_rate: 0.01 }, limited)
            .expect("optimizer");
        let outcome = optimizer.optimize(&[5.0], &Quadratic, &start()).expect("train");
        assert_eq!(outcome.termination, Termination::IterationLimit);
        assert_eq!(outcome.iterations, 3);
    }

    #[test]
    fn raised_flag_cancels_before_any_update() {
        let optimizer =
            BatchOptimizer::new(GradientAscent::default(), config()).expect("optimizer");
        let cancel = AtomicBool::new(true);
        let outcome = optimizer
            .optimize_cancellable(&[1.0], &Quadratic, &start(), &cancel)
            .expect("train");
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.weights.value_at(0, 0), 0.0);
    }

    #[test]
    fn shards_balance_estimated_cost() {
        let data = vec![5.0, 1.0, 1.0, 1.0, 1.0, 3.0];
        let shards = assign_shards(&data, &Quadratic, 2);
        assert_eq!(shards, vec![vec![0], vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn rebalance_moves_tail_of_slowest_shard() {
        let mut shards = vec![vec![0, 1, 2, 3, 4, 5, 6, 7], vec![8]];
        let moved = rebalance_shards(
            &mut shards,
            &[Duration::from_millis(100), Duration::from_millis(50)],
        );
        assert_eq!(moved, 2);
        assert_eq!(shards[0], vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(shards[1], vec![8, 6, 7]);

        let mut single = vec![vec![0, 1]];
        assert_eq!(rebalance_shards(&mut single, &[Duration::from_millis(5)]), 0);
    }

    #[test]
    fn background_training_can_be_cancelled() {
        let unbounded = BatchOptimizerConfig {
            max_iterations: None,
            convergence_derivative_norm: f64::MIN_POSITIVE,
            ..config()
        };
        // A step too small to ever converge.
        let optimizer = BatchOptimizer::new(GradientAscent { learning_rate: 1e-12 }, unbounded)
            .expect("optimizer");
        let handle = optimizer
            .spawn(vec![1.0e3; 4], Quadratic, start())
            .expect("spawn");
        assert!(!handle.wait_timeout(Duration::from_millis(20)));
        handle.cancel();
        let outcome = handle.wait().expect("outcome");
        assert_eq!(outcome.termination, Termination::Cancelled);
    }

    #[test]
    fn background_training_reports_completion() {
        let optimizer = BatchOptimizer::new(GradientAscent { learning_rate: 0.05 }, config())
            .expect("optimizer");
        let handle = optimizer
            .spawn(vec![1.0, 5.0], Quadratic, start())
            .expect("spawn");
        let outcome = handle.wait().expect("outcome");
        assert_eq!(outcome.termination, Termination::DerivativeNorm);
        assert!((outcome.weights.value_at(0, 0) - 3.0).abs() < 1e-4);
    }
}

//! Conditional log-likelihood of labeled graphical models.
//!
//! For a model with training labels stored under
//! [`VARIABLE_TRAINING_VALUE`](crate::model::VARIABLE_TRAINING_VALUE), the
//! log-likelihood of the labels is `ln Z_clamped - ln Z`, where `Z` is the
//! partition function of the model as given and `Z_clamped` that of a copy
//! with every labeled variable observed at its label. The gradient with
//! respect to the weights is the expected feature vector under the clamped
//! model minus the expected feature vector under the free model.

use crate::errors::LoglinearError;
use crate::inference::{CliqueTree, CliqueTreeConfig};
use crate::learning::differentiable::DifferentiableFunction;
use crate::model::{ConcatVector, GraphicalModel};

/// Log-likelihood objective over [`GraphicalModel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLikelihoodFunction {
    inference: CliqueTreeConfig,
}

impl LogLikelihoodFunction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inference_config(config: CliqueTreeConfig) -> Result<Self, LoglinearError> {
        Ok(Self {
            inference: config.validate()?,
        })
    }
}

/// Copy of `model` with every labeled variable observed at its label.
fn clamp_to_labels(model: &GraphicalModel) -> Result<GraphicalModel, LoglinearError> {
    let mut clamped = model.clone_model();
    for variable in 0..model.num_variables() {
        if let Some(label) = model.training_label(variable)? {
            clamped.observe(variable, label);
        }
    }
    Ok(clamped)
}

impl DifferentiableFunction<GraphicalModel> for LogLikelihoodFunction {
    fn summary_for_instance(
        &self,
        model: &GraphicalModel,
        weights: &ConcatVector,
        gradient: &mut ConcatVector,
    ) -> Result<f64, LoglinearError> {
        let free =
            CliqueTree::with_config(model, weights, self.inference)?.calculate_marginals(model)?;

        let clamped_model = clamp_to_labels(model)?;
        let clamped = CliqueTree::with_config(&clamped_model, weights, self.inference)?
            .calculate_marginals(&clamped_model)?;

        let log_likelihood = clamped.partition_function.ln() - free.partition_function.ln();

        for factor in model.factors().iter().filter(|f| f.is_vector()) {
            let (Some(free_joint), Some(clamped_joint)) = (
                free.joint_marginal(factor.id()),
                clamped.joint_marginal(factor.id()),
            ) else {
                return Err(LoglinearError::Internal(format!(
                    "missing joint marginal for {}",
                    factor.id()
                )));
            };
            let mut cursor = free_joint.cursor();
            while cursor.advance() {
                let assignment = cursor.current();
                let delta = clamped_joint.get(assignment)? - free_joint.get(assignment)?;
                if delta == 0.0 {
                    continue;
                }
                if let Some(features) = factor.features(assignment)? {
                    gradient.add_scaled_in_place(&features, delta);
                }
            }
        }

        Ok(log_likelihood)
    }

    /// Total number of factor cells.
    fn estimate_relative_runtime(&self, model: &GraphicalModel) -> usize {
        model
            .factors()
            .iter()
            .map(|f| f.combinatorial_state_count())
            .sum()
    }
}

use crate::node::TreeNode;
use crate::traits::ScoringNetwork;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdSettings {
    pub step_size: f64,
}

impl Default for SgdSettings {
    fn default() -> Self {
        Self { step_size: 0.1 }
    }
}

impl SgdSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            bail!("step_size must be positive and finite.");
        }
        Ok(())
    }
}

/// `-log P(target | input)`.
pub fn negative_log_likelihood<N: ScoringNetwork>(
    tree: &TreeNode<N>,
    input: &[f64],
    target: usize,
) -> Result<f64> {
    let out = tree.evaluate(input);
    match out.get(target) {
        Some(log_prob) => Ok(-log_prob),
        None => bail!(
            "Target class {} out of range for {} classes.",
            target,
            out.len()
        ),
    }
}

/// One plain gradient-descent step on a single labelled example.
/// Returns the loss measured before the update.
pub fn sgd_step<N: ScoringNetwork>(
    tree: &mut TreeNode<N>,
    input: &[f64],
    target: usize,
    settings: SgdSettings,
) -> Result<f64> {
    settings.validate()?;
    let (loss, grads) = tree.loss_gradient(input, target)?;
    for (param, grad) in tree.parameters_mut().into_iter().zip(&grads) {
        for (value, g) in param.values.iter_mut().zip(grad) {
            *value -= settings.step_size * g;
        }
    }
    debug!(loss, target, step_size = settings.step_size, "Applied SGD step");
    Ok(loss)
}

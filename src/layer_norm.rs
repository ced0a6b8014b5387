use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::errors::{ModelError, Result};
use crate::layer::Layer;

/// Layer normalization over the feature axis with learned gain and shift.
///
/// ```text
/// y = γ ⊙ (x - mean(x)) / sqrt(var(x) + ε) + β
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LayerNorm {
    epsilon: f32,
    gamma: Array2<f32>,
    beta: Array2<f32>,

    #[serde(skip)]
    cached_normalized: Option<Array2<f32>>,
    #[serde(skip)]
    cached_inv_std: Option<Array2<f32>>,

    optimizer_gamma: Adam,
    optimizer_beta: Adam,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self::with_epsilon(dim, 1e-8)
    }

    pub fn with_epsilon(dim: usize, epsilon: f32) -> Self {
        Self {
            epsilon,
            gamma: Array2::ones((1, dim)),
            beta: Array2::zeros((1, dim)),
            cached_normalized: None,
            cached_inv_std: None,
            optimizer_gamma: Adam::new((1, dim)),
            optimizer_beta: Adam::new((1, dim)),
        }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl Layer for LayerNorm {
    fn layer_type(&self) -> &str {
        "LayerNorm"
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let dim = input.ncols().max(1) as f32;
        let mean = input.sum_axis(Axis(1)).insert_axis(Axis(1)) / dim;
        let centered = input - &mean;
        let variance = centered.mapv(|x| x * x).sum_axis(Axis(1)).insert_axis(Axis(1)) / dim;
        let inv_std = variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let normalized = &centered * &inv_std;

        let output = &normalized * &self.gamma + &self.beta;
        self.cached_normalized = Some(normalized);
        self.cached_inv_std = Some(inv_std);
        output
    }

    fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let (Some(normalized), Some(inv_std)) = (&self.cached_normalized, &self.cached_inv_std) else {
            return (
                Array2::zeros(output_grads.dim()),
                vec![Array2::zeros(self.gamma.dim()), Array2::zeros(self.beta.dim())],
            );
        };
        let dim = output_grads.ncols().max(1) as f32;

        let grad_gamma = (output_grads * normalized).sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_beta = output_grads.sum_axis(Axis(0)).insert_axis(Axis(0));

        // dx = inv_std * (g - mean(g) - x̂ * mean(g ⊙ x̂)), g = dy ⊙ γ
        let g = output_grads * &self.gamma;
        let mean_g = g.sum_axis(Axis(1)).insert_axis(Axis(1)) / dim;
        let mean_gx = (&g * normalized).sum_axis(Axis(1)).insert_axis(Axis(1)) / dim;
        let grad_input = (&g - &mean_g - &(normalized * &mean_gx)) * inv_std;

        (grad_input, vec![grad_gamma, grad_beta])
    }

    fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad_gamma, grad_beta] = param_grads else {
            return Err(ModelError::gradient_count(self.layer_type(), 2, param_grads.len()));
        };
        self.optimizer_gamma.step(&mut self.gamma, grad_gamma, lr);
        self.optimizer_beta.step(&mut self.beta, grad_beta, lr);
        Ok(())
    }

    fn parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

use ndarray::{Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::errors::{ModelError, Result};
use crate::init;
use crate::layer::Layer;

/// Position-wise feed-forward net: `ReLU(x W1 + b1) W2 + b2`.
///
/// The residual connection lives in the enclosing block.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FeedForward {
    w1: Array2<f32>,
    b1: Array2<f32>,
    w2: Array2<f32>,
    b2: Array2<f32>,

    // Cached values for backward pass
    #[serde(skip)]
    input: Option<Array2<f32>>,
    #[serde(skip)]
    hidden_pre_activation: Option<Array2<f32>>,
    #[serde(skip)]
    hidden_post_activation: Option<Array2<f32>>,

    optimizer_w1: Adam,
    optimizer_b1: Adam,
    optimizer_w2: Adam,
    optimizer_b2: Adam,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(model_dim: usize, hidden_dim: usize, rng: &mut R) -> Self {
        FeedForward {
            w1: init::he_normal((model_dim, hidden_dim), rng),
            b1: Array2::zeros((1, hidden_dim)),
            w2: init::glorot_uniform((hidden_dim, model_dim), rng),
            b2: Array2::zeros((1, model_dim)),
            input: None,
            hidden_pre_activation: None,
            hidden_post_activation: None,
            optimizer_w1: Adam::new((model_dim, hidden_dim)),
            optimizer_b1: Adam::new((1, hidden_dim)),
            optimizer_w2: Adam::new((hidden_dim, model_dim)),
            optimizer_b2: Adam::new((1, model_dim)),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.w1.ncols()
    }
}

impl Layer for FeedForward {
    fn layer_type(&self) -> &str {
        "FeedForward"
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let hidden_pre_activation = input.dot(&self.w1) + &self.b1;
        let hidden_post_activation = hidden_pre_activation.mapv(|x| x.max(0.0)); // ReLU

        let output = hidden_post_activation.dot(&self.w2) + &self.b2;

        self.input = Some(input.clone());
        self.hidden_pre_activation = Some(hidden_pre_activation);
        self.hidden_post_activation = Some(hidden_post_activation);
        output
    }

    fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let (Some(input), Some(hidden_pre_activation), Some(hidden_post_activation)) = (
            &self.input,
            &self.hidden_pre_activation,
            &self.hidden_post_activation,
        ) else {
            return (
                Array2::zeros((output_grads.nrows(), self.w1.nrows())),
                vec![
                    Array2::zeros(self.w1.dim()),
                    Array2::zeros(self.b1.dim()),
                    Array2::zeros(self.w2.dim()),
                    Array2::zeros(self.b2.dim()),
                ],
            );
        };

        let grad_w2 = hidden_post_activation.t().dot(output_grads);
        let grad_b2 = output_grads.sum_axis(Axis(0)).insert_axis(Axis(0));

        let grad_hidden_post_activation = output_grads.dot(&self.w2.t());
        let relu_grad = hidden_pre_activation.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
        let grad_hidden_pre_activation = grad_hidden_post_activation * relu_grad;

        let grad_w1 = input.t().dot(&grad_hidden_pre_activation);
        let grad_b1 = grad_hidden_pre_activation.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_input = grad_hidden_pre_activation.dot(&self.w1.t());

        (grad_input, vec![grad_w1, grad_b1, grad_w2, grad_b2])
    }

    fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad_w1, grad_b1, grad_w2, grad_b2] = param_grads else {
            return Err(ModelError::gradient_count(self.layer_type(), 4, param_grads.len()));
        };
        self.optimizer_w1.step(&mut self.w1, grad_w1, lr);
        self.optimizer_b1.step(&mut self.b1, grad_b1, lr);
        self.optimizer_w2.step(&mut self.w2, grad_w2, lr);
        self.optimizer_b2.step(&mut self.b2, grad_b2, lr);
        Ok(())
    }

    fn parameters(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }
}

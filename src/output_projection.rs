use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::errors::{ModelError, Result};
use crate::init;
use crate::layer::Layer;

/// Index of the largest entry; the first one wins ties.
pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val { (i, v) } else { (best, best_val) }
        })
        .0
}

pub fn argmax_rows(scores: &Array2<f32>) -> Vec<usize> {
    scores.outer_iter().map(argmax).collect()
}

/// Dense per-token map to class logits, shared across positions and sentences.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutputProjection {
    pub w_out: Array2<f32>,
    pub b_out: Array2<f32>,
    optimizer_w: Adam,
    optimizer_b: Adam,
    #[serde(skip)]
    cached_input: Option<Array2<f32>>,
}

impl OutputProjection {
    /// Weights from a truncated normal with std 0.01, bias constant 0.1.
    pub fn new<R: Rng + ?Sized>(input_dim: usize, class_count: usize, rng: &mut R) -> Self {
        OutputProjection {
            w_out: init::truncated_normal((input_dim, class_count), 0.01, rng),
            b_out: Array2::from_elem((1, class_count), 0.1),
            optimizer_w: Adam::new((input_dim, class_count)),
            optimizer_b: Adam::new((1, class_count)),
            cached_input: None,
        }
    }

    pub fn class_count(&self) -> usize {
        self.w_out.ncols()
    }
}

impl Layer for OutputProjection {
    fn layer_type(&self) -> &str {
        "OutputProjection"
    }

    /// `(tokens, input_dim)` to `(tokens, class_count)` logits.
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        self.cached_input = Some(input.clone());
        input.dot(&self.w_out) + &self.b_out
    }

    fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let grad_input = output_grads.dot(&self.w_out.t());
        let grad_w_out = match &self.cached_input {
            Some(input) => input.t().dot(output_grads),
            None => Array2::zeros(self.w_out.dim()),
        };
        let grad_b_out = output_grads.sum_axis(Axis(0)).insert_axis(Axis(0));

        (grad_input, vec![grad_w_out, grad_b_out])
    }

    fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad_w, grad_b] = param_grads else {
            return Err(ModelError::gradient_count(self.layer_type(), 2, param_grads.len()));
        };
        self.optimizer_w.step(&mut self.w_out, grad_w, lr);
        self.optimizer_b.step(&mut self.b_out, grad_b, lr);
        Ok(())
    }

    fn parameters(&self) -> usize {
        self.w_out.len() + self.b_out.len()
    }
}

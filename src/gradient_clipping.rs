//! Gradient clipping applied to the full set of gradients of one optimiser step.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Trait for gradient clipping strategies
pub trait GradientClipping: Send + Sync {
    /// Clip the gradients in place and return the global norm measured before clipping.
    ///
    /// Gradients are grouped per parameter owner; the grouping does not affect the result.
    fn clip_gradients(&mut self, grads: &mut [Vec<Array2<f32>>]) -> f32;
}

/// Square root of the summed squares of every entry of every gradient.
pub fn global_norm(grads: &[Vec<Array2<f32>>]) -> f32 {
    grads
        .iter()
        .flatten()
        .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Rescales all gradients by `clip_norm / max(global_norm, clip_norm)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GlobalNormClipping {
    clip_norm: f32,
}

impl GlobalNormClipping {
    pub fn new(clip_norm: f32) -> Self {
        Self { clip_norm }
    }

    pub fn clip_norm(&self) -> f32 {
        self.clip_norm
    }
}

impl GradientClipping for GlobalNormClipping {
    fn clip_gradients(&mut self, grads: &mut [Vec<Array2<f32>>]) -> f32 {
        // NaN/inf entries would poison the norm for every parameter
        for grad in grads.iter_mut().flatten() {
            grad.mapv_inplace(|x| if x.is_finite() { x } else { 0.0 });
        }

        let norm = global_norm(grads);
        if norm > self.clip_norm && norm > 0.0 {
            let scale = self.clip_norm / norm;
            for grad in grads.iter_mut().flatten() {
                grad.mapv_inplace(|x| x * scale);
            }
        }
        norm
    }
}

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Training/inference switch supplied fresh with every forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Training,
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Inverted dropout: kept activations are scaled by `1 / keep_prob` so inference is the identity.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Dropout {
    keep_prob: f32,
    #[serde(skip)]
    cached_mask: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(keep_prob: f32) -> Self {
        Self {
            keep_prob: keep_prob.clamp(f32::EPSILON, 1.0),
            cached_mask: None,
        }
    }

    pub fn keep_prob(&self) -> f32 {
        self.keep_prob
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, input: &Array2<f32>, mode: Mode, rng: &mut R) -> Array2<f32> {
        if !mode.is_training() || self.keep_prob >= 1.0 {
            self.cached_mask = None;
            return input.clone();
        }

        let keep_prob = self.keep_prob;
        let mask = Array2::from_shape_fn(input.dim(), |_| {
            if rng.random::<f32>() < keep_prob {
                1.0 / keep_prob
            } else {
                0.0
            }
        });
        let output = input * &mask;
        self.cached_mask = Some(mask);
        output
    }

    pub fn backward(&self, grads: &Array2<f32>) -> Array2<f32> {
        match &self.cached_mask {
            Some(mask) => grads * mask,
            None => grads.clone(),
        }
    }
}

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Adam with bias-corrected first and second moment estimates.
///
/// Every trainable parameter owns its own instance so that moment state lives
/// next to the weights it tracks.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: usize,
    pub m: Array2<f32>,
    pub v: Array2<f32>,
}

impl Adam {
    pub fn new(shape: (usize, usize)) -> Self {
        Self::with_hyperparameters(shape, 0.9, 0.999, 1e-8)
    }

    pub fn with_hyperparameters(shape: (usize, usize), beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            timestep: 0,
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    /// One in-place update of `params` against `grads`.
    pub fn step(&mut self, params: &mut Array2<f32>, grads: &Array2<f32>, lr: f32) {
        self.timestep += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let correction1 = 1.0 - beta1.powi(self.timestep as i32);
        let correction2 = 1.0 - beta2.powi(self.timestep as i32);

        Zip::from(params)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grads)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });
    }
}

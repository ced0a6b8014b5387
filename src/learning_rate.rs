use serde::{Deserialize, Serialize};

/// Exponential learning-rate decay keyed by the global step.
///
/// `lr = starter * decay_rate ^ (global_step / decay_steps)`, where the exponent is
/// floored when `staircase` is set so the rate drops in discrete jumps.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExponentialDecay {
    pub starter_learning_rate: f32,
    pub decay_rate: f32,
    pub decay_steps: u64,
    pub staircase: bool,
}

impl ExponentialDecay {
    pub fn new(starter_learning_rate: f32, decay_rate: f32, decay_steps: u64, staircase: bool) -> Self {
        Self {
            starter_learning_rate,
            decay_rate,
            decay_steps: decay_steps.max(1),
            staircase,
        }
    }

    pub fn learning_rate(&self, global_step: u64) -> f32 {
        let progress = global_step as f64 / self.decay_steps as f64;
        let exponent = if self.staircase { progress.floor() } else { progress };
        (self.starter_learning_rate as f64 * (self.decay_rate as f64).powf(exponent)) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_staircase_holds_rate_within_interval() {
        let schedule = ExponentialDecay::new(0.001, 0.9, 100, true);
        assert_relative_eq!(schedule.learning_rate(0), 0.001);
        assert_relative_eq!(schedule.learning_rate(99), 0.001);
        assert_relative_eq!(schedule.learning_rate(100), 0.0009, epsilon = 1e-9);
        assert_relative_eq!(schedule.learning_rate(250), 0.00081, epsilon = 1e-9);
    }

    #[test]
    fn test_continuous_decay_is_smooth() {
        let schedule = ExponentialDecay::new(1.0, 0.5, 10, false);
        assert_relative_eq!(schedule.learning_rate(5), 0.5f32.sqrt(), epsilon = 1e-6);
        assert!(schedule.learning_rate(11) < schedule.learning_rate(10));
    }

    #[test]
    fn test_zero_decay_steps_is_clamped() {
        let schedule = ExponentialDecay::new(1.0, 0.5, 0, true);
        assert_eq!(schedule.decay_steps, 1);
        assert_relative_eq!(schedule.learning_rate(2), 0.25);
    }
}

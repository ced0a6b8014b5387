//! Parameter initialisers shared by every layer.

use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;

/// Uniform samples in `[low, high)`.
pub fn uniform<R: Rng + ?Sized>(shape: (usize, usize), low: f32, high: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn(shape, |_| rng.random_range(low..high))
}

/// Glorot/Xavier uniform: `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (shape.0 + shape.1).max(1) as f32).sqrt();
    uniform(shape, -limit, limit, rng)
}

/// Normal samples with mean 0, redrawn until they fall within two standard deviations.
pub fn truncated_normal<R: Rng + ?Sized>(shape: (usize, usize), std: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn(shape, |_| loop {
        let z: f32 = rng.sample(StandardNormal);
        if z.abs() <= 2.0 {
            break z * std;
        }
    })
}

/// He initialisation: `std = sqrt(2 / fan_in)`.
pub fn he_normal<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let std = (2.0 / shape.0.max(1) as f32).sqrt();
    Array2::from_shape_fn(shape, |_| {
        let z: f32 = rng.sample(StandardNormal);
        z * std
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_truncated_normal_stays_within_two_std() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = truncated_normal((50, 40), 0.1, &mut rng);
        assert!(w.iter().all(|&x| x.abs() <= 0.2 + 1e-6));
    }

    #[test]
    fn test_glorot_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = glorot_uniform((10, 20), &mut rng);
        let limit = (6.0f32 / 30.0).sqrt();
        assert!(w.iter().all(|&x| x.abs() <= limit));
    }
}

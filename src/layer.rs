use ndarray::Array2;

use crate::errors::Result;

/// A per-token transform over a flattened `(tokens, features)` matrix.
///
/// `forward` caches what `compute_gradients` needs, so the two must be called in
/// pairs. Gradients are returned in the same order `apply_gradients` expects them.
pub trait Layer {
    fn layer_type(&self) -> &str;

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32>;

    /// Returns the gradient with respect to the input and the parameter gradients.
    fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>);

    fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()>;

    /// Number of trainable scalars
    fn parameters(&self) -> usize;
}

//! Training objectives over per-token logits, plus masked accuracy.
//!
//! Logits and gradients use the flattened `(batch * sentence_length, classes)` layout.

use ndarray::{Array2, Array3, s};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{DecodingMode, TaggerConfig};
use crate::crf::LinearChainCrf;
use crate::errors::Result;
use crate::mask;
use crate::output_projection::{argmax, argmax_rows};

/// Loss value with the gradient on the logits and on the objective's own parameters.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    pub logit_grads: Array2<f32>,
    pub param_grads: Vec<Array2<f32>>,
}

/// Output semantics, chosen once at build time.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Objective {
    /// Sentence-level log-likelihood under a linear-chain CRF
    Structured(LinearChainCrf),
    /// Masked per-token softmax cross-entropy
    Independent,
}

fn gold_tags(labels: &Array3<f32>, b: usize, len: usize) -> Vec<usize> {
    (0..len).map(|t| argmax(labels.slice(s![b, t, ..]))).collect()
}

impl Objective {
    pub fn new<R: Rng + ?Sized>(config: &TaggerConfig, rng: &mut R) -> Self {
        match config.decoding_mode {
            DecodingMode::Structured => Objective::Structured(LinearChainCrf::new(config.class_count, rng)),
            DecodingMode::Independent => Objective::Independent,
        }
    }

    pub fn mode(&self) -> DecodingMode {
        match self {
            Objective::Structured(_) => DecodingMode::Structured,
            Objective::Independent => DecodingMode::Independent,
        }
    }

    /// Transition scores, present only in structured mode.
    pub fn transition_params(&self) -> Option<&Array2<f32>> {
        match self {
            Objective::Structured(crf) => Some(crf.transitions()),
            Objective::Independent => None,
        }
    }

    /// Mean loss over the batch and its gradients.
    ///
    /// `labels` is `(batch, sentence_length, classes)` one-hot; `lengths` the true
    /// sentence lengths.
    pub fn loss_and_gradients(&self, logits: &Array2<f32>, labels: &Array3<f32>, lengths: &[usize]) -> LossOutput {
        match self {
            Objective::Structured(crf) => structured_loss(crf, logits, labels, lengths),
            Objective::Independent => independent_loss(logits, labels, lengths),
        }
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        match self {
            Objective::Structured(crf) => crf.apply_gradients(param_grads, lr),
            Objective::Independent => Ok(()),
        }
    }

    /// Best label path per sentence, truncated to its length.
    pub fn decode(&self, logits: &Array2<f32>, lengths: &[usize]) -> Vec<Vec<usize>> {
        let sentence_length = if lengths.is_empty() { 0 } else { logits.nrows() / lengths.len() };
        lengths
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let unary = logits.slice(s![b * sentence_length..b * sentence_length + len, ..]);
                match self {
                    Objective::Structured(crf) => crf.viterbi(unary),
                    Objective::Independent => unary.outer_iter().map(argmax).collect(),
                }
            })
            .collect()
    }

    pub fn parameters(&self) -> usize {
        match self {
            Objective::Structured(crf) => crf.parameters(),
            Objective::Independent => 0,
        }
    }
}

fn structured_loss(crf: &LinearChainCrf, logits: &Array2<f32>, labels: &Array3<f32>, lengths: &[usize]) -> LossOutput {
    let (batch, sentence_length, classes) = labels.dim();
    let scale = 1.0 / batch.max(1) as f32;
    let mut logit_grads = Array2::zeros(logits.dim());
    let mut transition_grads = Array2::zeros((classes, classes));
    let mut total = 0.0;

    for (b, &len) in lengths.iter().enumerate() {
        let rows = s![b * sentence_length..b * sentence_length + len, ..];
        let result = crf.sequence_nll(logits.slice(rows), &gold_tags(labels, b, len));
        total += result.nll;
        logit_grads.slice_mut(rows).assign(&(result.unary_grads * scale));
        transition_grads += &(result.transition_grads * scale);
    }

    LossOutput {
        loss: total * scale,
        logit_grads,
        param_grads: vec![transition_grads],
    }
}

fn independent_loss(logits: &Array2<f32>, labels: &Array3<f32>, lengths: &[usize]) -> LossOutput {
    let (batch, sentence_length, _) = labels.dim();
    let token_mask = mask::label_masks(labels);
    let batch_scale = 1.0 / batch.max(1) as f32;
    let mut logit_grads = Array2::zeros(logits.dim());
    let mut total = 0.0;

    for b in 0..batch {
        let norm = 1.0 / lengths[b].max(1) as f32;
        let mut sentence_loss = 0.0;
        for t in 0..sentence_length {
            if token_mask[[b, t]] == 0.0 {
                continue;
            }
            let row = b * sentence_length + t;
            let scores = logits.row(row);
            let target = labels.slice(s![b, t, ..]);

            let max = scores.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            let log_norm = max + scores.mapv(|x| (x - max).exp()).sum().ln();
            let log_probs = scores.mapv(|x| x - log_norm);
            sentence_loss -= target.dot(&log_probs);

            let grad = (log_probs.mapv(f32::exp) * target.sum() - target) * (norm * batch_scale);
            logit_grads.row_mut(row).assign(&grad);
        }
        total += sentence_loss * norm;
    }

    LossOutput {
        loss: total * batch_scale,
        logit_grads,
        param_grads: Vec::new(),
    }
}

/// Fraction of correctly predicted real tokens per sentence, averaged over the batch.
///
/// `predictions` is `(batch, sentence_length)`; a token counts when its label vector
/// is non-zero.
pub fn accuracy(predictions: &Array2<usize>, labels: &Array3<f32>, lengths: &[usize]) -> f32 {
    let (batch, sentence_length, _) = labels.dim();
    if batch == 0 {
        return 0.0;
    }
    let token_mask = mask::label_masks(labels);
    let total: f32 = (0..batch)
        .map(|b| {
            let correct = (0..sentence_length)
                .filter(|&t| token_mask[[b, t]] > 0.0 && predictions[[b, t]] == argmax(labels.slice(s![b, t, ..])))
                .count();
            correct as f32 / lengths[b].max(1) as f32
        })
        .sum();
    total / batch as f32
}

/// Per-token argmax of flattened logits reshaped to `(batch, sentence_length)`.
pub fn predictions(logits: &Array2<f32>, batch: usize, sentence_length: usize) -> Array2<usize> {
    let flat = argmax_rows(logits);
    Array2::from_shape_fn((batch, sentence_length), |(b, t)| flat[b * sentence_length + t])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn one_hot(tags: &[Option<usize>], classes: usize) -> Array3<f32> {
        Array3::from_shape_fn((1, tags.len(), classes), |(_, t, c)| match tags[t] {
            Some(tag) if tag == c => 1.0,
            _ => 0.0,
        })
    }

    #[test]
    fn test_independent_loss_uniform_logits() {
        let labels = one_hot(&[Some(0), Some(2), None], 3);
        let logits = Array2::zeros((3, 3));
        let out = Objective::Independent.loss_and_gradients(&logits, &labels, &[2]);
        assert_abs_diff_eq!(out.loss, 3f32.ln(), epsilon = 1e-5);
        // padding token has no gradient
        assert!(out.logit_grads.row(2).iter().all(|&g| g == 0.0));
        assert_abs_diff_eq!(out.logit_grads[[0, 0]], (1.0 / 3.0 - 1.0) / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_accuracy_ignores_padding() {
        let labels = one_hot(&[Some(1), Some(0), None, None], 2);
        let predictions = array![[1, 0, 1, 1]];
        assert_abs_diff_eq!(accuracy(&predictions, &labels, &[2]), 1.0);
        let predictions = array![[1, 1, 0, 0]];
        assert_abs_diff_eq!(accuracy(&predictions, &labels, &[2]), 0.5);
    }

    #[test]
    fn test_structured_loss_is_positive_and_gradient_shaped() {
        let crf = LinearChainCrf::from_transitions(Array2::zeros((2, 2)));
        let objective = Objective::Structured(crf);
        let labels = one_hot(&[Some(1), Some(0), None], 2);
        let logits = array![[0.2, 0.1], [0.3, -0.4], [9.0, 9.0]];
        let out = objective.loss_and_gradients(&logits, &labels, &[2]);
        assert!(out.loss > 0.0);
        assert_eq!(out.param_grads.len(), 1);
        assert!(out.logit_grads.row(2).iter().all(|&g| g == 0.0));
        assert_eq!(objective.decode(&logits, &[2])[0].len(), 2);
    }
}

//! Linear-chain conditional random field over per-token logits.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::errors::{ModelError, Result};
use crate::init;
use crate::output_projection::argmax;

fn log_sum_exp(values: ArrayView1<'_, f32>) -> f32 {
    let max = values.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    if !max.is_finite() {
        return max;
    }
    max + values.mapv(|x| (x - max).exp()).sum().ln()
}

/// Negative log-likelihood of one sentence and its gradients.
#[derive(Clone, Debug)]
pub struct SequenceNll {
    pub nll: f32,
    /// `(len, classes)` gradient with respect to the unary scores
    pub unary_grads: Array2<f32>,
    pub transition_grads: Array2<f32>,
}

/// Pairwise transition scores `transitions[[from, to]]` learned jointly with the encoder.
/// There are no dedicated start or end transitions.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LinearChainCrf {
    transitions: Array2<f32>,
    optimizer: Adam,
}

impl LinearChainCrf {
    pub fn new<R: Rng + ?Sized>(class_count: usize, rng: &mut R) -> Self {
        Self {
            transitions: init::glorot_uniform((class_count, class_count), rng),
            optimizer: Adam::new((class_count, class_count)),
        }
    }

    pub fn from_transitions(transitions: Array2<f32>) -> Self {
        let optimizer = Adam::new(transitions.dim());
        Self { transitions, optimizer }
    }

    pub fn transitions(&self) -> &Array2<f32> {
        &self.transitions
    }

    pub fn class_count(&self) -> usize {
        self.transitions.nrows()
    }

    /// Unnormalised score of a tag path.
    pub fn path_score(&self, unary: ArrayView2<'_, f32>, tags: &[usize]) -> f32 {
        let emissions: f32 = tags.iter().enumerate().map(|(t, &y)| unary[[t, y]]).sum();
        let transitions: f32 = tags.windows(2).map(|w| self.transitions[[w[0], w[1]]]).sum();
        emissions + transitions
    }

    /// Forward recursion in log space, `alpha[[t, j]]`.
    fn forward_scores(&self, unary: ArrayView2<'_, f32>) -> Array2<f32> {
        let (len, classes) = unary.dim();
        let mut alpha = Array2::zeros((len, classes));
        if len == 0 {
            return alpha;
        }
        alpha.row_mut(0).assign(&unary.row(0));
        for t in 1..len {
            for j in 0..classes {
                let incoming = &alpha.row(t - 1) + &self.transitions.column(j);
                alpha[[t, j]] = log_sum_exp(incoming.view()) + unary[[t, j]];
            }
        }
        alpha
    }

    /// Backward recursion in log space, `beta[[t, i]]`.
    fn backward_scores(&self, unary: ArrayView2<'_, f32>) -> Array2<f32> {
        let (len, classes) = unary.dim();
        let mut beta = Array2::zeros((len, classes));
        for t in (0..len.saturating_sub(1)).rev() {
            let next = &unary.row(t + 1) + &beta.row(t + 1);
            for i in 0..classes {
                let outgoing = &self.transitions.row(i) + &next;
                beta[[t, i]] = log_sum_exp(outgoing.view());
            }
        }
        beta
    }

    /// Log partition function over all tag paths of the sentence.
    pub fn log_partition(&self, unary: ArrayView2<'_, f32>) -> f32 {
        match unary.nrows() {
            0 => 0.0,
            len => log_sum_exp(self.forward_scores(unary).row(len - 1)),
        }
    }

    /// `unary` holds only the sentence's real tokens, `tags.len() == unary.nrows()`.
    pub fn sequence_nll(&self, unary: ArrayView2<'_, f32>, tags: &[usize]) -> SequenceNll {
        let (len, classes) = unary.dim();
        let mut unary_grads = Array2::zeros((len, classes));
        let mut transition_grads = Array2::zeros((classes, classes));
        if len == 0 {
            return SequenceNll {
                nll: 0.0,
                unary_grads,
                transition_grads,
            };
        }

        let alpha = self.forward_scores(unary);
        let beta = self.backward_scores(unary);
        let log_z = log_sum_exp(alpha.row(len - 1));

        for t in 0..len {
            let marginal = (&alpha.row(t) + &beta.row(t)).mapv(|x| (x - log_z).exp());
            unary_grads.row_mut(t).assign(&marginal);
            unary_grads[[t, tags[t]]] -= 1.0;
        }
        for t in 1..len {
            for i in 0..classes {
                for j in 0..classes {
                    let log_p = alpha[[t - 1, i]] + self.transitions[[i, j]] + unary[[t, j]] + beta[[t, j]] - log_z;
                    transition_grads[[i, j]] += log_p.exp();
                }
            }
            transition_grads[[tags[t - 1], tags[t]]] -= 1.0;
        }

        SequenceNll {
            nll: log_z - self.path_score(unary, tags),
            unary_grads,
            transition_grads,
        }
    }

    /// Highest scoring tag path (Viterbi).
    pub fn viterbi(&self, unary: ArrayView2<'_, f32>) -> Vec<usize> {
        let (len, classes) = unary.dim();
        if len == 0 {
            return Vec::new();
        }
        let mut best = unary.row(0).to_owned();
        let mut backpointers = Array2::<usize>::zeros((len, classes));
        for t in 1..len {
            let mut next = Array1::zeros(classes);
            for j in 0..classes {
                let (arg, score) = (0..classes)
                    .map(|i| (i, best[i] + self.transitions[[i, j]]))
                    .fold((0, f32::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
                backpointers[[t, j]] = arg;
                next[j] = score + unary[[t, j]];
            }
            best = next;
        }

        let mut path = vec![argmax(best.view()); len];
        for t in (1..len).rev() {
            path[t - 1] = backpointers[[t, path[t]]];
        }
        path
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad] = param_grads else {
            return Err(ModelError::gradient_count("LinearChainCrf", 1, param_grads.len()));
        };
        self.optimizer.step(&mut self.transitions, grad, lr);
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.transitions.len()
    }
}

use ndarray::{Array2, ArrayView2, Axis, s};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::errors::{ModelError, Result};
use crate::init;

/// Softmax over each row, ignoring columns at or beyond `valid`.
/// Masked columns get zero weight; with no valid column the row is all zero.
fn masked_softmax(scores: &Array2<f32>, valid: usize) -> Array2<f32> {
    let mut result = Array2::zeros(scores.dim());
    let valid = valid.min(scores.ncols());
    if valid == 0 {
        return result;
    }
    for (mut out_row, row) in result.outer_iter_mut().zip(scores.outer_iter()) {
        let live = row.slice(s![..valid]);
        let max_val = live.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let exp_values = live.mapv(|x| (x - max_val).exp());
        let sum_exp = exp_values.sum();
        out_row.slice_mut(s![..valid]).assign(&(exp_values / sum_exp));
    }
    result
}

/// Softmax backward pass, row by row: `dx = y ⊙ (dy - <y, dy>)`.
fn softmax_backward(softmax_output: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
    let mut grad_input = Array2::zeros(softmax_output.dim());

    for ((mut grad_row, softmax_row), grad_out_row) in grad_input
        .outer_iter_mut()
        .zip(softmax_output.outer_iter())
        .zip(grad_output.outer_iter())
    {
        let dot = softmax_row.dot(&grad_out_row);
        for ((g, &y_i), &dy_i) in grad_row
            .iter_mut()
            .zip(softmax_row.iter())
            .zip(grad_out_row.iter())
        {
            *g = y_i * (dy_i - dot);
        }
    }

    grad_input
}

#[derive(Clone, Debug)]
struct AttentionCache {
    input: Array2<f32>,
    queries: Array2<f32>,
    keys: Array2<f32>,
    values: Array2<f32>,
    context: Array2<f32>,
    /// Attention weights per `(sentence, head)`, index `b * heads + h`
    weights: Vec<Array2<f32>>,
    lengths: Vec<usize>,
    sentence_length: usize,
}

/// Multi-head self-attention without causal masking.
///
/// Queries, keys and values are affine projections of the same input to
/// `heads * head_dim` features. Keys beyond a sentence's length receive no
/// attention and query rows beyond it attend to nothing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MultiHeadAttention {
    pub model_dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,

    w_q: Array2<f32>,
    b_q: Array2<f32>,
    w_k: Array2<f32>,
    b_k: Array2<f32>,
    w_v: Array2<f32>,
    b_v: Array2<f32>,
    w_o: Array2<f32>,
    b_o: Array2<f32>,

    optimizers: Vec<Adam>,

    #[serde(skip)]
    cache: Option<AttentionCache>,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(model_dim: usize, num_heads: usize, head_dim: usize, rng: &mut R) -> Self {
        let inner = num_heads * head_dim;
        let w_q = init::glorot_uniform((model_dim, inner), rng);
        let w_k = init::glorot_uniform((model_dim, inner), rng);
        let w_v = init::glorot_uniform((model_dim, inner), rng);
        let w_o = init::glorot_uniform((inner, model_dim), rng);
        let b_q = Array2::zeros((1, inner));
        let b_k = Array2::zeros((1, inner));
        let b_v = Array2::zeros((1, inner));
        let b_o = Array2::zeros((1, model_dim));
        let optimizers = [&w_q, &b_q, &w_k, &b_k, &w_v, &b_v, &w_o, &b_o]
            .iter()
            .map(|p| Adam::new(p.dim()))
            .collect();

        Self {
            model_dim,
            num_heads,
            head_dim,
            w_q,
            b_q,
            w_k,
            b_k,
            w_v,
            b_v,
            w_o,
            b_o,
            optimizers,
            cache: None,
        }
    }

    pub fn layer_type(&self) -> &str {
        "MultiHeadSelfAttention"
    }

    fn head_block<'a>(x: &'a Array2<f32>, row: usize, len: usize, head: usize, dim: usize) -> ArrayView2<'a, f32> {
        x.slice(s![row..row + len, head * dim..(head + 1) * dim])
    }

    /// `(lengths.len() * sentence_length, model_dim)` to the same shape.
    pub fn forward(&mut self, input: &Array2<f32>, lengths: &[usize]) -> Array2<f32> {
        let batch = lengths.len();
        let sentence_length = if batch == 0 { 0 } else { input.nrows() / batch };
        let (heads, dim) = (self.num_heads, self.head_dim);
        let scale = (dim as f32).sqrt();

        let queries = input.dot(&self.w_q) + &self.b_q;
        let keys = input.dot(&self.w_k) + &self.b_k;
        let values = input.dot(&self.w_v) + &self.b_v;

        let per_sentence: Vec<(Vec<Array2<f32>>, Array2<f32>)> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let row = b * sentence_length;
                let mut context = Array2::zeros((sentence_length, heads * dim));
                let weights = (0..heads)
                    .map(|h| {
                        let q = Self::head_block(&queries, row, sentence_length, h, dim);
                        let k = Self::head_block(&keys, row, sentence_length, h, dim);
                        let v = Self::head_block(&values, row, sentence_length, h, dim);
                        let mut w = masked_softmax(&(q.dot(&k.t()) / scale), lengths[b]);
                        w.slice_mut(s![lengths[b].min(sentence_length).., ..]).fill(0.0);
                        context.slice_mut(s![.., h * dim..(h + 1) * dim]).assign(&w.dot(&v));
                        w
                    })
                    .collect();
                (weights, context)
            })
            .collect();

        let mut context = Array2::zeros((batch * sentence_length, heads * dim));
        let mut weights = Vec::with_capacity(batch * heads);
        for (b, (w, ctx)) in per_sentence.into_iter().enumerate() {
            context
                .slice_mut(s![b * sentence_length..(b + 1) * sentence_length, ..])
                .assign(&ctx);
            weights.extend(w);
        }

        let output = context.dot(&self.w_o) + &self.b_o;
        self.cache = Some(AttentionCache {
            input: input.clone(),
            queries,
            keys,
            values,
            context,
            weights,
            lengths: lengths.to_vec(),
            sentence_length,
        });
        output
    }

    /// Gradients in the order `[w_q, b_q, w_k, b_k, w_v, b_v, w_o, b_o]`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let Some(cache) = self.cache.as_ref() else {
            let zeros = [&self.w_q, &self.b_q, &self.w_k, &self.b_k, &self.w_v, &self.b_v, &self.w_o, &self.b_o]
                .iter()
                .map(|p| Array2::zeros(p.dim()))
                .collect();
            return (Array2::zeros((output_grads.nrows(), self.model_dim)), zeros);
        };
        let (heads, dim, len) = (self.num_heads, self.head_dim, cache.sentence_length);
        let scale = (dim as f32).sqrt();

        let grad_w_o = cache.context.t().dot(output_grads);
        let grad_b_o = output_grads.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_context = output_grads.dot(&self.w_o.t());

        let mut grad_q = Array2::zeros(cache.queries.dim());
        let mut grad_k = Array2::zeros(cache.keys.dim());
        let mut grad_v = Array2::zeros(cache.values.dim());
        for b in 0..cache.lengths.len() {
            let row = b * len;
            for h in 0..heads {
                let weights = &cache.weights[b * heads + h];
                let d_ctx = Self::head_block(&grad_context, row, len, h, dim);
                let q = Self::head_block(&cache.queries, row, len, h, dim);
                let k = Self::head_block(&cache.keys, row, len, h, dim);
                let v = Self::head_block(&cache.values, row, len, h, dim);

                let grad_weights = d_ctx.dot(&v.t());
                let grad_scores = softmax_backward(weights, &grad_weights) / scale;

                let cols = s![row..row + len, h * dim..(h + 1) * dim];
                grad_v.slice_mut(cols).assign(&weights.t().dot(&d_ctx));
                grad_q.slice_mut(cols).assign(&grad_scores.dot(&k));
                grad_k.slice_mut(cols).assign(&grad_scores.t().dot(&q));
            }
        }

        let input_t = cache.input.t();
        let grads = vec![
            input_t.dot(&grad_q),
            grad_q.sum_axis(Axis(0)).insert_axis(Axis(0)),
            input_t.dot(&grad_k),
            grad_k.sum_axis(Axis(0)).insert_axis(Axis(0)),
            input_t.dot(&grad_v),
            grad_v.sum_axis(Axis(0)).insert_axis(Axis(0)),
            grad_w_o,
            grad_b_o,
        ];
        let grad_input = grad_q.dot(&self.w_q.t()) + grad_k.dot(&self.w_k.t()) + grad_v.dot(&self.w_v.t());

        (grad_input, grads)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        if param_grads.len() != 8 {
            return Err(ModelError::gradient_count(self.layer_type(), 8, param_grads.len()));
        }
        let params = [
            &mut self.w_q,
            &mut self.b_q,
            &mut self.w_k,
            &mut self.b_k,
            &mut self.w_v,
            &mut self.b_v,
            &mut self.w_o,
            &mut self.b_o,
        ];
        for ((param, optimizer), grad) in params.into_iter().zip(self.optimizers.iter_mut()).zip(param_grads) {
            optimizer.step(param, grad, lr);
        }
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        [&self.w_q, &self.b_q, &self.w_k, &self.b_k, &self.w_v, &self.b_v, &self.w_o, &self.b_o]
            .iter()
            .map(|p| p.len())
            .sum()
    }
}

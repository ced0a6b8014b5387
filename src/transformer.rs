use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::TaggerConfig;
use crate::dropout::{Dropout, Mode};
use crate::errors::{ModelError, Result};
use crate::feed_forward::FeedForward;
use crate::layer::Layer;
use crate::layer_norm::LayerNorm;
use crate::positional_encoding::PositionalEncoding;
use crate::self_attention::MultiHeadAttention;

const BLOCK_PARAM_GRADS: usize = 2 + 8 + 2 + 4;

/// Pre-norm transformer block:
///
/// ```text
/// x = dropout(x + attention(norm(x)))
/// y = dropout(x + feed_forward(norm(x)))
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransformerBlock {
    attention_norm: LayerNorm,
    attention: MultiHeadAttention,
    attention_dropout: Dropout,
    feed_forward_norm: LayerNorm,
    feed_forward: FeedForward,
    feed_forward_dropout: Dropout,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(
        model_dim: usize,
        num_heads: usize,
        head_dim: usize,
        keep_prob: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            attention_norm: LayerNorm::new(model_dim),
            attention: MultiHeadAttention::new(model_dim, num_heads, head_dim, rng),
            attention_dropout: Dropout::new(keep_prob),
            feed_forward_norm: LayerNorm::new(model_dim),
            feed_forward: FeedForward::new(model_dim, 4 * model_dim, rng),
            feed_forward_dropout: Dropout::new(keep_prob),
        }
    }

    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        input: &Array2<f32>,
        lengths: &[usize],
        mode: Mode,
        rng: &mut R,
    ) -> Array2<f32> {
        let normed = self.attention_norm.forward(input);
        let attended = self.attention.forward(&normed, lengths);
        let x = self.attention_dropout.forward(&(input + &attended), mode, rng);

        let normed = self.feed_forward_norm.forward(&x);
        let transformed = self.feed_forward.forward(&normed);
        self.feed_forward_dropout.forward(&(x + transformed), mode, rng)
    }

    /// Parameter gradients ordered: attention norm, attention, feed-forward norm, feed-forward.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let grad_sum = self.feed_forward_dropout.backward(output_grads);
        let (grad_normed, ff_grads) = self.feed_forward.compute_gradients(&grad_sum);
        let (grad_x, ff_norm_grads) = self.feed_forward_norm.compute_gradients(&grad_normed);
        let grad_x = grad_x + &grad_sum;

        let grad_sum = self.attention_dropout.backward(&grad_x);
        let (grad_normed, attention_grads) = self.attention.compute_gradients(&grad_sum);
        let (grad_input, attention_norm_grads) = self.attention_norm.compute_gradients(&grad_normed);
        let grad_input = grad_input + &grad_sum;

        let mut grads = Vec::with_capacity(BLOCK_PARAM_GRADS);
        grads.extend(attention_norm_grads);
        grads.extend(attention_grads);
        grads.extend(ff_norm_grads);
        grads.extend(ff_grads);
        (grad_input, grads)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        if param_grads.len() != BLOCK_PARAM_GRADS {
            return Err(ModelError::gradient_count("TransformerBlock", BLOCK_PARAM_GRADS, param_grads.len()));
        }
        self.attention_norm.apply_gradients(&param_grads[..2], lr)?;
        self.attention.apply_gradients(&param_grads[2..10], lr)?;
        self.feed_forward_norm.apply_gradients(&param_grads[10..12], lr)?;
        self.feed_forward.apply_gradients(&param_grads[12..], lr)
    }

    pub fn parameters(&self) -> usize {
        self.attention_norm.parameters()
            + self.attention.parameters()
            + self.feed_forward_norm.parameters()
            + self.feed_forward.parameters()
    }
}

/// Positional encoding, a stack of [`TransformerBlock`]s and a final layer norm.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransformerEncoder {
    positional_encoding: PositionalEncoding,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
}

impl TransformerEncoder {
    pub fn new<R: Rng + ?Sized>(config: &TaggerConfig, rng: &mut R) -> Self {
        let model_dim = config.encoder_dim();
        let blocks = (0..config.attention_depth)
            .map(|_| {
                TransformerBlock::new(
                    model_dim,
                    config.attention_heads,
                    config.attention_unit_size,
                    config.attention_keep_prob,
                    rng,
                )
            })
            .collect();
        Self {
            positional_encoding: PositionalEncoding::new(model_dim),
            blocks,
            final_norm: LayerNorm::new(model_dim),
        }
    }

    pub fn layer_type(&self) -> &str {
        "TransformerEncoder"
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// `(lengths.len() * sentence_length, model_dim)` to the same shape.
    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        input: &Array2<f32>,
        lengths: &[usize],
        sentence_length: usize,
        mode: Mode,
        rng: &mut R,
    ) -> Array2<f32> {
        let mut x = input + &self.positional_encoding.encode(lengths, sentence_length);
        for block in &mut self.blocks {
            x = block.forward(&x, lengths, mode, rng);
        }
        self.final_norm.forward(&x)
    }

    /// Parameter gradients: each block in order, then the final norm.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let (mut grads, final_norm_grads) = self.final_norm.compute_gradients(output_grads);
        let mut per_block = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter().rev() {
            let (input_grads, params) = block.compute_gradients(&grads);
            grads = input_grads;
            per_block.push(params);
        }
        let mut params: Vec<Array2<f32>> = per_block.into_iter().rev().flatten().collect();
        params.extend(final_norm_grads);
        // positional encoding is additive: its input gradient is the identity
        (grads, params)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let expected = BLOCK_PARAM_GRADS * self.blocks.len() + 2;
        if param_grads.len() != expected {
            return Err(ModelError::gradient_count(self.layer_type(), expected, param_grads.len()));
        }
        let (block_grads, norm_grads) = param_grads.split_at(expected - 2);
        for (block, grads) in self.blocks.iter_mut().zip(block_grads.chunks(BLOCK_PARAM_GRADS)) {
            block.apply_gradients(grads, lr)?;
        }
        self.final_norm.apply_gradients(norm_grads, lr)
    }

    pub fn parameters(&self) -> usize {
        self.blocks.iter().map(TransformerBlock::parameters).sum::<usize>() + self.final_norm.parameters()
    }
}

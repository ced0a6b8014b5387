//! Character-level word features: per-word convolution followed by max pooling.

use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::config::{CharEncoderKind, TaggerConfig};
use crate::dropout::{Dropout, Mode};
use crate::embeddings::{EmbeddingTable, flatten_ids};
use crate::errors::{ModelError, Result};
use crate::init;
use crate::mask;

/// Border handling of the convolution along the character axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    /// One output per character; the window is zero-padded on both sides
    Same,
    /// Only windows that fit entirely inside the word
    Valid,
}

#[derive(Clone, Debug, Default)]
struct ConvCache {
    words: usize,
    word_length: usize,
    positions: usize,
    patches: Array2<f32>,
    pooled: Array2<f32>,
    argmax: Vec<Option<usize>>,
}

/// Convolution over the character axis of every word with a kernel spanning the
/// full character dimension, ReLU, then max over positions.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConvPool {
    kernel_size: usize,
    padding: Padding,
    in_dim: usize,
    /// `(kernel_size * in_dim, filters)`
    kernel: Array2<f32>,
    bias: Array2<f32>,
    kernel_optimizer: Adam,
    bias_optimizer: Adam,
    #[serde(skip)]
    cache: Option<ConvCache>,
}

impl ConvPool {
    pub fn new(kernel_size: usize, padding: Padding, kernel: Array2<f32>, bias: Array2<f32>) -> Self {
        let in_dim = kernel.nrows() / kernel_size.max(1);
        Self {
            kernel_size,
            padding,
            in_dim,
            kernel_optimizer: Adam::new(kernel.dim()),
            bias_optimizer: Adam::new(bias.dim()),
            kernel,
            bias,
            cache: None,
        }
    }

    pub fn filters(&self) -> usize {
        self.kernel.ncols()
    }

    fn positions(&self, word_length: usize) -> usize {
        match self.padding {
            Padding::Same => word_length,
            Padding::Valid => word_length + 1 - self.kernel_size,
        }
    }

    fn offset(&self) -> isize {
        match self.padding {
            Padding::Same => ((self.kernel_size - 1) / 2) as isize,
            Padding::Valid => 0,
        }
    }

    /// Character row covered by tap `tap` of the window at `position`, if inside the word.
    fn source(&self, position: usize, tap: usize, word_length: usize) -> Option<usize> {
        let w = position as isize + tap as isize - self.offset();
        (w >= 0 && (w as usize) < word_length).then_some(w as usize)
    }

    /// `input` is `(words * word_length, in_dim)`; `pool_mask` is `(words, word_length)`
    /// and, when given, restricts the max to valid positions. Returns `(words, filters)`.
    pub fn forward(
        &mut self,
        input: &Array2<f32>,
        words: usize,
        word_length: usize,
        pool_mask: Option<&Array2<f32>>,
    ) -> Array2<f32> {
        let positions = self.positions(word_length);
        let (k, d) = (self.kernel_size, self.in_dim);

        let mut patches = Array2::<f32>::zeros((words * positions, k * d));
        for n in 0..words {
            for p in 0..positions {
                let mut patch = patches.row_mut(n * positions + p);
                for tap in 0..k {
                    if let Some(w) = self.source(p, tap, word_length) {
                        patch
                            .slice_mut(s![tap * d..(tap + 1) * d])
                            .assign(&input.row(n * word_length + w));
                    }
                }
            }
        }

        let activations = (patches.dot(&self.kernel) + &self.bias).mapv(|x| x.max(0.0));

        let filters = self.filters();
        let mut pooled = Array2::<f32>::zeros((words, filters));
        let mut argmax = vec![None; words * filters];
        for n in 0..words {
            for p in 0..positions {
                if let Some(mask) = pool_mask
                    && mask[[n, p]] == 0.0
                {
                    continue;
                }
                let row = activations.row(n * positions + p);
                for f in 0..filters {
                    let best = &mut argmax[n * filters + f];
                    if best.is_none() || row[f] > pooled[[n, f]] {
                        *best = Some(p);
                        pooled[[n, f]] = row[f];
                    }
                }
            }
        }

        self.cache = Some(ConvCache {
            words,
            word_length,
            positions,
            patches,
            pooled: pooled.clone(),
            argmax,
        });
        pooled
    }

    /// Gradient with respect to the input rows and `[kernel, bias]`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let Some(cache) = self.cache.as_ref() else {
            return (
                Array2::zeros((0, self.in_dim)),
                vec![Array2::zeros(self.kernel.dim()), Array2::zeros(self.bias.dim())],
            );
        };
        let filters = self.filters();

        // Only the winning position of each (word, filter) receives gradient, and only
        // when the ReLU was active there.
        let mut grad_activations = Array2::<f32>::zeros((cache.words * cache.positions, filters));
        for n in 0..cache.words {
            for f in 0..filters {
                if let Some(p) = cache.argmax[n * filters + f]
                    && cache.pooled[[n, f]] > 0.0
                {
                    grad_activations[[n * cache.positions + p, f]] = output_grads[[n, f]];
                }
            }
        }

        let grad_kernel = cache.patches.t().dot(&grad_activations);
        let grad_bias = grad_activations.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_patches = grad_activations.dot(&self.kernel.t());

        let d = self.in_dim;
        let mut grad_input = Array2::<f32>::zeros((cache.words * cache.word_length, d));
        for n in 0..cache.words {
            for p in 0..cache.positions {
                let patch_grad = grad_patches.row(n * cache.positions + p);
                for tap in 0..self.kernel_size {
                    if let Some(w) = self.source(p, tap, cache.word_length) {
                        let mut row = grad_input.row_mut(n * cache.word_length + w);
                        row += &patch_grad.slice(s![tap * d..(tap + 1) * d]);
                    }
                }
            }
        }

        (grad_input, vec![grad_kernel, grad_bias])
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad_kernel, grad_bias] = param_grads else {
            return Err(ModelError::gradient_count("ConvPool", 2, param_grads.len()));
        };
        self.kernel_optimizer.step(&mut self.kernel, grad_kernel, lr);
        self.bias_optimizer.step(&mut self.bias, grad_bias, lr);
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }
}

/// Turns `(batch, sentence_length, word_length)` character ids into
/// `(batch * sentence_length, feature_dim)` word features.
///
/// Padding characters are zeroed before the convolution so they cannot leak into
/// the pooled statistics of a word.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CharEncoder {
    kind: CharEncoderKind,
    table: EmbeddingTable,
    padding_id: usize,
    char_dropout: Dropout,
    convolutions: Vec<ConvPool>,
    output_dropout: Dropout,
    #[serde(skip)]
    cached_ids: Option<Vec<usize>>,
    #[serde(skip)]
    cached_mask: Option<Array2<f32>>,
}

impl CharEncoder {
    pub fn new<R: Rng + ?Sized>(config: &TaggerConfig, rng: &mut R) -> Self {
        let table = EmbeddingTable::random_uniform(config.char_vocab_size, config.char_dim, -1.0, 1.0, rng);
        let convolutions = match config.char_encoder {
            CharEncoderKind::Conv1d => {
                let size = config.filter_sizes[0];
                let kernel = init::glorot_uniform((size * config.char_dim, config.num_filters), rng);
                vec![ConvPool::new(
                    size,
                    Padding::Same,
                    kernel,
                    Array2::zeros((1, config.num_filters)),
                )]
            }
            CharEncoderKind::Conv2d => config
                .filter_sizes
                .iter()
                .map(|&size| {
                    let kernel = init::truncated_normal((size * config.char_dim, config.num_filters), 0.1, rng);
                    ConvPool::new(
                        size,
                        Padding::Valid,
                        kernel,
                        Array2::from_elem((1, config.num_filters), 0.1),
                    )
                })
                .collect(),
        };

        Self {
            kind: config.char_encoder,
            table,
            padding_id: config.char_padding_id,
            char_dropout: Dropout::new(config.keep_prob),
            convolutions,
            output_dropout: Dropout::new(config.keep_prob),
            cached_ids: None,
            cached_mask: None,
        }
    }

    pub fn layer_type(&self) -> &str {
        match self.kind {
            CharEncoderKind::Conv1d => "CharEncoderConv1d",
            CharEncoderKind::Conv2d => "CharEncoderConv2d",
        }
    }

    pub fn kind(&self) -> CharEncoderKind {
        self.kind
    }

    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    /// Replace the character table, e.g. with pretrained vectors.
    pub fn set_char_embeddings(&mut self, weights: Array2<f32>) -> Result<()> {
        let expected = self.table.weights().dim();
        if weights.dim() != expected {
            return Err(ModelError::shape(
                "char_embeddings",
                &[expected.0, expected.1],
                weights.shape(),
            ));
        }
        self.table = EmbeddingTable::trainable(weights);
        Ok(())
    }

    pub fn feature_dim(&self) -> usize {
        self.convolutions.iter().map(ConvPool::filters).sum()
    }

    pub fn forward<R: Rng + ?Sized>(&mut self, char_ids: &Array3<usize>, mode: Mode, rng: &mut R) -> Array2<f32> {
        let (batch, sentence_length, word_length) = char_ids.dim();
        let words = batch * sentence_length;

        let ids = flatten_ids(char_ids);
        let mut chars = self.table.lookup(&ids);
        if self.kind == CharEncoderKind::Conv1d {
            chars = self.char_dropout.forward(&chars, mode, rng);
        }

        let word_masks = mask::word_masks(char_ids, self.padding_id);
        let column_mask = Array2::from_shape_fn((words * word_length, 1), |(r, _)| {
            word_masks[[r / word_length, r % word_length]]
        });
        let chars = chars * &column_mask;

        let pooled = match self.kind {
            CharEncoderKind::Conv1d => {
                self.convolutions[0].forward(&chars, words, word_length, Some(&word_masks))
            }
            CharEncoderKind::Conv2d => {
                let mut pooled = Array2::<f32>::zeros((words, self.feature_dim()));
                let mut offset = 0;
                for conv in &mut self.convolutions {
                    let width = conv.filters();
                    let part = conv.forward(&chars, words, word_length, None);
                    pooled.slice_mut(s![.., offset..offset + width]).assign(&part);
                    offset += width;
                }
                pooled
            }
        };

        self.cached_ids = Some(ids);
        self.cached_mask = Some(column_mask);
        self.output_dropout.forward(&pooled, mode, rng)
    }

    /// Gradients in the order `[char_table, (kernel, bias) per convolution]`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> Vec<Array2<f32>> {
        let (Some(ids), Some(column_mask)) = (self.cached_ids.as_ref(), self.cached_mask.as_ref()) else {
            return Vec::new();
        };

        let grads = self.output_dropout.backward(output_grads);
        let mut grad_chars = Array2::<f32>::zeros((ids.len(), self.table.dim()));
        let mut conv_grads = Vec::with_capacity(2 * self.convolutions.len());
        let mut offset = 0;
        for conv in &self.convolutions {
            let width = conv.filters();
            let slice = grads.slice(s![.., offset..offset + width]).to_owned();
            let (grad_input, param_grads) = conv.compute_gradients(&slice);
            grad_chars += &grad_input;
            conv_grads.extend(param_grads);
            offset += width;
        }

        grad_chars *= column_mask;
        if self.kind == CharEncoderKind::Conv1d {
            grad_chars = self.char_dropout.backward(&grad_chars);
        }

        let mut all = Vec::with_capacity(1 + conv_grads.len());
        all.extend(self.table.gradient(ids, &grad_chars));
        all.extend(conv_grads);
        all
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let expected = 1 + 2 * self.convolutions.len();
        if param_grads.len() != expected {
            return Err(ModelError::gradient_count(self.layer_type(), expected, param_grads.len()));
        }
        self.table.apply_gradients(&param_grads[..1], lr)?;
        for (conv, grads) in self.convolutions.iter_mut().zip(param_grads[1..].chunks(2)) {
            conv.apply_gradients(grads, lr)?;
        }
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.table.parameters() + self.convolutions.iter().map(ConvPool::parameters).sum::<usize>()
    }
}

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, Result};

/// How character embeddings of one word are pooled into a word feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharEncoderKind {
    /// Convolution restricted to valid characters, then max over valid positions
    Conv1d,
    /// Masked input, one convolution per filter size spanning the full char dimension
    Conv2d,
}

/// Execution strategy for the bidirectional recurrent layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrentKind {
    /// Per-sentence, per-timestep cell evaluation
    Simple,
    /// Time-major batched evaluation with the input projection hoisted out of the loop
    Fused,
}

/// Output objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingMode {
    /// Linear-chain CRF with a learned transition matrix
    Structured,
    /// Per-token softmax cross-entropy
    Independent,
}

/// Immutable hyperparameters of a [`crate::SequenceTagger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    // Input shapes
    pub sentence_length: usize,
    pub word_length: usize,

    // Vocabularies and feature widths
    pub word_vocab_size: usize,
    pub word_dim: usize,
    pub char_vocab_size: usize,
    pub char_dim: usize,
    pub pos_vocab_size: usize,
    pub pos_dim: usize,
    pub aux_dim: usize,
    pub class_count: usize,

    /// Keep probability of every embedding and recurrent dropout
    pub keep_prob: f32,

    // Character encoder
    pub char_encoder: CharEncoderKind,
    pub filter_sizes: Vec<usize>,
    pub num_filters: usize,
    /// Character id that marks a padding position inside a word
    pub char_padding_id: usize,

    // Recurrent encoder
    pub use_recurrent: bool,
    pub recurrent_kind: RecurrentKind,
    pub recurrent_size: usize,
    pub recurrent_depth: usize,

    // Self-attention encoder
    pub use_attention: bool,
    pub attention_depth: usize,
    pub attention_heads: usize,
    pub attention_unit_size: usize,
    pub attention_keep_prob: f32,

    pub decoding_mode: DecodingMode,

    // Optimisation
    pub starter_learning_rate: f32,
    pub decay_rate: f32,
    pub decay_steps: u64,
    pub staircase: bool,
    pub clip_norm: f32,

    /// Seed for parameter initialisation and dropout; drawn from the OS when absent
    pub seed: Option<u64>,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            sentence_length: 125,
            word_length: 15,
            word_vocab_size: 1000,
            word_dim: 100,
            char_vocab_size: 100,
            char_dim: 50,
            pos_vocab_size: 50,
            pos_dim: 7,
            aux_dim: 11,
            class_count: 9,
            keep_prob: 0.5,
            char_encoder: CharEncoderKind::Conv1d,
            filter_sizes: vec![3],
            num_filters: 50,
            char_padding_id: 0,
            use_recurrent: true,
            recurrent_kind: RecurrentKind::Fused,
            recurrent_size: 200,
            recurrent_depth: 2,
            use_attention: true,
            attention_depth: 1,
            attention_heads: 4,
            attention_unit_size: 64,
            attention_keep_prob: 0.5,
            decoding_mode: DecodingMode::Structured,
            starter_learning_rate: 0.001,
            decay_rate: 0.9,
            decay_steps: 1000,
            staircase: true,
            clip_norm: 10.0,
            seed: None,
        }
    }
}

impl TaggerConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: TaggerConfig =
            serde_json::from_str(&raw).map_err(|e| ModelError::Serialization { source: Box::new(e) })?;
        config.validate()?;
        Ok(config)
    }

    /// Width of the pooled character feature of one word.
    pub fn char_feature_dim(&self) -> usize {
        match self.char_encoder {
            CharEncoderKind::Conv1d => self.num_filters,
            CharEncoderKind::Conv2d => self.num_filters * self.filter_sizes.len(),
        }
    }

    /// Width of the fused per-token feature vector.
    pub fn input_dim(&self) -> usize {
        self.word_dim + self.char_feature_dim() + self.pos_dim + self.aux_dim
    }

    /// Width of the representation entering the projection layer.
    pub fn encoder_dim(&self) -> usize {
        if self.use_recurrent {
            2 * self.recurrent_size
        } else {
            self.input_dim()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sentence_length", self.sentence_length),
            ("word_length", self.word_length),
            ("word_vocab_size", self.word_vocab_size),
            ("word_dim", self.word_dim),
            ("char_vocab_size", self.char_vocab_size),
            ("char_dim", self.char_dim),
            ("pos_vocab_size", self.pos_vocab_size),
            ("pos_dim", self.pos_dim),
            ("aux_dim", self.aux_dim),
            ("class_count", self.class_count),
            ("num_filters", self.num_filters),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }

        if self.filter_sizes.is_empty() {
            return Err(invalid("filter_sizes must not be empty".to_string()));
        }
        if let Some(&size) = self
            .filter_sizes
            .iter()
            .find(|&&size| size == 0 || size > self.word_length)
        {
            return Err(invalid(format!(
                "filter size {size} must be within 1..={}",
                self.word_length
            )));
        }
        if self.char_padding_id >= self.char_vocab_size {
            return Err(invalid(format!(
                "char_padding_id {} is outside the char vocabulary of {}",
                self.char_padding_id, self.char_vocab_size
            )));
        }

        if self.use_recurrent && (self.recurrent_size == 0 || self.recurrent_depth == 0) {
            return Err(invalid("recurrent_size and recurrent_depth must be positive".to_string()));
        }
        if self.use_attention
            && (self.attention_depth == 0 || self.attention_heads == 0 || self.attention_unit_size == 0)
        {
            return Err(invalid(
                "attention_depth, attention_heads and attention_unit_size must be positive".to_string(),
            ));
        }

        for (name, p) in [("keep_prob", self.keep_prob), ("attention_keep_prob", self.attention_keep_prob)] {
            if !(p > 0.0 && p <= 1.0) {
                return Err(invalid(format!("{name} must be in (0, 1], got {p}")));
            }
        }
        if self.decay_steps == 0 {
            return Err(invalid("decay_steps must be greater than zero".to_string()));
        }
        if !(self.starter_learning_rate > 0.0) || !(self.decay_rate > 0.0) || !(self.clip_norm > 0.0) {
            return Err(invalid(
                "starter_learning_rate, decay_rate and clip_norm must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(message: String) -> ModelError {
    ModelError::InvalidConfig { message }
}

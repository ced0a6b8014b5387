use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::mask;

/// Deterministic sinusoidal position signal, cut off at each sentence's length.
///
/// `PE[pos, i] = sin(pos / 10000^(i / dim))` for even `i` and `cos(...)` with the
/// exponent of the preceding even index for odd `i`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PositionalEncoding {
    dim: usize,
    /// Position 0 encodes to zeros
    zero_pad: bool,
    /// Multiply the signal by `sqrt(dim)`
    scale: bool,
}

impl PositionalEncoding {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            zero_pad: false,
            scale: false,
        }
    }

    pub fn with_flags(dim: usize, zero_pad: bool, scale: bool) -> Self {
        Self { dim, zero_pad, scale }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn value(&self, pos: usize, i: usize) -> f32 {
        if self.zero_pad && pos == 0 {
            return 0.0;
        }
        let exponent = (2 * (i / 2)) as f32 / self.dim as f32;
        let angle = pos as f32 / 10000f32.powf(exponent);
        let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        if self.scale {
            value * (self.dim as f32).sqrt()
        } else {
            value
        }
    }

    /// Encoding for a batch-major `(lengths.len() * sentence_length, dim)` buffer.
    /// Rows at or beyond a sentence's length are zero.
    pub fn encode(&self, lengths: &[usize], sentence_length: usize) -> Array2<f32> {
        let valid = mask::length_mask(lengths, sentence_length);
        Array2::from_shape_fn((lengths.len() * sentence_length, self.dim), |(r, i)| {
            let (b, pos) = (r / sentence_length, r % sentence_length);
            if valid[[b, pos]] > 0.0 { self.value(pos, i) } else { 0.0 }
        })
    }
}

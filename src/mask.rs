//! Valid-length and mask derivation for padded sentences and words.
//!
//! A token position is padding iff its auxiliary feature vector is all zero. A
//! character position is padding iff it carries the configured padding id.

use ndarray::{Array2, Array3, Axis};

/// `(batch, sentence_length)` mask: 1.0 where the auxiliary feature row is non-zero.
pub fn sentence_masks(aux: &Array3<f32>) -> Array2<f32> {
    nonzero_rows(aux)
}

/// Number of non-padding tokens of every sentence.
pub fn sentence_lengths(aux: &Array3<f32>) -> Vec<usize> {
    sentence_masks(aux)
        .sum_axis(Axis(1))
        .iter()
        .map(|&count| count as usize)
        .collect()
}

/// `(batch, sentence_length)` mask: 1.0 where the label vector is non-zero.
pub fn label_masks(labels: &Array3<f32>) -> Array2<f32> {
    nonzero_rows(labels)
}

/// `(batch * sentence_length, word_length)` mask: 1.0 where the character is not padding.
pub fn word_masks(char_ids: &Array3<usize>, padding_id: usize) -> Array2<f32> {
    let (batch, sentence_length, word_length) = char_ids.dim();
    Array2::from_shape_fn((batch * sentence_length, word_length), |(n, w)| {
        let id = char_ids[[n / sentence_length, n % sentence_length, w]];
        if id == padding_id { 0.0 } else { 1.0 }
    })
}

/// `(batch, max_len)` prefix mask built from lengths.
pub fn length_mask(lengths: &[usize], max_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| {
        if t < lengths[b] { 1.0 } else { 0.0 }
    })
}

fn nonzero_rows(values: &Array3<f32>) -> Array2<f32> {
    values.map_axis(Axis(2), |row| {
        let max_abs = row.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
        if max_abs > 0.0 { 1.0 } else { 0.0 }
    })
}

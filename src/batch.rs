use ndarray::{Array2, Array3};

use crate::errors::{ModelError, Result};
use crate::mask;

/// Padded input tensors for one forward pass.
///
/// All tensors share the leading `(batch, sentence_length)` axes. A token is real
/// iff its auxiliary feature vector is non-zero.
#[derive(Debug, Clone)]
pub struct Batch {
    word_ids: Array2<usize>,
    char_ids: Array3<usize>,
    pos_ids: Array2<usize>,
    aux: Array3<f32>,
    labels: Option<Array3<f32>>,
}

impl Batch {
    pub fn new(
        word_ids: Array2<usize>,
        char_ids: Array3<usize>,
        pos_ids: Array2<usize>,
        aux: Array3<f32>,
        labels: Option<Array3<f32>>,
    ) -> Result<Self> {
        let (batch, sentence_length) = word_ids.dim();
        let leading = [batch, sentence_length];

        if char_ids.shape()[..2] != leading {
            return Err(ModelError::shape(
                "char_ids",
                &[batch, sentence_length, char_ids.shape()[2]],
                char_ids.shape(),
            ));
        }
        if pos_ids.dim() != (batch, sentence_length) {
            return Err(ModelError::shape("pos_ids", &leading, pos_ids.shape()));
        }
        if aux.shape()[..2] != leading {
            return Err(ModelError::shape("aux", &[batch, sentence_length, aux.shape()[2]], aux.shape()));
        }
        if let Some(labels) = &labels
            && labels.shape()[..2] != leading
        {
            return Err(ModelError::shape(
                "labels",
                &[batch, sentence_length, labels.shape()[2]],
                labels.shape(),
            ));
        }

        Ok(Self {
            word_ids,
            char_ids,
            pos_ids,
            aux,
            labels,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.word_ids.nrows()
    }

    pub fn sentence_length(&self) -> usize {
        self.word_ids.ncols()
    }

    pub fn word_length(&self) -> usize {
        self.char_ids.shape()[2]
    }

    pub fn word_ids(&self) -> &Array2<usize> {
        &self.word_ids
    }

    pub fn char_ids(&self) -> &Array3<usize> {
        &self.char_ids
    }

    pub fn pos_ids(&self) -> &Array2<usize> {
        &self.pos_ids
    }

    pub fn aux(&self) -> &Array3<f32> {
        &self.aux
    }

    pub fn labels(&self) -> Option<&Array3<f32>> {
        self.labels.as_ref()
    }

    pub fn with_labels(mut self, labels: Array3<f32>) -> Result<Self> {
        let (batch, sentence_length) = self.word_ids.dim();
        if labels.shape()[..2] != [batch, sentence_length] {
            return Err(ModelError::shape(
                "labels",
                &[batch, sentence_length, labels.shape()[2]],
                labels.shape(),
            ));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Real-token count of every sentence, from the auxiliary features.
    pub fn sentence_lengths(&self) -> Vec<usize> {
        mask::sentence_lengths(&self.aux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_mismatched_leading_axes() {
        let result = Batch::new(
            Array2::zeros((2, 4)),
            Array3::zeros((2, 3, 5)),
            Array2::zeros((2, 4)),
            Array3::zeros((2, 4, 1)),
            None,
        );
        assert!(matches!(result, Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_lengths_from_aux() {
        let mut aux = Array3::zeros((1, 4, 2));
        aux[[0, 0, 1]] = 1.0;
        aux[[0, 1, 0]] = 0.5;
        let batch = Batch::new(Array2::zeros((1, 4)), Array3::zeros((1, 4, 3)), Array2::zeros((1, 4)), aux, None).unwrap();
        assert_eq!(batch.sentence_lengths(), vec![2]);
    }
}

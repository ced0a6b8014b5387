use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::dropout::{Dropout, Mode};
use crate::errors::{ModelError, Result};
use crate::init;

/// Whether the optimiser may update an embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trainability {
    /// Externally supplied and never updated
    Frozen,
    Trainable,
}

/// A `(vocab_size, dim)` lookup table.
///
/// Frozen tables own no optimiser state and never produce gradients, so they are
/// excluded from the trainable parameter set at the update boundary.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EmbeddingTable {
    weights: Array2<f32>,
    trainability: Trainability,
    optimizer: Option<Adam>,
}

impl EmbeddingTable {
    pub fn frozen(weights: Array2<f32>) -> Self {
        Self {
            weights,
            trainability: Trainability::Frozen,
            optimizer: None,
        }
    }

    pub fn trainable(weights: Array2<f32>) -> Self {
        let optimizer = Some(Adam::new(weights.dim()));
        Self {
            weights,
            trainability: Trainability::Trainable,
            optimizer,
        }
    }

    /// Trainable table drawn uniformly from `[low, high)`.
    pub fn random_uniform<R: Rng + ?Sized>(
        vocab_size: usize,
        dim: usize,
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> Self {
        Self::trainable(init::uniform((vocab_size, dim), low, high, rng))
    }

    pub fn trainability(&self) -> Trainability {
        self.trainability
    }

    pub fn is_trainable(&self) -> bool {
        self.trainability == Trainability::Trainable
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    /// Rows of the table for `ids`, shape `(ids.len(), dim)`.
    pub fn lookup(&self, ids: &[usize]) -> Array2<f32> {
        let mut rows = Array2::zeros((ids.len(), self.dim()));
        for (mut row, &id) in rows.rows_mut().into_iter().zip(ids) {
            row.assign(&self.weights.row(id));
        }
        rows
    }

    /// Scatter-add of `output_grads` rows into a table-shaped gradient.
    ///
    /// Returns `None` for a frozen table.
    pub fn gradient(&self, ids: &[usize], output_grads: &Array2<f32>) -> Option<Array2<f32>> {
        if !self.is_trainable() {
            return None;
        }
        let mut grads = Array2::zeros(self.weights.dim());
        for (&id, grad_row) in ids.iter().zip(output_grads.rows()) {
            let mut table_row = grads.row_mut(id);
            table_row += &grad_row;
        }
        Some(grads)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        match (&mut self.optimizer, param_grads) {
            (None, []) => Ok(()),
            (None, _) => Err(ModelError::GradientError {
                message: "frozen embedding table cannot be updated".to_string(),
            }),
            (Some(optimizer), [grads]) => {
                optimizer.step(&mut self.weights, grads, lr);
                Ok(())
            }
            (Some(_), _) => Err(ModelError::gradient_count("EmbeddingTable", 1, param_grads.len())),
        }
    }

    /// Trainable scalars; zero for a frozen table.
    pub fn parameters(&self) -> usize {
        if self.is_trainable() { self.weights.len() } else { 0 }
    }
}

/// Id lookup followed by dropout, used for word and part-of-speech features.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TokenEmbedding {
    name: String,
    table: EmbeddingTable,
    dropout: Dropout,
    #[serde(skip)]
    cached_ids: Option<Vec<usize>>,
}

impl TokenEmbedding {
    pub fn new(name: &str, table: EmbeddingTable, keep_prob: f32) -> Self {
        Self {
            name: name.to_string(),
            table,
            dropout: Dropout::new(keep_prob),
            cached_ids: None,
        }
    }

    pub fn layer_type(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    /// `(batch, sentence_length)` ids to `(batch * sentence_length, dim)` vectors.
    pub fn forward<R: Rng + ?Sized>(&mut self, ids: &Array2<usize>, mode: Mode, rng: &mut R) -> Array2<f32> {
        let flat: Vec<usize> = ids.iter().copied().collect();
        let embedded = self.table.lookup(&flat);
        self.cached_ids = Some(flat);
        self.dropout.forward(&embedded, mode, rng)
    }

    /// Parameter gradients only: ids carry no gradient.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> Vec<Array2<f32>> {
        let Some(ids) = self.cached_ids.as_ref() else {
            return Vec::new();
        };
        let grads = self.dropout.backward(output_grads);
        self.table.gradient(ids, &grads).into_iter().collect()
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        self.table.apply_gradients(param_grads, lr)
    }

    pub fn parameters(&self) -> usize {
        self.table.parameters()
    }
}

/// Flatten `(batch, sentence_length, word_length)` ids in row-major order.
pub(crate) fn flatten_ids(ids: &Array3<usize>) -> Vec<usize> {
    ids.iter().copied().collect()
}

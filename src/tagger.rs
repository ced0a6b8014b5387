use std::fs;

use ndarray::{Array2, Array3, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::batch::Batch;
use crate::char_encoder::CharEncoder;
use crate::config::{CharEncoderKind, RecurrentKind, TaggerConfig};
use crate::dropout::Mode;
use crate::embeddings::{EmbeddingTable, TokenEmbedding};
use crate::errors::{ModelError, Result};
use crate::gradient_clipping::{GlobalNormClipping, GradientClipping};
use crate::layer::Layer;
use crate::learning_rate::ExponentialDecay;
use crate::objective::{self, Objective};
use crate::output_projection::OutputProjection;
use crate::recurrent::RecurrentEncoder;
use crate::transformer::TransformerEncoder;

fn fresh_rng() -> StdRng {
    StdRng::from_rng(&mut rand::rng())
}

/// Column-wise concatenation of equally tall matrices.
fn concat_columns(parts: &[&Array2<f32>]) -> Array2<f32> {
    let rows = parts.first().map_or(0, |p| p.nrows());
    let width = parts.iter().map(|p| p.ncols()).sum();
    let mut out = Array2::zeros((rows, width));
    let mut offset = 0;
    for part in parts {
        out.slice_mut(s![.., offset..offset + part.ncols()]).assign(*part);
        offset += part.ncols();
    }
    out
}

fn column_block(x: &Array2<f32>, offset: usize, width: usize) -> Array2<f32> {
    x.slice(s![.., offset..offset + width]).to_owned()
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `(batch, sentence_length, class_count)`
    pub logits: Array3<f32>,
    /// Per-token argmax of the logits, `(batch, sentence_length)`
    pub predictions: Array2<usize>,
    pub sentence_lengths: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// What one optimiser application did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub loss: f32,
    pub accuracy: f32,
    pub learning_rate: f32,
    /// Global gradient norm before clipping
    pub global_norm: f32,
    /// Global step after the update
    pub global_step: u64,
}

/// Step counter, schedule and clipping shared by every parameter update.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainingState {
    pub global_step: u64,
    pub schedule: ExponentialDecay,
    pub clipping: GlobalNormClipping,
}

struct Encoded {
    logits: Array2<f32>,
    lengths: Vec<usize>,
}

/// Word, character and part-of-speech features fused with auxiliary features,
/// contextualised by an optional BiLSTM stack and an optional transformer
/// encoder, projected to per-token class logits.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SequenceTagger {
    config: TaggerConfig,
    word_embedding: TokenEmbedding,
    char_encoder: CharEncoder,
    pos_embedding: TokenEmbedding,
    recurrent: Option<RecurrentEncoder>,
    transformer: Option<TransformerEncoder>,
    projection: OutputProjection,
    objective: Objective,
    training: TrainingState,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl SequenceTagger {
    /// Build a tagger around an externally supplied, frozen word table of shape
    /// `(word_vocab_size, word_dim)`.
    #[instrument(skip(config, word_embeddings), fields(word_table = ?word_embeddings.dim()))]
    pub fn new(config: TaggerConfig, word_embeddings: Array2<f32>) -> Result<Self> {
        config.validate()?;
        let expected = (config.word_vocab_size, config.word_dim);
        if word_embeddings.dim() != expected {
            return Err(ModelError::shape(
                "word_embeddings",
                &[expected.0, expected.1],
                word_embeddings.shape(),
            ));
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => fresh_rng(),
        };

        let word_embedding = TokenEmbedding::new("WordEmbedding", EmbeddingTable::frozen(word_embeddings), config.keep_prob);
        let char_encoder = CharEncoder::new(&config, &mut rng);
        let pos_table = EmbeddingTable::random_uniform(config.pos_vocab_size, config.pos_dim, -0.5, 0.5, &mut rng);
        let pos_embedding = TokenEmbedding::new("PosEmbedding", pos_table, config.keep_prob);
        let recurrent = config.use_recurrent.then(|| RecurrentEncoder::new(&config, &mut rng));
        let transformer = config.use_attention.then(|| TransformerEncoder::new(&config, &mut rng));
        let projection = OutputProjection::new(config.encoder_dim(), config.class_count, &mut rng);
        let objective = Objective::new(&config, &mut rng);
        let training = TrainingState {
            global_step: 0,
            schedule: ExponentialDecay::new(
                config.starter_learning_rate,
                config.decay_rate,
                config.decay_steps,
                config.staircase,
            ),
            clipping: GlobalNormClipping::new(config.clip_norm),
        };

        let tagger = Self {
            config,
            word_embedding,
            char_encoder,
            pos_embedding,
            recurrent,
            transformer,
            projection,
            objective,
            training,
            rng,
        };
        info!(
            architecture = %tagger.architecture(),
            trainable_parameters = tagger.trainable_parameters(),
            "Sequence tagger built"
        );
        Ok(tagger)
    }

    pub fn config(&self) -> &TaggerConfig {
        &self.config
    }

    pub fn global_step(&self) -> u64 {
        self.training.global_step
    }

    pub fn learning_rate(&self) -> f32 {
        self.training.schedule.learning_rate(self.training.global_step)
    }

    /// Transition scores of the structured objective; `None` in independent mode.
    pub fn transition_params(&self) -> Option<&Array2<f32>> {
        self.objective.transition_params()
    }

    /// The frozen word table supplied at construction.
    pub fn word_embeddings(&self) -> &Array2<f32> {
        self.word_embedding.table().weights()
    }

    /// Re-seed dropout sampling.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Switch the recurrent execution strategy; weights are shared by both.
    pub fn set_recurrent_kind(&mut self, kind: RecurrentKind) {
        self.config.recurrent_kind = kind;
        if let Some(recurrent) = &mut self.recurrent {
            recurrent.set_kind(kind);
        }
    }

    /// Replace the randomly initialised character table.
    pub fn set_char_embeddings(&mut self, weights: Array2<f32>) -> Result<()> {
        self.char_encoder.set_char_embeddings(weights)
    }

    /// Layer names in forward order.
    pub fn architecture(&self) -> String {
        let mut layers = vec![
            self.word_embedding.layer_type(),
            self.char_encoder.layer_type(),
            self.pos_embedding.layer_type(),
        ];
        if let Some(recurrent) = &self.recurrent {
            layers.push(recurrent.layer_type());
        }
        if let Some(transformer) = &self.transformer {
            layers.push(transformer.layer_type());
        }
        layers.push(self.projection.layer_type());
        layers.push(match self.objective {
            Objective::Structured(_) => "LinearChainCrf",
            Objective::Independent => "SoftmaxCrossEntropy",
        });
        layers.join(" -> ")
    }

    /// Scalars updated by the optimiser; the frozen word table is excluded.
    pub fn trainable_parameters(&self) -> usize {
        self.word_embedding.parameters()
            + self.char_encoder.parameters()
            + self.pos_embedding.parameters()
            + self.recurrent.as_ref().map_or(0, RecurrentEncoder::parameters)
            + self.transformer.as_ref().map_or(0, TransformerEncoder::parameters)
            + self.projection.parameters()
            + self.objective.parameters()
    }

    /// All scalars including frozen tables.
    pub fn total_parameters(&self) -> usize {
        let word_table = self.word_embedding.table();
        let frozen = if word_table.is_trainable() { 0 } else { word_table.weights().len() };
        self.trainable_parameters() + frozen
    }

    fn validate_batch(&self, batch: &Batch) -> Result<()> {
        let config = &self.config;
        let out_of_range = |name: &str, max: Option<usize>, vocab: usize| -> Result<()> {
            match max {
                Some(id) if id >= vocab => Err(ModelError::InvalidInput {
                    message: format!("{name} id {id} is outside a vocabulary of {vocab}"),
                }),
                _ => Ok(()),
            }
        };
        out_of_range("word", batch.word_ids().iter().copied().max(), config.word_vocab_size)?;
        out_of_range("char", batch.char_ids().iter().copied().max(), config.char_vocab_size)?;
        out_of_range("pos", batch.pos_ids().iter().copied().max(), config.pos_vocab_size)?;

        let aux_dim = batch.aux().shape()[2];
        if aux_dim != config.aux_dim {
            return Err(ModelError::shape(
                "aux",
                &[batch.batch_size(), batch.sentence_length(), config.aux_dim],
                batch.aux().shape(),
            ));
        }
        if let Some(labels) = batch.labels()
            && labels.shape()[2] != config.class_count
        {
            return Err(ModelError::shape(
                "labels",
                &[batch.batch_size(), batch.sentence_length(), config.class_count],
                labels.shape(),
            ));
        }
        if config.char_encoder == CharEncoderKind::Conv2d {
            let widest = config.filter_sizes.iter().copied().max().unwrap_or(1);
            if batch.word_length() < widest {
                return Err(ModelError::InvalidInput {
                    message: format!(
                        "word length {} is shorter than the widest filter {widest}",
                        batch.word_length()
                    ),
                });
            }
        }
        Ok(())
    }

    fn encode(&mut self, batch: &Batch, mode: Mode) -> Result<Encoded> {
        self.validate_batch(batch)?;
        let (batch_size, sentence_length) = (batch.batch_size(), batch.sentence_length());
        let lengths = batch.sentence_lengths();

        let words = self.word_embedding.forward(batch.word_ids(), mode, &mut self.rng);
        let chars = self.char_encoder.forward(batch.char_ids(), mode, &mut self.rng);
        let pos = self.pos_embedding.forward(batch.pos_ids(), mode, &mut self.rng);
        let aux = batch.aux();
        let aux = Array2::from_shape_fn((batch_size * sentence_length, self.config.aux_dim), |(r, e)| {
            aux[[r / sentence_length, r % sentence_length, e]]
        });
        let mut hidden = concat_columns(&[&words, &chars, &pos, &aux]);

        if let Some(recurrent) = &mut self.recurrent {
            hidden = recurrent.forward(&hidden, &lengths, mode, &mut self.rng);
        }
        if let Some(transformer) = &mut self.transformer {
            hidden = transformer.forward(&hidden, &lengths, sentence_length, mode, &mut self.rng);
        }
        let logits = self.projection.forward(&hidden);

        Ok(Encoded { logits, lengths })
    }

    /// Logits and predictions. Dropout is active only in [`Mode::Training`].
    pub fn forward(&mut self, batch: &Batch, mode: Mode) -> Result<ForwardOutput> {
        let (batch_size, sentence_length) = (batch.batch_size(), batch.sentence_length());
        let encoded = self.encode(batch, mode)?;
        let classes = self.config.class_count;
        let logits = Array3::from_shape_fn((batch_size, sentence_length, classes), |(b, t, c)| {
            encoded.logits[[b * sentence_length + t, c]]
        });
        Ok(ForwardOutput {
            logits,
            predictions: objective::predictions(&encoded.logits, batch_size, sentence_length),
            sentence_lengths: encoded.lengths,
        })
    }

    /// Best label sequence of every sentence, truncated to its length. Uses Viterbi
    /// decoding under the structured objective and per-token argmax otherwise.
    pub fn decode(&mut self, batch: &Batch) -> Result<Vec<Vec<usize>>> {
        let encoded = self.encode(batch, Mode::Inference)?;
        Ok(self.objective.decode(&encoded.logits, &encoded.lengths))
    }

    fn labels<'a>(batch: &'a Batch) -> Result<&'a Array3<f32>> {
        batch.labels().ok_or_else(|| ModelError::InvalidInput {
            message: "batch has no labels".to_string(),
        })
    }

    /// Loss and accuracy in inference mode; parameters are untouched.
    pub fn evaluate(&mut self, batch: &Batch) -> Result<Metrics> {
        let labels = Self::labels(batch)?;
        let encoded = self.encode(batch, Mode::Inference)?;
        let loss = self.objective.loss_and_gradients(&encoded.logits, labels, &encoded.lengths).loss;
        let predictions = objective::predictions(&encoded.logits, batch.batch_size(), batch.sentence_length());
        Ok(Metrics {
            loss,
            accuracy: objective::accuracy(&predictions, labels, &encoded.lengths),
        })
    }

    /// One optimiser application: forward in training mode, backpropagate, clip
    /// every gradient by the global norm, update all trainable parameters and
    /// advance the global step by one.
    #[instrument(skip(self, batch), fields(batch_size = batch.batch_size(), step = self.training.global_step))]
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepReport> {
        let labels = Self::labels(batch)?;
        let encoded = self.encode(batch, Mode::Training)?;
        let predictions = objective::predictions(&encoded.logits, batch.batch_size(), batch.sentence_length());
        let accuracy = objective::accuracy(&predictions, labels, &encoded.lengths);
        let loss_output = self.objective.loss_and_gradients(&encoded.logits, labels, &encoded.lengths);

        let mut grads = self.backward(&loss_output.logit_grads);
        grads.push(loss_output.param_grads);
        let global_norm = self.training.clipping.clip_gradients(&mut grads);

        let learning_rate = self.learning_rate();
        self.apply_gradients(&grads, learning_rate)?;
        self.training.global_step += 1;

        debug!(
            loss = loss_output.loss,
            accuracy,
            learning_rate,
            global_norm,
            "Training step completed"
        );
        Ok(StepReport {
            loss: loss_output.loss,
            accuracy,
            learning_rate,
            global_norm,
            global_step: self.training.global_step,
        })
    }

    /// Parameter gradients grouped per owner, in the order [`Self::apply_gradients`] consumes them.
    fn backward(&self, logit_grads: &Array2<f32>) -> Vec<Vec<Array2<f32>>> {
        let (mut grads, projection_grads) = self.projection.compute_gradients(logit_grads);

        let transformer_grads = match &self.transformer {
            Some(transformer) => {
                let (input_grads, params) = transformer.compute_gradients(&grads);
                grads = input_grads;
                params
            }
            None => Vec::new(),
        };
        let recurrent_grads = match &self.recurrent {
            Some(recurrent) => {
                let (input_grads, params) = recurrent.compute_gradients(&grads);
                grads = input_grads;
                params
            }
            None => Vec::new(),
        };

        let word_dim = self.config.word_dim;
        let char_dim = self.char_encoder.feature_dim();
        let pos_dim = self.config.pos_dim;
        let word_grads = self.word_embedding.compute_gradients(&column_block(&grads, 0, word_dim));
        let char_grads = self.char_encoder.compute_gradients(&column_block(&grads, word_dim, char_dim));
        let pos_grads = self.pos_embedding.compute_gradients(&column_block(&grads, word_dim + char_dim, pos_dim));

        vec![
            word_grads,
            char_grads,
            pos_grads,
            recurrent_grads,
            transformer_grads,
            projection_grads,
        ]
    }

    fn apply_gradients(&mut self, grads: &[Vec<Array2<f32>>], lr: f32) -> Result<()> {
        let [word, chars, pos, recurrent, transformer, projection, objective] = grads else {
            return Err(ModelError::gradient_count("SequenceTagger", 7, grads.len()));
        };
        self.word_embedding.apply_gradients(word, lr)?;
        self.char_encoder.apply_gradients(chars, lr)?;
        self.pos_embedding.apply_gradients(pos, lr)?;
        if let Some(encoder) = &mut self.recurrent {
            encoder.apply_gradients(recurrent, lr)?;
        }
        if let Some(encoder) = &mut self.transformer {
            encoder.apply_gradients(transformer, lr)?;
        }
        self.projection.apply_gradients(projection, lr)?;
        self.objective.apply_gradients(objective, lr)
    }

    /// Save model to JSON format
    pub fn save_json(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ModelError::Serialization {
            source: Box::new(e),
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| ModelError::Serialization { source: Box::new(e) })
    }

    /// Save model to binary format (bincode)
    pub fn save_binary(&self, path: &str) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ModelError::Serialization { source: Box::new(e) })?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load_binary(path: &str) -> Result<Self> {
        let data = fs::read(path)?;
        let (tagger, _): (SequenceTagger, usize) =
            bincode::serde::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| ModelError::Serialization { source: Box::new(e) })?;
        Ok(tagger)
    }

    /// Save model (format from extension: `.json`, anything else is binary)
    pub fn save(&self, path: &str) -> Result<()> {
        if path.ends_with(".json") {
            self.save_json(path)
        } else {
            self.save_binary(path)
        }
    }

    pub fn load(path: &str) -> Result<Self> {
        if path.ends_with(".json") {
            Self::load_json(path)
        } else {
            Self::load_binary(path)
        }
    }
}

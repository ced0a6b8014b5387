pub mod adam;
pub mod batch;
pub mod char_encoder;
pub mod config;
pub mod conll;
pub mod crf;
pub mod dropout;
pub mod embeddings;
pub mod errors;
pub mod feed_forward;
pub mod gradient_clipping;
pub mod init;
pub mod layer;
pub mod layer_norm;
pub mod learning_rate;
pub mod mask;
pub mod model_persistence;
pub mod objective;
pub mod output_projection;
pub mod positional_encoding;
pub mod recurrent;
pub mod self_attention;
pub mod tagger;
pub mod transformer;
pub mod vocab;
// Re-export key structs for easier access
pub use adam::Adam;
pub use batch::Batch;
pub use config::{CharEncoderKind, DecodingMode, RecurrentKind, TaggerConfig};
pub use crf::LinearChainCrf;
pub use dropout::{Dropout, Mode};
pub use embeddings::{EmbeddingTable, Trainability};
pub use errors::{ModelError, Result};
pub use gradient_clipping::{GlobalNormClipping, GradientClipping};
pub use layer::Layer;
pub use learning_rate::ExponentialDecay;
pub use model_persistence::{Format, VersionedCheckpoint};
pub use objective::Objective;
pub use positional_encoding::PositionalEncoding;
pub use tagger::{ForwardOutput, Metrics, SequenceTagger, StepReport};
pub use vocab::{LabelSet, Vocab};

// Constants
pub const MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

use std::fs;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ModelError, Result};
use crate::tagger::SequenceTagger;

/// Current checkpoint format version
/// Increment this when making breaking changes to the serialization format
const CHECKPOINT_VERSION: u32 = 1;

/// Payload encoding of a checkpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Binary,
}

impl Format {
    /// `.json` paths use JSON, anything else bincode.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".json") { Format::Json } else { Format::Binary }
    }
}

fn invalid_data(message: String) -> ModelError {
    ModelError::Serialization {
        source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Versioned tagger container with integrity checking
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VersionedCheckpoint {
    pub version: u32,
    pub format: Format,
    /// SHA256 checksum of `data` (hex string)
    pub checksum: String,
    pub data: Vec<u8>,
    pub metadata: CheckpointMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointMetadata {
    /// RFC 3339 timestamp
    pub saved_at: String,
    pub architecture: String,
    pub trainable_parameters: usize,
    pub total_parameters: usize,
    pub global_step: u64,
    pub class_count: usize,
    pub description: Option<String>,
}

impl VersionedCheckpoint {
    pub fn from_tagger(tagger: &SequenceTagger, format: Format, description: Option<String>) -> Result<Self> {
        let data = match format {
            Format::Json => serde_json::to_vec(tagger).map_err(|e| ModelError::Serialization { source: Box::new(e) })?,
            Format::Binary => bincode::serde::encode_to_vec(tagger, bincode::config::standard())
                .map_err(|e| ModelError::Serialization { source: Box::new(e) })?,
        };

        let metadata = CheckpointMetadata {
            saved_at: chrono::Utc::now().to_rfc3339(),
            architecture: tagger.architecture(),
            trainable_parameters: tagger.trainable_parameters(),
            total_parameters: tagger.total_parameters(),
            global_step: tagger.global_step(),
            class_count: tagger.config().class_count,
            description,
        };

        Ok(Self {
            version: CHECKPOINT_VERSION,
            format,
            checksum: sha256_hex(&data),
            data,
            metadata,
        })
    }

    pub fn validate_checksum(&self) -> Result<()> {
        let computed = sha256_hex(&self.data);
        if computed != self.checksum {
            return Err(invalid_data(format!(
                "Checksum mismatch: expected {}, got {}",
                self.checksum, computed
            )));
        }
        Ok(())
    }

    pub fn validate_version(&self) -> Result<()> {
        if self.version > CHECKPOINT_VERSION {
            return Err(invalid_data(format!(
                "Checkpoint version {} is newer than supported version {}",
                self.version, CHECKPOINT_VERSION
            )));
        }
        if self.version < CHECKPOINT_VERSION {
            tracing::warn!(
                version = self.version,
                current = CHECKPOINT_VERSION,
                "Loading checkpoint written by an older version"
            );
        }
        Ok(())
    }

    /// Validate version and checksum, then decode the tagger.
    pub fn to_tagger(&self) -> Result<SequenceTagger> {
        self.validate_version()?;
        self.validate_checksum()?;

        match self.format {
            Format::Json => {
                serde_json::from_slice(&self.data).map_err(|e| ModelError::Serialization { source: Box::new(e) })
            }
            Format::Binary => {
                let (tagger, _): (SequenceTagger, usize) =
                    bincode::serde::decode_from_slice(&self.data, bincode::config::standard())
                        .map_err(|e| ModelError::Serialization { source: Box::new(e) })?;
                Ok(tagger)
            }
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| ModelError::Serialization { source: Box::new(e) })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| ModelError::Serialization { source: Box::new(e) })
    }
}

impl SequenceTagger {
    /// Save with versioning and integrity checking; the payload format follows the extension.
    pub fn save_versioned(&self, path: &str, description: Option<String>) -> Result<()> {
        let checkpoint = VersionedCheckpoint::from_tagger(self, Format::from_path(path), description)?;
        checkpoint.save_to_file(path)?;

        tracing::info!(
            path = path,
            version = CHECKPOINT_VERSION,
            checksum = &checkpoint.checksum[..16],
            global_step = checkpoint.metadata.global_step,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub fn load_versioned(path: &str) -> Result<Self> {
        let checkpoint = VersionedCheckpoint::load_from_file(path)?;
        tracing::info!(
            path = path,
            version = checkpoint.version,
            saved_at = %checkpoint.metadata.saved_at,
            architecture = %checkpoint.metadata.architecture,
            "Loading checkpoint"
        );
        checkpoint.to_tagger()
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Gradient computation error: {message}")]
    GradientError { message: String },
}

impl ModelError {
    pub(crate) fn shape(tensor: &str, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            tensor: tensor.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn gradient_count(layer: &str, expected: usize, got: usize) -> Self {
        ModelError::GradientError {
            message: format!("{layer} expected {expected} parameter gradients, got {got}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

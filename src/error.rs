//! Error types for the Kolosal NAS framework

use thiserror::Error;

/// Result type alias for NAS operations
pub type Result<T> = std::result::Result<T, NasError>;

/// Main error type for the NAS framework
#[derive(Error, Debug)]
pub enum NasError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Mutable `{0}` is already fixed, `fix_chosen` must not be called again")]
    MutableFixed(String),

    #[error("Mutable `{0}` has no chosen candidate, call `fix_chosen` before the fixed forward")]
    NotFixed(String),

    #[error("Unknown choice `{choice}` for mutable `{mutable}`")]
    UnknownChoice { mutable: String, choice: String },

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Mutator error: {0}")]
    MutatorError(String),

    #[error("Benchmark key not found: {0}")]
    BenchmarkKey(String),

    #[error("Malformed benchmark record for `{key}`: {reason}")]
    BenchmarkRecord { key: String, reason: String },

    #[error("Unsupported {what}: {value}")]
    Unsupported { what: String, value: String },

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NasError {
    pub(crate) fn unsupported(what: &str, value: impl Into<String>) -> Self {
        NasError::Unsupported {
            what: what.to_string(),
            value: value.into(),
        }
    }

    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        NasError::ShapeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<serde_json::Error> for NasError {
    fn from(err: serde_json::Error) -> Self {
        NasError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for NasError {
    fn from(err: ndarray::ShapeError) -> Self {
        NasError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NasError::ConfigError("empty candidate set".to_string());
        assert_eq!(err.to_string(), "Configuration error: empty candidate set");

        let err = NasError::MutableFixed("cell0.edge_0_1".to_string());
        assert!(err.to_string().contains("cell0.edge_0_1"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NasError = io_err.into();
        assert!(matches!(err, NasError::IoError(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: NasError = json_err.into();
        assert!(matches!(err, NasError::SerializationError(_)));
    }
}

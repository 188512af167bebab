//! Error types for sdconv.
//!
//! Every fallible operation in the library returns [`ConvertError`]. Variants
//! are grouped by the stage that produces them so the binary can report a
//! stable category through [`ConvertError::kind`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the conversion library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Detection errors
    #[error("Missing model configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("Field '{field}' in {path} is missing or has the wrong type")]
    MissingConfigField { path: PathBuf, field: String },

    #[error("Unknown model version: pipeline class '{class_name}' is not supported")]
    UnknownModelVersion { class_name: String },

    // Load errors
    #[error("Unsupported model file {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Corrupt model file {path}: {message}")]
    CorruptFile { path: PathBuf, message: String },

    #[error("Tensor '{tensor}' in {path} has unsupported dtype {dtype}")]
    UnsupportedDtype {
        path: PathBuf,
        tensor: String,
        dtype: String,
    },

    #[error("Incomplete shard set for {path} (found {found:?} of {total}): {reason}")]
    IncompleteShards {
        path: PathBuf,
        total: usize,
        found: Vec<usize>,
        missing: Vec<usize>,
        reason: String,
    },

    #[error("Tensor name collision: '{name}' is already registered")]
    NameCollision { name: String },

    #[error("Failed to load {sub_model}: {source}")]
    SubModel {
        sub_model: String,
        #[source]
        source: Box<ConvertError>,
    },

    #[error("Missing {sub_model}: nothing found for '{subpath}' under {root}")]
    MissingSubModel {
        sub_model: String,
        root: PathBuf,
        subpath: String,
    },

    // Quantization errors
    #[error("Cannot convert tensor data from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },

    #[error("Invalid tensor data: {message}")]
    InvalidTensorData { message: String },

    // Write errors
    #[error("Failed to write {path}: {message}")]
    Write {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Parameter errors
    #[error("Invalid value for {field}: {message}")]
    InvalidParameter { field: String, message: String },
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Coarse error category, used by callers that only need the stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Detection,
    Load,
    Write,
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<zip::result::ZipError> for ConvertError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => ConvertError::from(io),
            other => ConvertError::Io {
                message: format!("zip archive error: {other}"),
                path: None,
                source: None,
            },
        }
    }
}

impl ConvertError {
    /// Create an IO error with a short description of what was being done.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ConvertError::Io {
            message: format!("{context}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a corrupt-file error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ConvertError::CorruptFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Wrap a failure so the message names the sub-model being loaded.
    pub fn in_sub_model(self, sub_model: &str) -> Self {
        ConvertError::SubModel {
            sub_model: sub_model.to_string(),
            source: Box::new(self),
        }
    }

    /// The stage this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::MissingConfig { .. }
            | ConvertError::MissingConfigField { .. }
            | ConvertError::UnknownModelVersion { .. } => ErrorKind::Detection,

            ConvertError::Write { .. } => ErrorKind::Write,

            ConvertError::InvalidParameter { .. } => ErrorKind::Usage,

            ConvertError::SubModel { source, .. } => source.kind(),

            // Everything else surfaces while reading or converting sources
            _ => ErrorKind::Load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConvertError::UnknownModelVersion {
            class_name: "KandinskyPipeline".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown model version: pipeline class 'KandinskyPipeline' is not supported"
        );
    }

    #[test]
    fn test_sub_model_wrapping_names_component() {
        let err = ConvertError::FileNotFound(PathBuf::from("/m/vae.safetensors")).in_sub_model("vae");
        let message = err.to_string();
        assert!(message.starts_with("Failed to load vae"));
        assert!(message.contains("vae.safetensors"));
        assert_eq!(err.kind(), ErrorKind::Load);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ConvertError::MissingConfig {
                path: PathBuf::from("model_index.json")
            }
            .kind(),
            ErrorKind::Detection
        );
        assert_eq!(
            ConvertError::Write {
                path: PathBuf::from("out.gguf"),
                message: "disk full".into(),
                source: None,
            }
            .kind(),
            ErrorKind::Write
        );
        assert_eq!(
            ConvertError::NameCollision { name: "te.a".into() }.kind(),
            ErrorKind::Load
        );
    }

    #[test]
    fn test_io_error_carries_path() {
        let err = ConvertError::io(
            "opening shard",
            "/models/a.safetensors",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        match err {
            ConvertError::Io { path, message, .. } => {
                assert_eq!(path, Some(PathBuf::from("/models/a.safetensors")));
                assert!(message.contains("opening shard"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

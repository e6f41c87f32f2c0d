//! Custom error types for latentbatch.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the latentbatch library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A decoded tensor contained NaN values.
    #[error("NaN values detected in {stage} output")]
    NanDetected { stage: &'static str },

    /// An external collaborator (model, sampler, restorer...) failed.
    #[error("{stage} failed: {message}")]
    Backend { stage: &'static str, message: String },

    /// Failed to load an ONNX model.
    #[cfg(feature = "onnx")]
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// Model inference failed.
    #[cfg(feature = "onnx")]
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Options or result (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    /// Shorthand for [`Error::InvalidParameter`].
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::Backend`].
    pub fn backend(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            stage,
            message: message.into(),
        }
    }
}

/// Result type alias for latentbatch operations.
pub type Result<T> = std::result::Result<T, Error>;

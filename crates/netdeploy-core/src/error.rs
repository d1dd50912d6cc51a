//! Error types for the netdeploy-core library.

use thiserror::Error;

/// Main error type for the netdeploy library.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Error from a backend wrapper or the engine behind it.
    #[error("backend error: {0}")]
    Backend(#[from] netdeploy_backend::BackendError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Model outputs could not be turned into results.
    #[error("post-processing error: {0}")]
    Postprocess(String),

    /// Image processing error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the netdeploy library.
pub type Result<T> = std::result::Result<T, DeployError>;

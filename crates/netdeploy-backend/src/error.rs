//! Error types for the backend layer.

use thiserror::Error;

/// Errors reported by the param/bin inference engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The structural description could not be parsed.
    #[error("param line {line}: {reason}")]
    Param { line: usize, reason: String },

    /// The weight file does not match the structure.
    #[error("model weights: {0}")]
    Weights(String),

    /// A layer type is not known to the layer registry.
    #[error("layer type '{0}' is not registered")]
    UnknownLayer(String),

    /// The network has no blob with this name.
    #[error("blob '{0}' not found")]
    BlobNotFound(String),

    /// An input blob was required but never bound on the extractor.
    #[error("input blob '{0}' was not provided")]
    InputNotSet(String),

    /// A layer failed while loading or running.
    #[error("layer '{layer}': {reason}")]
    Layer { layer: String, reason: String },

    /// The network is in the wrong lifecycle state for this call.
    #[error("invalid network state: {0}")]
    State(String),

    /// I/O error when reading model files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn layer(layer: &str, reason: impl Into<String>) -> Self {
        EngineError::Layer {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while constructing or running a backend wrapper.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Failed to load the model artifacts.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The wrapper could not be configured, e.g. output names are unknown.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied inputs broke a documented precondition.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A tensor could not be converted for or bound to the engine.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine failed to produce a requested output.
    #[error("failed to extract output '{name}': {source}")]
    Extraction {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Inference execution failed in a natively batched backend.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// I/O error when loading model files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for BackendError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Io(e) => BackendError::Io(e),
            other => BackendError::ModelLoad(other.to_string()),
        }
    }
}

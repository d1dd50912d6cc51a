//! Backend execution wrappers for netdeploy.
//!
//! This crate loads exported networks and runs batched tensors through them
//! behind one calling convention, [`BackendWrapper`]:
//! - [`NcnnWrapper`] drives the built-in param/bin [`engine`], which executes
//!   a single sample per extractor, and emulates batching on top of it
//! - `OrtWrapper` (feature `onnxruntime`) and `TractWrapper` (feature
//!   `tract`) run single-file ONNX models

mod backend;
pub mod engine;
mod error;
mod tensor;
mod timer;
mod wrapper;

pub use error::{BackendError, EngineError};
pub use tensor::{Device, Tensor, TensorData, TensorMap, TensorType};
pub use timer::{TimeCounter, TimingSummary};
pub use wrapper::{
    resolve_output_names, validate_inputs, BackendKind, BackendWrapper, NcnnWrapper,
    NcnnWrapperBuilder, NCNN_EXECUTE, ONNX_FILE_COUNT,
};

#[cfg(feature = "onnxruntime")]
pub use backend::ort::OrtWrapper;

#[cfg(feature = "tract")]
pub use backend::tract::TractWrapper;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

//! Optional single-file ONNX backends.
//!
//! Both share the validation and output-name rules of the param/bin wrapper
//! but batch natively, so a call is usually one engine run.

#[cfg(feature = "onnxruntime")]
pub mod ort;

#[cfg(feature = "tract")]
pub mod tract;

//! netdeploy-core: deploy-time pipeline around the backend wrappers.
//!
//! This crate provides:
//! - JSON deploy configuration ([`DeployConfig`])
//! - A registry that builds the configured [`BackendWrapper`]
//! - Image preprocessing into batched tensors
//! - Detection post-processing (anchors, box decoding, multi-class NMS)
//! - Super-resolution output decoding

pub mod backend;
pub mod config;
pub mod detection;
pub mod error;
pub mod preprocess;
pub mod restoration;

pub use backend::{backend_file_count, create_wrapper};
pub use config::{DeployConfig, Task};
pub use detection::{Detection, Detector};
pub use error::{DeployError, Result};
pub use preprocess::{ImageMeta, ImagePreprocessor};
pub use restoration::tensor_to_images;

pub use netdeploy_backend::{BackendKind, BackendWrapper, Tensor, TensorMap};

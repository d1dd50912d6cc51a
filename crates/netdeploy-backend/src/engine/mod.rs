//! Inference engine for the two-file param/bin model format.
//!
//! A [`Net`] owns the parsed graph and weights. Each forward pass goes
//! through a short-lived [`NetExtractor`] that handles exactly one sample;
//! the engine has no batch dimension of its own.

mod custom;
mod layer;
pub mod layers;
mod mat;
mod model_bin;
mod net;
mod param;

pub use custom::{CustomLayerRegistrar, DeployOps, Gather, Shape};
pub use layer::{Layer, LayerCreator, LayerRegistry};
pub use mat::Mat;
pub use model_bin::{ModelBin, WeightEncoding, TAG_FLOAT16, TAG_FLOAT32};
pub use net::{LayerInfo, Net, NetExtractor};
pub use param::{LayerDecl, NetParam, ParamDict, ParamValue, PARAM_MAGIC};

use crate::error::EngineError;

/// A loaded network that hands out single-sample extractors.
///
/// Implementations must allow concurrent `create_extractor` calls; the
/// parallel wrapper mode relies on it.
pub trait Network: Send + Sync {
    type Extractor<'a>: Extractor
    where
        Self: 'a;

    fn create_extractor(&self) -> Result<Self::Extractor<'_>, EngineError>;

    /// Output names the network declares, if it can report them.
    fn output_names(&self) -> Option<Vec<String>> {
        None
    }
}

/// Binds inputs and extracts named outputs for one sample.
pub trait Extractor {
    fn input(&mut self, name: &str, mat: Mat) -> Result<(), EngineError>;

    fn extract(&mut self, name: &str) -> Result<Mat, EngineError>;
}

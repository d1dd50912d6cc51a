//! Layer abstraction and the type-name registry used while parsing.

use std::collections::HashMap;

use crate::error::EngineError;

use super::layers;
use super::mat::Mat;
use super::model_bin::ModelBin;
use super::param::ParamDict;

/// A computation node of the network.
///
/// Layers are configured once while the network loads and are then shared
/// read-only by every extractor.
pub trait Layer: Send + Sync {
    /// Read scalar and array parameters from the layer's param line.
    fn load_param(&mut self, _params: &ParamDict) -> Result<(), EngineError> {
        Ok(())
    }

    /// Read weights from the model stream.
    fn load_model(&mut self, _weights: &mut ModelBin<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Compute `top_count` top blobs from bottom blobs.
    fn forward(&self, bottoms: &[&Mat], top_count: usize) -> Result<Vec<Mat>, EngineError>;
}

/// Factory for a layer type.
pub type LayerCreator = fn() -> Box<dyn Layer>;

/// Maps layer type names to their factories.
#[derive(Clone)]
pub struct LayerRegistry {
    creators: HashMap<String, LayerCreator>,
}

impl LayerRegistry {
    /// A registry with no layer types.
    pub fn empty() -> Self {
        Self {
            creators: HashMap::new(),
        }
    }

    /// A registry holding every built-in layer type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        layers::register_builtins(&mut registry);
        registry
    }

    /// Add or replace the factory for `layer_type`.
    pub fn register(&mut self, layer_type: &str, creator: LayerCreator) -> Option<LayerCreator> {
        self.creators.insert(layer_type.to_string(), creator)
    }

    pub fn contains(&self, layer_type: &str) -> bool {
        self.creators.contains_key(layer_type)
    }

    /// Instantiate a layer of `layer_type`.
    pub fn create(&self, layer_type: &str) -> Result<Box<dyn Layer>, EngineError> {
        self.creators
            .get(layer_type)
            .map(|create| create())
            .ok_or_else(|| EngineError::UnknownLayer(layer_type.to_string()))
    }

    /// Registered type names, sorted.
    pub fn layer_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.creators.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("layer_types", &self.layer_types())
            .finish()
    }
}

/// Fetch the single bottom of a one-input layer.
pub(crate) fn single_bottom<'m>(bottoms: &[&'m Mat], layer: &str) -> Result<&'m Mat, EngineError> {
    match bottoms {
        [bottom] => Ok(*bottom),
        _ => Err(EngineError::layer(
            layer,
            format!("expects 1 bottom blob, got {}", bottoms.len()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    impl Layer for Constant {
        fn forward(&self, _bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
            Ok(vec![Mat::from_vec(vec![42.0])])
        }
    }

    fn create_constant() -> Box<dyn Layer> {
        Box::new(Constant)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = LayerRegistry::with_builtins();
        for ty in ["Input", "Convolution", "ReLU", "Softmax", "Interp", "Split"] {
            assert!(registry.contains(ty), "missing {}", ty);
        }
        assert!(matches!(
            registry.create("NoSuchLayer"),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn test_register_overrides() {
        let mut registry = LayerRegistry::with_builtins();
        assert!(registry.register("ReLU", create_constant).is_some());
        assert!(registry.register("Constant", create_constant).is_none());

        let layer = registry.create("ReLU").unwrap();
        let out = layer.forward(&[], 1).unwrap();
        assert_eq!(out[0].to_vec(), vec![42.0]);
    }
}

//! The loaded network graph and its per-sample extractor.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::EngineError;

use super::layer::{Layer, LayerCreator, LayerRegistry};
use super::mat::Mat;
use super::model_bin::ModelBin;
use super::param::NetParam;
use super::{Extractor, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetState {
    Empty,
    ParamLoaded,
    Ready,
}

struct LayerNode {
    layer_type: String,
    name: String,
    bottoms: Vec<usize>,
    tops: Vec<usize>,
    layer: Box<dyn Layer>,
}

struct Blob {
    name: String,
    producer: usize,
    consumer: Option<usize>,
}

/// Read-only summary of one layer, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo<'a> {
    pub layer_type: &'a str,
    pub name: &'a str,
    pub bottoms: Vec<&'a str>,
    pub tops: Vec<&'a str>,
}

/// A network loaded from a param/bin pair.
///
/// Custom layer types must be registered before [`Net::load_param`]; once
/// the structure is parsed the graph is fixed and only weights may follow.
/// After [`Net::load_model`] the network is immutable and any number of
/// extractors may be created from it, including from several threads.
pub struct Net {
    registry: LayerRegistry,
    layers: Vec<LayerNode>,
    blobs: Vec<Blob>,
    blob_index: HashMap<String, usize>,
    state: NetState,
}

impl Net {
    pub fn new() -> Self {
        Self {
            registry: LayerRegistry::with_builtins(),
            layers: Vec::new(),
            blobs: Vec::new(),
            blob_index: HashMap::new(),
            state: NetState::Empty,
        }
    }

    /// Load both artifacts with the built-in layer set.
    pub fn load(param_path: impl AsRef<Path>, bin_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let mut net = Self::new();
        net.load_param(param_path)?;
        net.load_model(bin_path)?;
        Ok(net)
    }

    /// Add or replace a layer type. Only allowed before the structure is loaded.
    pub fn register_custom_layer(
        &mut self,
        layer_type: &str,
        creator: LayerCreator,
    ) -> Result<(), EngineError> {
        if self.state != NetState::Empty {
            return Err(EngineError::State(format!(
                "cannot register layer type '{}' after the param file is loaded",
                layer_type
            )));
        }
        if self.registry.register(layer_type, creator).is_some() {
            debug!("Custom layer '{}' overrides a registered type", layer_type);
        }
        Ok(())
    }

    pub fn load_param(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        debug!("Loading param file: {:?}", path);
        let text = std::fs::read_to_string(path)?;
        self.load_param_str(&text)
    }

    /// Build the graph from param text.
    pub fn load_param_str(&mut self, text: &str) -> Result<(), EngineError> {
        if self.state != NetState::Empty {
            return Err(EngineError::State("param file already loaded".to_string()));
        }
        let parsed = NetParam::parse(text)?;

        let mut layers = Vec::with_capacity(parsed.layers.len());
        let mut blobs: Vec<Blob> = Vec::with_capacity(parsed.blob_count);
        let mut blob_index: HashMap<String, usize> = HashMap::with_capacity(parsed.blob_count);

        for (layer_idx, decl) in parsed.layers.iter().enumerate() {
            let line_err = |reason: String| EngineError::Param {
                line: decl.line,
                reason,
            };

            let mut layer = self.registry.create(&decl.layer_type)?;
            layer
                .load_param(&decl.params)
                .map_err(|e| line_err(e.to_string()))?;

            let mut bottoms = Vec::with_capacity(decl.bottoms.len());
            for name in &decl.bottoms {
                let idx = *blob_index.get(name).ok_or_else(|| {
                    line_err(format!("bottom blob '{}' is not produced by an earlier layer", name))
                })?;
                let blob = &mut blobs[idx];
                if let Some(other) = blob.consumer {
                    return Err(line_err(format!(
                        "blob '{}' is already consumed by layer '{}'",
                        name, parsed.layers[other].name
                    )));
                }
                blob.consumer = Some(layer_idx);
                bottoms.push(idx);
            }

            let mut tops = Vec::with_capacity(decl.tops.len());
            for name in &decl.tops {
                if blob_index.contains_key(name) {
                    return Err(line_err(format!("blob '{}' is produced twice", name)));
                }
                let idx = blobs.len();
                blobs.push(Blob {
                    name: name.clone(),
                    producer: layer_idx,
                    consumer: None,
                });
                blob_index.insert(name.clone(), idx);
                tops.push(idx);
            }

            layers.push(LayerNode {
                layer_type: decl.layer_type.clone(),
                name: decl.name.clone(),
                bottoms,
                tops,
                layer,
            });
        }

        if blobs.len() != parsed.blob_count {
            return Err(EngineError::Param {
                line: 2,
                reason: format!("declared {} blobs, found {}", parsed.blob_count, blobs.len()),
            });
        }

        debug!("Parsed {} layers and {} blobs", layers.len(), blobs.len());
        self.layers = layers;
        self.blobs = blobs;
        self.blob_index = blob_index;
        self.state = NetState::ParamLoaded;
        Ok(())
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        debug!("Loading model weights: {:?}", path);
        let bytes = std::fs::read(path)?;
        self.load_model_bytes(&bytes)
    }

    /// Read every layer's weights from `bytes`, which must be consumed exactly.
    pub fn load_model_bytes(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        match self.state {
            NetState::ParamLoaded => {}
            NetState::Empty => {
                return Err(EngineError::State(
                    "param file must be loaded before weights".to_string(),
                ));
            }
            NetState::Ready => {
                return Err(EngineError::State("weights already loaded".to_string()));
            }
        }

        let mut weights = ModelBin::new(bytes);
        for node in &mut self.layers {
            node.layer
                .load_model(&mut weights)
                .map_err(|e| EngineError::Weights(format!("layer '{}': {}", node.name, e)))?;
        }
        if weights.remaining() != 0 {
            return Err(EngineError::Weights(format!(
                "{} trailing bytes after the last layer",
                weights.remaining()
            )));
        }

        self.state = NetState::Ready;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state == NetState::Ready
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Tops of `Input` layers, in layer order.
    pub fn input_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter(|node| node.layer_type == "Input")
            .flat_map(|node| node.tops.iter().map(|&b| self.blobs[b].name.clone()))
            .collect()
    }

    /// Blobs no layer consumes, in creation order.
    pub fn output_names(&self) -> Vec<String> {
        self.blobs
            .iter()
            .filter(|blob| blob.consumer.is_none())
            .map(|blob| blob.name.clone())
            .collect()
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerInfo<'_>> {
        self.layers.iter().map(|node| LayerInfo {
            layer_type: &node.layer_type,
            name: &node.name,
            bottoms: node.bottoms.iter().map(|&b| self.blobs[b].name.as_str()).collect(),
            tops: node.tops.iter().map(|&b| self.blobs[b].name.as_str()).collect(),
        })
    }

    /// Start a single-sample forward pass.
    pub fn create_extractor(&self) -> Result<NetExtractor<'_>, EngineError> {
        if !self.is_ready() {
            return Err(EngineError::State(
                "network weights are not loaded".to_string(),
            ));
        }
        Ok(NetExtractor {
            net: self,
            blobs: vec![None; self.blobs.len()],
        })
    }

    fn blob(&self, name: &str) -> Result<usize, EngineError> {
        self.blob_index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::BlobNotFound(name.to_string()))
    }
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("state", &self.state)
            .field("layers", &self.layers.len())
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

impl Network for Net {
    type Extractor<'a> = NetExtractor<'a>;

    fn create_extractor(&self) -> Result<NetExtractor<'_>, EngineError> {
        Net::create_extractor(self)
    }

    fn output_names(&self) -> Option<Vec<String>> {
        Some(Net::output_names(self))
    }
}

/// Binds inputs and computes requested blobs for one sample.
///
/// Only the layers needed for a requested blob run; computed blobs are kept
/// so later extractions reuse them.
pub struct NetExtractor<'n> {
    net: &'n Net,
    blobs: Vec<Option<Mat>>,
}

impl NetExtractor<'_> {
    pub fn input(&mut self, name: &str, mat: Mat) -> Result<(), EngineError> {
        let idx = self.net.blob(name)?;
        self.blobs[idx] = Some(mat);
        Ok(())
    }

    pub fn extract(&mut self, name: &str) -> Result<Mat, EngineError> {
        let idx = self.net.blob(name)?;
        self.compute(idx)?;
        self.blobs[idx]
            .clone()
            .ok_or_else(|| EngineError::State(format!("blob '{}' was not computed", name)))
    }

    fn compute(&mut self, target: usize) -> Result<(), EngineError> {
        let net = self.net;

        // walk producers back from the target, stopping at bound blobs
        let mut needed = vec![false; net.layers.len()];
        let mut pending = vec![target];
        while let Some(blob) = pending.pop() {
            if self.blobs[blob].is_some() {
                continue;
            }
            let producer = net.blobs[blob].producer;
            let node = &net.layers[producer];
            if node.layer_type == "Input" {
                return Err(EngineError::InputNotSet(net.blobs[blob].name.clone()));
            }
            if !needed[producer] {
                needed[producer] = true;
                pending.extend(node.bottoms.iter().copied());
            }
        }

        // bottoms always come from earlier layers, so layer order is topological
        for (idx, node) in net.layers.iter().enumerate() {
            if !needed[idx] || node.tops.iter().all(|&t| self.blobs[t].is_some()) {
                continue;
            }
            let outputs = {
                let bottoms = node
                    .bottoms
                    .iter()
                    .map(|&b| {
                        self.blobs[b].as_ref().ok_or_else(|| {
                            EngineError::State(format!("blob '{}' missing", net.blobs[b].name))
                        })
                    })
                    .collect::<Result<Vec<&Mat>, _>>()?;
                node.layer
                    .forward(&bottoms, node.tops.len())
                    .map_err(|e| rename_layer_error(&node.name, e))?
            };
            if outputs.len() != node.tops.len() {
                return Err(EngineError::layer(
                    &node.name,
                    format!("produced {} blobs, expected {}", outputs.len(), node.tops.len()),
                ));
            }
            for (&top, mat) in node.tops.iter().zip(outputs) {
                self.blobs[top] = Some(mat);
            }
        }
        Ok(())
    }
}

/// Report layer failures under the layer instance name.
fn rename_layer_error(name: &str, err: EngineError) -> EngineError {
    match err {
        EngineError::Layer { layer, reason } => EngineError::Layer {
            layer: name.to_string(),
            reason: format!("{} ({})", reason, layer),
        },
        other => EngineError::layer(name, other.to_string()),
    }
}

impl Extractor for NetExtractor<'_> {
    fn input(&mut self, name: &str, mat: Mat) -> Result<(), EngineError> {
        NetExtractor::input(self, name, mat)
    }

    fn extract(&mut self, name: &str) -> Result<Mat, EngineError> {
        NetExtractor::extract(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TWO_HEADS: &str = "7767517
5 6
Input            data   0 1 data
Split            split  1 2 data data_0 data_1
ReLU             relu   1 1 data_0 scores
Dropout          scale  1 1 data_1 scaled 0=2.0
Noop             boxes  1 1 scaled boxes
";

    fn ready(text: &str) -> Net {
        let mut net = Net::new();
        net.load_param_str(text).unwrap();
        net.load_model_bytes(&[]).unwrap();
        net
    }

    #[test]
    fn test_inputs_and_outputs_in_order() {
        let net = ready(TWO_HEADS);
        assert_eq!(net.input_names(), vec!["data".to_string()]);
        assert_eq!(net.output_names(), vec!["scores".to_string(), "boxes".to_string()]);
        assert_eq!(net.layer_count(), 5);
        assert_eq!(net.blob_count(), 6);
    }

    #[test]
    fn test_extract_runs_only_needed_layers() {
        let net = ready(TWO_HEADS);
        let mut ex = net.create_extractor().unwrap();
        ex.input("data", Mat::from_vec(vec![-1.0, 2.0])).unwrap();
        assert_eq!(ex.extract("scores").unwrap().to_vec(), vec![0.0, 2.0]);
        assert_eq!(ex.extract("boxes").unwrap().to_vec(), vec![-2.0, 4.0]);
    }

    #[test]
    fn test_missing_input() {
        let net = ready(TWO_HEADS);
        let mut ex = net.create_extractor().unwrap();
        assert!(matches!(
            ex.extract("scores"),
            Err(EngineError::InputNotSet(name)) if name == "data"
        ));
        assert!(matches!(
            ex.input("nope", Mat::new_1d(1)),
            Err(EngineError::BlobNotFound(_))
        ));
    }

    #[test]
    fn test_layer_error_names_instance() {
        let text = "7767517\n2 2\nInput data 0 1 data\nSoftmax prob 1 1 data out 0=3\n";
        let net = ready(text);
        let mut ex = net.create_extractor().unwrap();
        ex.input("data", Mat::new_1d(2)).unwrap();
        let err = ex.extract("out").unwrap_err();
        assert!(matches!(&err, EngineError::Layer { layer, .. } if layer == "prob"));
    }

    #[test]
    fn test_structure_errors_name_line() {
        let consumed_twice = "7767517\n3 3\nInput data 0 1 data\nReLU a 1 1 data x\nReLU b 1 1 data y\n";
        let err = Net::new().load_param_str(consumed_twice).unwrap_err();
        assert!(matches!(err, EngineError::Param { line: 5, .. }));

        let dangling = "7767517\n1 1\nReLU a 1 1 ghost x\n";
        let err = Net::new().load_param_str(dangling).unwrap_err();
        assert!(matches!(err, EngineError::Param { line: 3, .. }));

        let unknown = "7767517\n1 1\nMystery m 0 1 x\n";
        assert!(matches!(
            Net::new().load_param_str(unknown),
            Err(EngineError::UnknownLayer(t)) if t == "Mystery"
        ));
    }

    #[test]
    fn test_lifecycle_ordering() {
        let mut net = Net::new();
        assert!(net.create_extractor().is_err());
        assert!(net.load_model_bytes(&[]).is_err());
        net.load_param_str(TWO_HEADS).unwrap();
        assert!(net
            .register_custom_layer("Late", || Box::new(super::super::layers::Noop))
            .is_err());
        assert!(net.load_model_bytes(&[0, 0, 0, 0]).is_err());
    }
}

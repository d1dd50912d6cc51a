//! Backend execution wrappers.
//!
//! Every backend is driven through [`BackendWrapper`]: a batched
//! [`TensorMap`] goes in, a batched [`TensorMap`] keyed by the resolved
//! output names comes out.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::engine::{CustomLayerRegistrar, Extractor, Mat, Net, Network};
use crate::error::BackendError;
use crate::tensor::{Tensor, TensorMap};
use crate::timer::TimeCounter;
use crate::Result;

/// Artifact count of the single-file ONNX backends.
pub const ONNX_FILE_COUNT: usize = 1;

/// Timer name for one sample's extraction step.
pub const NCNN_EXECUTE: &str = "ncnn_execute";

/// Inference backends known to the toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ncnn,
    OnnxRuntime,
    Tract,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ncnn => "ncnn",
            BackendKind::OnnxRuntime => "onnxruntime",
            BackendKind::Tract => "tract",
        }
    }

    /// Number of artifact files a deployment bundle needs for this backend.
    pub fn file_count(&self) -> usize {
        match self {
            BackendKind::Ncnn => <NcnnWrapper as BackendWrapper>::backend_file_count(),
            BackendKind::OnnxRuntime | BackendKind::Tract => ONNX_FILE_COUNT,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ncnn" => Ok(BackendKind::Ncnn),
            "onnxruntime" | "ort" => Ok(BackendKind::OnnxRuntime),
            "tract" => Ok(BackendKind::Tract),
            other => Err(BackendError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Uniform calling convention over inference backends.
pub trait BackendWrapper: Send + Sync {
    /// Run one batched inference.
    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap>;

    /// Output names requested on every call, in order.
    fn output_names(&self) -> &[String];

    fn backend(&self) -> BackendKind;

    /// Number of artifact files this backend loads.
    fn backend_file_count() -> usize
    where
        Self: Sized;
}

/// Check the batched-input contract and return the batch size.
///
/// The batch size comes from the first input. Every input must share it and
/// live on the CPU. Nothing is executed when this fails.
pub fn validate_inputs(inputs: &TensorMap) -> Result<usize> {
    let (first_name, first) = inputs
        .first()
        .ok_or_else(|| BackendError::ContractViolation("no input tensors given".to_string()))?;
    let batch_size = first.batch_size().ok_or_else(|| {
        BackendError::ContractViolation(format!("input '{}' has no batch dimension", first_name))
    })?;
    if batch_size == 0 {
        return Err(BackendError::ContractViolation(format!(
            "input '{}' has an empty batch",
            first_name
        )));
    }

    for (name, tensor) in inputs.iter() {
        match tensor.batch_size() {
            Some(n) if n == batch_size => {}
            other => {
                return Err(BackendError::ContractViolation(format!(
                    "all tensors should have the same batch size: '{}' has {:?}, '{}' has {}",
                    name, other, first_name, batch_size
                )));
            }
        }
        if !tensor.is_cpu() {
            return Err(BackendError::ContractViolation(format!(
                "input '{}' is on {}, only cpu tensors are supported",
                name,
                tensor.device()
            )));
        }
    }
    Ok(batch_size)
}

/// Every sample must fit a [`Mat`]: rank 1 to 3 once the batch axis is gone.
fn validate_sample_ranks(inputs: &TensorMap) -> Result<()> {
    for (name, tensor) in inputs.iter() {
        let rank = tensor.shape().len().saturating_sub(1);
        if !(1..=3).contains(&rank) {
            return Err(BackendError::InvalidInput(format!(
                "input '{}' has samples of rank {} (shape {:?}), expected 1 to 3",
                name,
                rank,
                tensor.shape()
            )));
        }
    }
    Ok(())
}

/// Use `explicit` verbatim, otherwise what the backend declares.
pub fn resolve_output_names(
    explicit: Option<Vec<String>>,
    declared: impl FnOnce() -> Option<Vec<String>>,
) -> Result<Vec<String>> {
    match explicit {
        Some(names) => Ok(names),
        None => declared().ok_or_else(|| {
            BackendError::Config(
                "no output names given and the network does not declare any".to_string(),
            )
        }),
    }
}

/// Wrapper around the param/bin engine.
///
/// The engine runs one sample per extractor, so a batch is split along its
/// leading axis, each sample runs through a fresh extractor, and the
/// per-sample outputs are stacked back into batched tensors.
pub struct NcnnWrapper<N: Network = Net> {
    net: N,
    output_names: Vec<String>,
    parallel: bool,
    time_counter: Arc<TimeCounter>,
}

impl NcnnWrapper<Net> {
    /// Load a network from its param and bin files.
    ///
    /// When `custom_layers` is given it registers its layer types before the
    /// param file is parsed.
    pub fn load(
        param_file: impl AsRef<Path>,
        bin_file: impl AsRef<Path>,
        output_names: Option<Vec<String>>,
        custom_layers: Option<Box<dyn CustomLayerRegistrar>>,
    ) -> Result<Self> {
        let mut builder = Self::builder(param_file, bin_file);
        builder.output_names = output_names;
        builder.custom_layers = custom_layers;
        builder.build()
    }

    pub fn builder(param_file: impl AsRef<Path>, bin_file: impl AsRef<Path>) -> NcnnWrapperBuilder {
        NcnnWrapperBuilder {
            param_file: param_file.as_ref().to_path_buf(),
            bin_file: bin_file.as_ref().to_path_buf(),
            output_names: None,
            custom_layers: None,
            parallel: false,
            time_counter: None,
        }
    }
}

impl<N: Network> NcnnWrapper<N> {
    /// Wrap an already loaded network.
    pub fn from_network(net: N, output_names: Option<Vec<String>>) -> Result<Self> {
        let output_names = resolve_output_names(output_names, || net.output_names())?;
        debug!("Resolved output names: {:?}", output_names);
        Ok(Self {
            net,
            output_names,
            parallel: false,
            time_counter: Arc::new(TimeCounter::default()),
        })
    }

    /// Run samples of a batch on the rayon pool instead of sequentially.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_time_counter(mut self, time_counter: Arc<TimeCounter>) -> Self {
        self.time_counter = time_counter;
        self
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    pub fn time_counter(&self) -> &TimeCounter {
        &self.time_counter
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Run sample `index` of every input through a fresh extractor.
    fn run_sample(&self, inputs: &TensorMap, index: usize) -> Result<Vec<Tensor>> {
        let mut extractor = self.net.create_extractor().map_err(|e| {
            BackendError::InferenceFailed(format!("cannot create extractor: {}", e))
        })?;

        for (name, tensor) in inputs.iter() {
            let mat = Mat::from_tensor(&tensor.sample(index)?.detach())?;
            extractor.input(name, mat).map_err(|e| {
                BackendError::InvalidInput(format!("cannot bind input '{}': {}", name, e))
            })?;
        }

        self.time_counter.measure(NCNN_EXECUTE, || {
            self.output_names
                .iter()
                .map(|name| {
                    extractor
                        .extract(name)
                        .map(Mat::into_tensor)
                        .map_err(|source| BackendError::Extraction {
                            name: name.clone(),
                            source,
                        })
                })
                .collect()
        })
    }
}

impl<N: Network> BackendWrapper for NcnnWrapper<N> {
    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let batch_size = validate_inputs(inputs)?;
        validate_sample_ranks(inputs)?;

        // slots[output][sample]
        let mut slots: Vec<Vec<Option<Tensor>>> =
            vec![vec![None; batch_size]; self.output_names.len()];

        if self.parallel {
            let per_sample = (0..batch_size)
                .into_par_iter()
                .map(|index| self.run_sample(inputs, index))
                .collect::<Result<Vec<_>>>()?;
            for (index, outputs) in per_sample.into_iter().enumerate() {
                for (slot, tensor) in slots.iter_mut().zip(outputs) {
                    slot[index] = Some(tensor);
                }
            }
        } else {
            for index in 0..batch_size {
                let outputs = self.run_sample(inputs, index)?;
                for (slot, tensor) in slots.iter_mut().zip(outputs) {
                    slot[index] = Some(tensor);
                }
            }
        }

        let mut outputs = TensorMap::with_capacity(self.output_names.len());
        for (name, slot) in self.output_names.iter().zip(slots) {
            let parts = slot
                .into_iter()
                .enumerate()
                .map(|(index, part)| {
                    part.ok_or_else(|| {
                        BackendError::InferenceFailed(format!(
                            "output '{}' missing for sample {}",
                            name, index
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let stacked = Tensor::stack(&parts).map_err(|e| {
                BackendError::InferenceFailed(format!("cannot batch output '{}': {}", name, e))
            })?;
            outputs.insert(name.clone(), stacked);
        }
        Ok(outputs)
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Ncnn
    }

    fn backend_file_count() -> usize {
        2
    }
}

impl<N: Network> fmt::Debug for NcnnWrapper<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NcnnWrapper")
            .field("output_names", &self.output_names)
            .field("parallel", &self.parallel)
            .finish()
    }
}

/// Configures and loads an [`NcnnWrapper`].
pub struct NcnnWrapperBuilder {
    param_file: PathBuf,
    bin_file: PathBuf,
    output_names: Option<Vec<String>>,
    custom_layers: Option<Box<dyn CustomLayerRegistrar>>,
    parallel: bool,
    time_counter: Option<Arc<TimeCounter>>,
}

impl NcnnWrapperBuilder {
    pub fn output_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn custom_layers(mut self, registrar: impl CustomLayerRegistrar + 'static) -> Self {
        self.custom_layers = Some(Box::new(registrar));
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn time_counter(mut self, time_counter: Arc<TimeCounter>) -> Self {
        self.time_counter = Some(time_counter);
        self
    }

    pub fn build(self) -> Result<NcnnWrapper<Net>> {
        let mut net = Net::new();
        if let Some(registrar) = &self.custom_layers {
            registrar
                .register_custom_layers(&mut net)
                .map_err(|e| BackendError::ModelLoad(format!("custom layers: {}", e)))?;
        }
        net.load_param(&self.param_file)
            .map_err(|e| load_error(&self.param_file, e))?;
        net.load_model(&self.bin_file)
            .map_err(|e| load_error(&self.bin_file, e))?;
        debug!(
            "Loaded {} layers from {:?} and {:?}",
            net.layer_count(),
            self.param_file,
            self.bin_file
        );

        let mut wrapper = NcnnWrapper::from_network(net, self.output_names)?.with_parallel(self.parallel);
        if let Some(time_counter) = self.time_counter {
            wrapper = wrapper.with_time_counter(time_counter);
        }
        Ok(wrapper)
    }
}

fn load_error(path: &Path, err: crate::error::EngineError) -> BackendError {
    BackendError::ModelLoad(format!("{}: {}", path.display(), err))
}

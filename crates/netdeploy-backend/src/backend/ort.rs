//! ONNX Runtime (ort) wrapper with the XNNPACK execution provider.

use std::path::Path;
use std::sync::Mutex;

use ndarray::{ArrayD, IxDyn};
use ort::ep::XNNPACK;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor as OrtTensor;
use tracing::debug;

use crate::error::BackendError;
use crate::tensor::{Tensor, TensorData, TensorMap};
use crate::wrapper::{resolve_output_names, validate_inputs, BackendKind, BackendWrapper, ONNX_FILE_COUNT};
use crate::Result;

/// Runs a single `.onnx` file through ONNX Runtime.
///
/// ONNX Runtime batches natively, so a call is one session run.
pub struct OrtWrapper {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OrtWrapper {
    pub fn load(path: impl AsRef<Path>, output_names: Option<Vec<String>>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading ONNX model from: {}", path.display());
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, output_names)
    }

    pub fn from_bytes(bytes: &[u8], output_names: Option<Vec<String>>) -> Result<Self> {
        debug!("Loading ONNX model from {} bytes", bytes.len());

        let session = Session::builder()
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .with_execution_providers([XNNPACK::default().build()])
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .commit_from_memory(bytes)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        let declared: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        let output_names = resolve_output_names(output_names, || Some(declared.clone()))?;
        if let Some(unknown) = output_names.iter().find(|n| !declared.contains(n)) {
            return Err(BackendError::Config(format!(
                "model has no output '{}' (declared: {:?})",
                unknown, declared
            )));
        }

        debug!("Model inputs: {:?}", input_names);
        debug!("Model outputs: {:?}", output_names);

        Ok(Self {
            session: Mutex::new(session),
            input_names,
            output_names,
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn convert_input(tensor: &Tensor) -> Result<SessionInputValue<'static>> {
        let shape: Vec<i64> = tensor.shape().iter().map(|&s| s as i64).collect();
        let value: ort::Result<SessionInputValue<'static>> = match tensor.data() {
            TensorData::Float32(arr) => OrtTensor::from_array((shape, arr.iter().cloned().collect::<Vec<f32>>()))
                .map(Into::into),
            TensorData::Int32(arr) => OrtTensor::from_array((shape, arr.iter().cloned().collect::<Vec<i32>>()))
                .map(Into::into),
            TensorData::Int64(arr) => OrtTensor::from_array((shape, arr.iter().cloned().collect::<Vec<i64>>()))
                .map(Into::into),
            TensorData::Uint8(arr) => OrtTensor::from_array((shape, arr.iter().cloned().collect::<Vec<u8>>()))
                .map(Into::into),
        };
        value.map_err(|e| BackendError::InvalidInput(e.to_string()))
    }
}

fn to_array<T>(shape: Vec<usize>, data: &[T]) -> Result<ArrayD<T>>
where
    T: Clone,
{
    ArrayD::from_shape_vec(IxDyn(&shape), data.to_vec())
        .map_err(|e| BackendError::InferenceFailed(e.to_string()))
}

impl BackendWrapper for OrtWrapper {
    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        validate_inputs(inputs)?;

        let ort_inputs: Vec<(&str, SessionInputValue<'static>)> = inputs
            .iter()
            .map(|(name, tensor)| Ok((name, Self::convert_input(tensor)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| BackendError::InferenceFailed(format!("Failed to lock session: {}", e)))?;

        let outputs = session
            .run(ort_inputs)
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;

        let mut results = TensorMap::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                BackendError::InferenceFailed(format!("output '{}' was not produced", name))
            })?;

            let data = if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                TensorData::Float32(to_array(shape.iter().map(|&s| s as usize).collect(), data)?)
            } else if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
                TensorData::Int64(to_array(shape.iter().map(|&s| s as usize).collect(), data)?)
            } else if let Ok((shape, data)) = value.try_extract_tensor::<i32>() {
                TensorData::Int32(to_array(shape.iter().map(|&s| s as usize).collect(), data)?)
            } else {
                return Err(BackendError::InferenceFailed(format!(
                    "unsupported output type for '{}'",
                    name
                )));
            };
            results.insert(name.clone(), Tensor::new(data));
        }

        Ok(results)
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn backend(&self) -> BackendKind {
        BackendKind::OnnxRuntime
    }

    fn backend_file_count() -> usize {
        ONNX_FILE_COUNT
    }
}

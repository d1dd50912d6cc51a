//! Tract wrapper for pure-Rust ONNX inference.

use std::path::Path;

use ndarray::ArrayD;
use tract_onnx::prelude::*;
use tracing::debug;

use crate::error::BackendError;
use crate::tensor::{Tensor as NdTensor, TensorData, TensorMap};
use crate::wrapper::{resolve_output_names, validate_inputs, BackendKind, BackendWrapper, ONNX_FILE_COUNT};
use crate::Result;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Runs a single `.onnx` file through tract.
///
/// Tract needs a concrete input shape to optimise the graph. When the plan
/// was built for a batch of one and a call carries more samples, each sample
/// runs separately and the outputs are stacked again.
pub struct TractWrapper {
    plan: Plan,
    plan_batch: usize,
    input_names: Vec<String>,
    declared_outputs: Vec<String>,
    output_names: Vec<String>,
}

impl TractWrapper {
    /// Default plan shape: one 3-channel 640x640 image.
    pub const DEFAULT_INPUT_SHAPE: [usize; 4] = [1, 3, 640, 640];

    pub fn load(
        path: impl AsRef<Path>,
        input_shape: &[usize],
        output_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading ONNX model with Tract from: {}", path.display());

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| BackendError::ModelLoad(format!("Failed to load model: {}", e)))?;
        Self::from_model(model, input_shape, output_names)
    }

    pub fn from_bytes(
        bytes: &[u8],
        input_shape: &[usize],
        output_names: Option<Vec<String>>,
    ) -> Result<Self> {
        debug!("Loading ONNX model with Tract from {} bytes", bytes.len());

        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .map_err(|e| BackendError::ModelLoad(format!("Failed to load model: {}", e)))?;
        Self::from_model(model, input_shape, output_names)
    }

    fn from_model(
        mut model: InferenceModel,
        input_shape: &[usize],
        output_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let plan_batch = input_shape.first().copied().ok_or_else(|| {
            BackendError::Config("tract input shape needs a batch dimension".to_string())
        })?;

        let input_names = model
            .input_outlets()
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .iter()
            .map(|o| model.node(o.node).name.clone())
            .collect::<Vec<_>>();
        let declared_outputs = model
            .output_outlets()
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?
            .iter()
            .map(|&o| {
                model
                    .outlet_label(o)
                    .map(str::to_string)
                    .unwrap_or_else(|| model.node(o.node).name.clone())
            })
            .collect::<Vec<_>>();

        let output_names = resolve_output_names(output_names, || Some(declared_outputs.clone()))?;
        if let Some(unknown) = output_names.iter().find(|n| !declared_outputs.contains(n)) {
            return Err(BackendError::Config(format!(
                "model has no output '{}' (declared: {:?})",
                unknown, declared_outputs
            )));
        }

        // Replace dynamic dimensions with the concrete shape
        model
            .set_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), input_shape))
            .map_err(|e| BackendError::ModelLoad(format!("Failed to set input shape: {}", e)))?;

        let plan = model
            .into_typed()
            .map_err(|e| BackendError::ModelLoad(format!("Failed to type model: {}", e)))?
            .into_optimized()
            .map_err(|e| BackendError::ModelLoad(format!("Failed to optimize: {}", e)))?
            .into_runnable()
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        debug!("Model inputs: {:?}", input_names);
        debug!("Model outputs: {:?}", declared_outputs);

        Ok(Self {
            plan,
            plan_batch,
            input_names,
            declared_outputs,
            output_names,
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Inputs in graph order, as tract takes them positionally.
    fn ordered_inputs<'a>(&self, inputs: &'a TensorMap) -> Result<Vec<&'a NdTensor>> {
        if self.input_names.len() == 1 && inputs.len() == 1 {
            return Ok(inputs.iter().map(|(_, t)| t).collect());
        }
        self.input_names
            .iter()
            .map(|name| {
                inputs.get(name).ok_or_else(|| {
                    BackendError::InvalidInput(format!("missing model input '{}'", name))
                })
            })
            .collect()
    }

    fn run(&self, inputs: TVec<TValue>) -> Result<Vec<NdTensor>> {
        let outputs = self
            .plan
            .run(inputs)
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;

        self.output_names
            .iter()
            .map(|name| {
                let idx = self
                    .declared_outputs
                    .iter()
                    .position(|d| d == name)
                    .ok_or_else(|| BackendError::Config(format!("unknown output '{}'", name)))?;
                let output = outputs.get(idx).ok_or_else(|| {
                    BackendError::InferenceFailed(format!("output '{}' was not produced", name))
                })?;
                convert_output(name, output)
            })
            .collect()
    }
}

fn convert_input(tensor: &NdTensor) -> Result<TValue> {
    let value = match tensor.data() {
        TensorData::Float32(arr) => to_tract(arr)?,
        TensorData::Int32(arr) => to_tract(arr)?,
        TensorData::Int64(arr) => to_tract(arr)?,
        TensorData::Uint8(arr) => to_tract(arr)?,
    };
    Ok(value)
}

fn to_tract<T: Datum + Clone>(arr: &ArrayD<T>) -> Result<TValue> {
    let shape: TVec<usize> = arr.shape().iter().cloned().collect();
    let data: Vec<T> = arr.iter().cloned().collect();
    let tract_tensor = tract_ndarray::ArrayD::from_shape_vec(tract_ndarray::IxDyn(shape.as_slice()), data)
        .map_err(|e| BackendError::InvalidInput(e.to_string()))?;
    Ok(tract_tensor.into_tvalue())
}

fn convert_output(name: &str, output: &TValue) -> Result<NdTensor> {
    let data = if let Ok(arr) = output.to_array_view::<f32>() {
        TensorData::Float32(from_tract(arr.shape(), arr.iter().cloned().collect())?)
    } else if let Ok(arr) = output.to_array_view::<i64>() {
        TensorData::Int64(from_tract(arr.shape(), arr.iter().cloned().collect())?)
    } else if let Ok(arr) = output.to_array_view::<i32>() {
        TensorData::Int32(from_tract(arr.shape(), arr.iter().cloned().collect())?)
    } else {
        return Err(BackendError::InferenceFailed(format!(
            "unsupported output type for '{}'",
            name
        )));
    };
    Ok(NdTensor::new(data))
}

fn from_tract<T>(shape: &[usize], data: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(ndarray::IxDyn(shape), data)
        .map_err(|e| BackendError::InferenceFailed(e.to_string()))
}

/// Re-add a leading axis of one to a single sample.
fn with_unit_batch(sample: &NdTensor) -> Result<NdTensor> {
    NdTensor::stack(std::slice::from_ref(sample))
}

impl BackendWrapper for TractWrapper {
    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let batch_size = validate_inputs(inputs)?;
        let ordered = self.ordered_inputs(inputs)?;

        let outputs = if batch_size == self.plan_batch {
            let values = ordered
                .iter()
                .map(|t| convert_input(t))
                .collect::<Result<TVec<_>>>()?;
            self.run(values)?
        } else if self.plan_batch == 1 {
            let mut per_output: Vec<Vec<NdTensor>> = vec![Vec::with_capacity(batch_size); self.output_names.len()];
            for index in 0..batch_size {
                let values = ordered
                    .iter()
                    .map(|t| convert_input(&with_unit_batch(&t.sample(index)?)?))
                    .collect::<Result<TVec<_>>>()?;
                for (parts, out) in per_output.iter_mut().zip(self.run(values)?) {
                    parts.push(out.sample(0)?);
                }
            }
            per_output
                .iter()
                .map(|parts| NdTensor::stack(parts))
                .collect::<Result<Vec<_>>>()?
        } else {
            return Err(BackendError::ContractViolation(format!(
                "plan was built for batch {}, got {}",
                self.plan_batch, batch_size
            )));
        };

        Ok(self.output_names.iter().cloned().zip(outputs).collect())
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Tract
    }

    fn backend_file_count() -> usize {
        ONNX_FILE_COUNT
    }
}

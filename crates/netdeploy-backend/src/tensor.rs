//! Tensor types shared between callers and backends.

use std::fmt;

use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::BackendError;
use crate::Result;

/// Supported tensor data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    Float32,
    Int32,
    Int64,
    Uint8,
}

/// Compute device a tensor's memory lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: u32 },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{}", device_id),
        }
    }
}

/// Typed tensor storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(ArrayD<f32>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Uint8(ArrayD<u8>),
}

impl TensorData {
    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::Float32(arr) => arr.shape(),
            TensorData::Int32(arr) => arr.shape(),
            TensorData::Int64(arr) => arr.shape(),
            TensorData::Uint8(arr) => arr.shape(),
        }
    }

    /// Get the data type of the tensor.
    pub fn dtype(&self) -> TensorType {
        match self {
            TensorData::Float32(_) => TensorType::Float32,
            TensorData::Int32(_) => TensorType::Int32,
            TensorData::Int64(_) => TensorType::Int64,
            TensorData::Uint8(_) => TensorType::Uint8,
        }
    }
}

/// A dense tensor with device placement and gradient-tracking metadata.
///
/// Batched tensors carry the batch on their leading axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    device: Device,
    requires_grad: bool,
}

impl Tensor {
    /// Wrap typed storage as a CPU tensor without gradient tracking.
    pub fn new(data: TensorData) -> Self {
        Self {
            data,
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    /// Create a Float32 tensor from raw data and shape.
    pub fn from_f32(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let arr = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| BackendError::InvalidInput(format!("shape {:?}: {}", shape, e)))?;
        Ok(arr.into())
    }

    /// Create an Int64 tensor from raw data and shape.
    pub fn from_i64(data: Vec<i64>, shape: &[usize]) -> Result<Self> {
        let arr = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| BackendError::InvalidInput(format!("shape {:?}: {}", shape, e)))?;
        Ok(arr.into())
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> TensorType {
        self.data.dtype()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_cpu(&self) -> bool {
        self.device == Device::Cpu
    }

    /// Tag the tensor as living on `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Drop gradient tracking, keeping data and placement.
    pub fn detach(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Size of the leading (batch) dimension, `None` for scalars.
    pub fn batch_size(&self) -> Option<usize> {
        self.shape().first().copied()
    }

    /// Slice out sample `index` along the leading axis.
    pub fn sample(&self, index: usize) -> Result<Tensor> {
        let batch = self.batch_size().ok_or_else(|| {
            BackendError::InvalidInput("cannot take a sample of a scalar tensor".to_string())
        })?;
        if index >= batch {
            return Err(BackendError::InvalidInput(format!(
                "sample {} out of range for batch of {}",
                index, batch
            )));
        }

        let data = match &self.data {
            TensorData::Float32(arr) => TensorData::Float32(arr.index_axis(Axis(0), index).to_owned()),
            TensorData::Int32(arr) => TensorData::Int32(arr.index_axis(Axis(0), index).to_owned()),
            TensorData::Int64(arr) => TensorData::Int64(arr.index_axis(Axis(0), index).to_owned()),
            TensorData::Uint8(arr) => TensorData::Uint8(arr.index_axis(Axis(0), index).to_owned()),
        };

        Ok(Tensor {
            data,
            device: self.device,
            requires_grad: self.requires_grad,
        })
    }

    /// Try to get the inner Float32 array.
    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match &self.data {
            TensorData::Float32(arr) => Some(arr),
            _ => None,
        }
    }

    /// Try to get the inner Int64 array.
    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match &self.data {
            TensorData::Int64(arr) => Some(arr),
            _ => None,
        }
    }

    /// Copy the values into a Float32 array, casting integer types.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match &self.data {
            TensorData::Float32(arr) => arr.clone(),
            TensorData::Int32(arr) => arr.mapv(|v| v as f32),
            TensorData::Int64(arr) => arr.mapv(|v| v as f32),
            TensorData::Uint8(arr) => arr.mapv(f32::from),
        }
    }

    /// Stack tensors of identical dtype and shape along a new leading axis.
    pub fn stack(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| BackendError::InvalidInput("cannot stack zero tensors".to_string()))?;

        if let Some(bad) = parts.iter().find(|t| t.shape() != first.shape()) {
            return Err(BackendError::InvalidInput(format!(
                "cannot stack tensors of shape {:?} and {:?}",
                first.shape(),
                bad.shape()
            )));
        }

        let data = match first.dtype() {
            TensorType::Float32 => TensorData::Float32(stack_arrays(parts, |d| match d {
                TensorData::Float32(arr) => Some(arr),
                _ => None,
            })?),
            TensorType::Int32 => TensorData::Int32(stack_arrays(parts, |d| match d {
                TensorData::Int32(arr) => Some(arr),
                _ => None,
            })?),
            TensorType::Int64 => TensorData::Int64(stack_arrays(parts, |d| match d {
                TensorData::Int64(arr) => Some(arr),
                _ => None,
            })?),
            TensorType::Uint8 => TensorData::Uint8(stack_arrays(parts, |d| match d {
                TensorData::Uint8(arr) => Some(arr),
                _ => None,
            })?),
        };

        Ok(Tensor {
            data,
            device: first.device,
            requires_grad: false,
        })
    }
}

fn stack_arrays<T, F>(parts: &[Tensor], select: F) -> Result<ArrayD<T>>
where
    T: Clone,
    F: Fn(&TensorData) -> Option<&ArrayD<T>>,
{
    let views = parts
        .iter()
        .map(|t| {
            select(&t.data).map(|arr| arr.view()).ok_or_else(|| {
                BackendError::InvalidInput(format!("cannot stack mixed dtypes ({:?})", t.dtype()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    ndarray::stack(Axis(0), &views)
        .map_err(|e| BackendError::InvalidInput(format!("cannot stack tensors: {}", e)))
}

impl From<ArrayD<f32>> for Tensor {
    fn from(arr: ArrayD<f32>) -> Self {
        Tensor::new(TensorData::Float32(arr))
    }
}

impl From<ArrayD<i32>> for Tensor {
    fn from(arr: ArrayD<i32>) -> Self {
        Tensor::new(TensorData::Int32(arr))
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(arr: ArrayD<i64>) -> Self {
        Tensor::new(TensorData::Int64(arr))
    }
}

impl From<ArrayD<u8>> for Tensor {
    fn from(arr: ArrayD<u8>) -> Self {
        Tensor::new(TensorData::Uint8(arr))
    }
}

/// Insertion-ordered mapping from tensor name to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap {
    entries: Vec<(String, Tensor)>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert a tensor, replacing (in place) any tensor with the same name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, tensor)),
            None => {
                self.entries.push((name, tensor));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first inserted entry.
    pub fn first(&self) -> Option<(&str, &Tensor)> {
        self.entries.first().map(|(n, t)| (n.as_str(), t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }
}

impl<K: Into<String>> FromIterator<(K, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (K, Tensor)>>(iter: I) -> Self {
        let mut map = TensorMap::new();
        for (name, tensor) in iter {
            map.insert(name, tensor);
        }
        map
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(shape: &[usize]) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::from_f32((0..n).map(|v| v as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_sample_slices_leading_axis() {
        let t = ramp(&[2, 3]);
        let s = t.sample(1).unwrap();
        assert_eq!(s.shape(), &[3]);
        assert_eq!(s.as_f32().unwrap().iter().cloned().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_sample_out_of_range() {
        let t = ramp(&[2, 3]);
        assert!(t.sample(2).is_err());
        let scalar = Tensor::from_f32(vec![1.0], &[]).unwrap();
        assert!(scalar.sample(0).is_err());
    }

    #[test]
    fn test_stack_restores_batch() {
        let t = ramp(&[3, 2, 2]);
        let parts: Vec<Tensor> = (0..3).map(|i| t.sample(i).unwrap()).collect();
        assert_eq!(Tensor::stack(&parts).unwrap(), t);
    }

    #[test]
    fn test_stack_rejects_mismatched_parts() {
        assert!(Tensor::stack(&[]).is_err());
        assert!(Tensor::stack(&[ramp(&[2]), ramp(&[3])]).is_err());
        let ints = Tensor::from_i64(vec![1, 2], &[2]).unwrap();
        assert!(Tensor::stack(&[ramp(&[2]), ints]).is_err());
    }

    #[test]
    fn test_detach_and_device() {
        let t = ramp(&[1]).with_requires_grad(true).to_device(Device::Cuda { device_id: 0 });
        assert!(!t.is_cpu());
        assert_eq!(t.device().to_string(), "cuda:0");
        let d = t.detach();
        assert!(!d.requires_grad());
        assert_eq!(d.device(), Device::Cuda { device_id: 0 });
    }

    #[test]
    fn test_to_f32_casts_integers() {
        let t = Tensor::from_i64(vec![1, -2], &[2]).unwrap();
        assert_eq!(t.to_f32().iter().cloned().collect::<Vec<_>>(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_tensor_map_keeps_insertion_order() {
        let mut map: TensorMap = [("b", ramp(&[1])), ("a", ramp(&[2]))].into_iter().collect();
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["b", "a"]);

        let old = map.insert("b", ramp(&[3]));
        assert!(old.is_some());
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(map.get("b").unwrap().shape(), &[3]);
        assert_eq!(map.first().map(|(n, _)| n), Some("b"));
    }
}

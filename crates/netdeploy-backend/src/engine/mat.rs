//! The engine's native single-sample buffer.

use ndarray::{Array1, ArrayD, ArrayView3, IxDyn};

use crate::error::{BackendError, EngineError};
use crate::tensor::Tensor;

/// A float32 buffer of rank 1 (`w`), 2 (`h, w`) or 3 (`c, h, w`).
#[derive(Debug, Clone, PartialEq)]
pub struct Mat {
    data: ArrayD<f32>,
}

impl Mat {
    /// Wrap an array, rejecting ranks the engine cannot represent.
    pub fn from_array(data: ArrayD<f32>) -> Result<Self, EngineError> {
        match data.ndim() {
            1..=3 if data.is_standard_layout() => Ok(Self { data }),
            1..=3 => Ok(Self {
                data: data.as_standard_layout().into_owned(),
            }),
            n => Err(EngineError::State(format!(
                "mat rank must be 1..=3, got {} (shape {:?})",
                n,
                data.shape()
            ))),
        }
    }

    pub fn new_1d(w: usize) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(&[w])),
        }
    }

    pub fn new_2d(h: usize, w: usize) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(&[h, w])),
        }
    }

    pub fn new_3d(c: usize, h: usize, w: usize) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(&[c, h, w])),
        }
    }

    /// Build a rank-1 mat from values.
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            data: Array1::from(values).into_dyn(),
        }
    }

    /// Build a mat with the same rank as `shape` from flat values.
    pub fn from_shape_vec(shape: &[usize], values: Vec<f32>) -> Result<Self, EngineError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| EngineError::State(format!("mat shape {:?}: {}", shape, e)))?;
        Self::from_array(data)
    }

    pub fn dims(&self) -> usize {
        self.data.ndim()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn w(&self) -> usize {
        self.data.shape()[self.dims() - 1]
    }

    pub fn h(&self) -> usize {
        if self.dims() >= 2 {
            self.data.shape()[self.dims() - 2]
        } else {
            1
        }
    }

    pub fn c(&self) -> usize {
        if self.dims() == 3 {
            self.data.shape()[0]
        } else {
            1
        }
    }

    /// Total number of elements.
    pub fn total(&self) -> usize {
        self.data.len()
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn into_array(self) -> ArrayD<f32> {
        self.data
    }

    /// View as `(c, h, w)`, padding missing leading axes with 1.
    pub fn chw(&self) -> Result<ArrayView3<'_, f32>, EngineError> {
        let (c, h, w) = (self.c(), self.h(), self.w());
        self.data
            .view()
            .into_shape_with_order((c, h, w))
            .map_err(|e| EngineError::State(format!("mat {:?} as (c, h, w): {}", self.shape(), e)))
    }

    /// Values in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().cloned().collect()
    }

    /// Convert a single-sample tensor into engine layout.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, BackendError> {
        let arr = tensor.to_f32().as_standard_layout().into_owned();
        Mat::from_array(arr).map_err(|e| {
            BackendError::InvalidInput(format!(
                "sample of shape {:?} cannot be bound: {}",
                tensor.shape(),
                e
            ))
        })
    }

    /// Convert back into the shared tensor representation.
    pub fn into_tensor(self) -> Tensor {
        Tensor::from(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dims_follow_rank() {
        let m = Mat::new_3d(2, 3, 4);
        assert_eq!((m.c(), m.h(), m.w(), m.dims()), (2, 3, 4, 3));
        let m = Mat::new_2d(3, 4);
        assert_eq!((m.c(), m.h(), m.w(), m.dims()), (1, 3, 4, 2));
        let m = Mat::new_1d(4);
        assert_eq!((m.c(), m.h(), m.w(), m.dims()), (1, 1, 4, 1));
        assert_eq!(m.chw().unwrap().dim(), (1, 1, 4));
    }

    #[test]
    fn test_rank_is_limited() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 1, 1]));
        assert!(Mat::from_array(arr).is_err());
        let scalar = Tensor::from_f32(vec![1.0], &[]).unwrap();
        assert!(Mat::from_tensor(&scalar).is_err());
    }

    #[test]
    fn test_tensor_round_trip_keeps_shape() {
        let t = Tensor::from_f32((0..6).map(|v| v as f32).collect(), &[1, 2, 3]).unwrap();
        let m = Mat::from_tensor(&t).unwrap();
        assert_eq!(m.shape(), &[1, 2, 3]);
        assert_eq!(m.into_tensor(), t);
    }
}

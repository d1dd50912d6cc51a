//! Built-in layer implementations.

mod activation;
mod convolution;
mod eltwise;
mod inner_product;
mod interp;
mod pooling;
mod structural;

use ndarray::{s, Array3, ArrayView3};

use crate::error::EngineError;

use super::layer::LayerRegistry;

pub use activation::{ReLU, Sigmoid, Softmax};
pub use convolution::Convolution;
pub use eltwise::Eltwise;
pub use inner_product::InnerProduct;
pub use interp::Interp;
pub use pooling::Pooling;
pub use structural::{Concat, Dropout, Flatten, Input, Noop, Split};

pub(crate) fn register_builtins(registry: &mut LayerRegistry) {
    registry.register("Input", || Box::new(Input::default()));
    registry.register("Convolution", || Box::new(Convolution::default()));
    registry.register("ConvolutionDepthWise", || Box::new(Convolution::depthwise()));
    registry.register("InnerProduct", || Box::new(InnerProduct::default()));
    registry.register("ReLU", || Box::new(ReLU::default()));
    registry.register("Sigmoid", || Box::new(Sigmoid));
    registry.register("Softmax", || Box::new(Softmax::default()));
    registry.register("Pooling", || Box::new(Pooling::default()));
    registry.register("Split", || Box::new(Split));
    registry.register("Concat", || Box::new(Concat::default()));
    registry.register("Eltwise", || Box::new(Eltwise::default()));
    registry.register("Interp", || Box::new(Interp::default()));
    registry.register("Flatten", || Box::new(Flatten));
    registry.register("Dropout", || Box::new(Dropout::default()));
    registry.register("Noop", || Box::new(Noop));
}

/// Activation fused into Convolution and InnerProduct (params 9 and 10).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum Activation {
    #[default]
    Identity,
    Relu,
    LeakyRelu(f32),
    Clip(f32, f32),
    Sigmoid,
}

impl Activation {
    pub(crate) fn from_params(layer: &str, kind: i32, params: &[f32]) -> Result<Self, EngineError> {
        let param = |i: usize| {
            params.get(i).copied().ok_or_else(|| {
                EngineError::layer(layer, format!("activation {} needs {} params", kind, i + 1))
            })
        };

        match kind {
            0 => Ok(Activation::Identity),
            1 if params.first().is_some_and(|&slope| slope != 0.0) => {
                Ok(Activation::LeakyRelu(params[0]))
            }
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::LeakyRelu(param(0)?)),
            3 => Ok(Activation::Clip(param(0)?, param(1)?)),
            4 => Ok(Activation::Sigmoid),
            other => Err(EngineError::layer(
                layer,
                format!("unsupported fused activation type {}", other),
            )),
        }
    }

    #[inline]
    pub(crate) fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu(slope) => {
                if x < 0.0 {
                    x * slope
                } else {
                    x
                }
            }
            Activation::Clip(min, max) => x.clamp(min, max),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Border widths around the spatial axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

/// Copy `x` into a larger buffer surrounded by `value`.
pub(crate) fn pad_chw(x: ArrayView3<'_, f32>, pad: Padding, value: f32) -> Array3<f32> {
    let (c, h, w) = x.dim();
    if pad == Padding::default() {
        return x.to_owned();
    }
    let mut out = Array3::from_elem(
        (c, h + pad.top + pad.bottom, w + pad.left + pad.right),
        value,
    );
    out.slice_mut(s![.., pad.top..pad.top + h, pad.left..pad.left + w])
        .assign(&x);
    out
}

/// Total padding that keeps `ceil(size / stride)` outputs.
pub(crate) fn same_padding(size: usize, kernel_extent: usize, stride: usize) -> usize {
    let covered = kernel_extent + (size.saturating_sub(1) / stride) * stride;
    covered.saturating_sub(size)
}

/// Resolve a possibly negative axis against `dims`.
pub(crate) fn resolve_axis(layer: &str, axis: i32, dims: usize) -> Result<usize, EngineError> {
    let resolved = if axis < 0 { axis + dims as i32 } else { axis };
    if (0..dims as i32).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(EngineError::layer(
            layer,
            format!("axis {} out of range for {}-dim blob", axis, dims),
        ))
    }
}

/// Read a strictly positive integer param.
pub(crate) fn positive(layer: &str, what: &str, value: i32) -> Result<usize, EngineError> {
    if value > 0 {
        Ok(value as usize)
    } else {
        Err(EngineError::layer(
            layer,
            format!("{} must be positive, got {}", what, value),
        ))
    }
}

//! Super-resolution output decoding.

use image::{Rgb, RgbImage};
use ndarray::Axis;
use netdeploy_backend::Tensor;

use crate::error::{DeployError, Result};

/// Turn an `(N, C, H, W)` output in `[0, 1]` into one image per sample.
///
/// Values are clamped before scaling to 0-255. Single-channel outputs are
/// replicated to grey RGB.
pub fn tensor_to_images(tensor: &Tensor) -> Result<Vec<RgbImage>> {
    let values = tensor.to_f32();
    let shape = values.shape();
    if shape.len() != 4 || !(shape[1] == 1 || shape[1] == 3) {
        return Err(DeployError::Postprocess(format!(
            "expected an (N, 1|3, H, W) image tensor, got {:?}",
            shape
        )));
    }
    let (channels, height, width) = (shape[1], shape[2], shape[3]);
    let (w, h) = (
        u32::try_from(width).map_err(|_| DeployError::Postprocess("image too wide".to_string()))?,
        u32::try_from(height).map_err(|_| DeployError::Postprocess("image too tall".to_string()))?,
    );

    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

    Ok(values
        .axis_iter(Axis(0))
        .map(|sample| {
            RgbImage::from_fn(w, h, |x, y| {
                let (x, y) = (x as usize, y as usize);
                let pick = |c: usize| to_u8(sample[[c.min(channels - 1), y, x]]);
                Rgb([pick(0), pick(1), pick(2)])
            })
        })
        .collect())
}

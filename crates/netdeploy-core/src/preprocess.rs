//! Image preprocessing into batched network input.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::{Array3, Array4, Axis};
use netdeploy_backend::Tensor;
use tracing::debug;

use crate::config::InputConfig;
use crate::error::{DeployError, Result};

/// Size bookkeeping for one preprocessed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    /// Width and height before resizing.
    pub original_size: (u32, u32),
    /// Resized over original, per axis `(x, y)`.
    pub scale: (f32, f32),
}

impl ImageMeta {
    /// Map a box on the network input back onto the original image.
    pub fn rescale_box(&self, bbox: [f32; 4]) -> [f32; 4] {
        let (w, h) = (self.original_size.0 as f32, self.original_size.1 as f32);
        [
            (bbox[0] / self.scale.0).clamp(0.0, w),
            (bbox[1] / self.scale.1).clamp(0.0, h),
            (bbox[2] / self.scale.0).clamp(0.0, w),
            (bbox[3] / self.scale.1).clamp(0.0, h),
        ]
    }
}

/// Resizes and normalises images into `(N, 3, H, W)` tensors.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    height: u32,
    width: u32,
    mean: [f32; 3],
    std: [f32; 3],
    to_rgb: bool,
    filter: FilterType,
}

impl ImagePreprocessor {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            height: config.height,
            width: config.width,
            mean: config.mean,
            std: config.std,
            to_rgb: config.to_rgb,
            filter: FilterType::Triangle,
        }
    }

    /// Set the resampling filter.
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// Network input size as `(height, width)`.
    pub fn input_size(&self) -> (usize, usize) {
        (self.height as usize, self.width as usize)
    }

    pub fn meta(&self, image: &DynamicImage) -> ImageMeta {
        let (orig_width, orig_height) = image.dimensions();
        ImageMeta {
            original_size: (orig_width, orig_height),
            scale: (
                self.width as f32 / orig_width.max(1) as f32,
                self.height as f32 / orig_height.max(1) as f32,
            ),
        }
    }

    /// `(3, H, W)` normalised pixels for one image.
    pub fn preprocess(&self, image: &DynamicImage) -> Array3<f32> {
        let (orig_width, orig_height) = image.dimensions();
        debug!(
            "Resizing {}x{} to {}x{}",
            orig_width, orig_height, self.width, self.height
        );

        let rgb = image
            .resize_exact(self.width, self.height, self.filter)
            .to_rgb8();

        // channel c of the output reads source channel order[c]
        let order = if self.to_rgb { [0, 1, 2] } else { [2, 1, 0] };
        let mut tensor = Array3::<f32>::zeros((3, self.height as usize, self.width as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for (c, &src) in order.iter().enumerate() {
                let value = pixel[src] as f32;
                tensor[[c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
            }
        }
        tensor
    }

    /// Stack `images` into one `(N, 3, H, W)` float tensor.
    pub fn batch(&self, images: &[DynamicImage]) -> Result<Tensor> {
        if images.is_empty() {
            return Err(DeployError::Config("no images to batch".to_string()));
        }

        let mut batch = Array4::<f32>::zeros((
            images.len(),
            3,
            self.height as usize,
            self.width as usize,
        ));
        for (mut slot, image) in batch.axis_iter_mut(Axis(0)).zip(images) {
            slot.assign(&self.preprocess(image));
        }
        Ok(Tensor::from(batch.into_dyn()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;

    fn config() -> InputConfig {
        InputConfig {
            height: 2,
            width: 2,
            mean: [0.0, 0.0, 0.0],
            std: [255.0, 255.0, 255.0],
            to_rgb: true,
        }
    }

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn test_batch_shape_and_normalisation() {
        let pre = ImagePreprocessor::new(&config());
        let images = vec![solid(4, 4, [255, 0, 51]), solid(8, 2, [0, 255, 0])];

        let tensor = pre.batch(&images).unwrap();
        assert_eq!(tensor.shape(), &[2, 3, 2, 2]);

        let values = tensor.as_f32().unwrap();
        assert!((values[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert!((values[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((values[[1, 1, 0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bgr_order_and_mean() {
        let mut cfg = config();
        cfg.to_rgb = false;
        cfg.mean = [10.0, 0.0, 0.0];
        cfg.std = [1.0, 1.0, 1.0];
        let pre = ImagePreprocessor::new(&cfg);

        let chw = pre.preprocess(&solid(2, 2, [200, 100, 50]));
        assert_eq!(chw[[0, 0, 0]], 40.0);
        assert_eq!(chw[[2, 1, 1]], 200.0);
    }

    #[test]
    fn test_meta_rescales_boxes() {
        let pre = ImagePreprocessor::new(&config());
        let meta = pre.meta(&solid(4, 8, [0, 0, 0]));
        assert_eq!(meta.scale, (0.5, 0.25));
        assert_eq!(meta.rescale_box([0.5, 0.5, 2.0, 3.0]), [1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_empty_batch_is_error() {
        let pre = ImagePreprocessor::new(&config());
        assert!(pre.batch(&[]).is_err());
    }
}

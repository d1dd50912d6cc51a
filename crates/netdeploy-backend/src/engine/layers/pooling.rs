use ndarray::{s, Array1, Array3, Axis};

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::param::ParamDict;
use crate::error::EngineError;

use super::{pad_chw, positive, same_padding, Padding};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PoolKind {
    #[default]
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PadMode {
    /// Extend the tail so the last partial window is kept.
    #[default]
    Full,
    Valid,
    SameUpper,
    SameLower,
}

/// Max or average pooling over the spatial axes of a `(c, h, w)` blob.
#[derive(Debug, Default)]
pub struct Pooling {
    kind: PoolKind,
    kernel: (usize, usize),
    stride: (usize, usize),
    pad: Padding,
    global: bool,
    pad_mode: PadMode,
    count_include_pad: bool,
}

impl Pooling {
    fn effective_padding(&self, h: usize, w: usize) -> Padding {
        let (kw, kh) = self.kernel;
        let (sw, sh) = self.stride;
        let mut pad = self.pad;
        match self.pad_mode {
            PadMode::Valid => {}
            PadMode::Full => {
                // grow the right/bottom border until the tail window fits
                let padded_w = w + pad.left + pad.right;
                let padded_h = h + pad.top + pad.bottom;
                if padded_w >= kw {
                    let rem = (padded_w - kw) % sw;
                    if rem != 0 {
                        pad.right += sw - rem;
                    }
                }
                if padded_h >= kh {
                    let rem = (padded_h - kh) % sh;
                    if rem != 0 {
                        pad.bottom += sh - rem;
                    }
                }
            }
            PadMode::SameUpper | PadMode::SameLower => {
                let pad_w = same_padding(w, kw, sw);
                let pad_h = same_padding(h, kh, sh);
                let (small_w, small_h) = (pad_w / 2, pad_h / 2);
                pad = if self.pad_mode == PadMode::SameUpper {
                    Padding {
                        top: small_h,
                        bottom: pad_h - small_h,
                        left: small_w,
                        right: pad_w - small_w,
                    }
                } else {
                    Padding {
                        top: pad_h - small_h,
                        bottom: small_h,
                        left: pad_w - small_w,
                        right: small_w,
                    }
                };
            }
        }
        pad
    }
}

impl Layer for Pooling {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.kind = match params.get_int(0, 0) {
            0 => PoolKind::Max,
            1 => PoolKind::Avg,
            other => {
                return Err(EngineError::layer(
                    "Pooling",
                    format!("unsupported pooling type {}", other),
                ));
            }
        };
        self.global = params.get_int(4, 0) != 0;

        let kernel_w = params.get_int(1, 0);
        let stride_w = params.get_int(2, 1);
        if !self.global {
            self.kernel = (
                positive("Pooling", "kernel_w", kernel_w)?,
                positive("Pooling", "kernel_h", params.get_int(11, kernel_w))?,
            );
        }
        self.stride = (
            positive("Pooling", "stride_w", stride_w)?,
            positive("Pooling", "stride_h", params.get_int(12, stride_w))?,
        );

        let left = params.get_int(3, 0).max(0) as usize;
        let top = params.get_int(13, left as i32).max(0) as usize;
        self.pad = Padding {
            left,
            top,
            right: params.get_int(14, left as i32).max(0) as usize,
            bottom: params.get_int(15, top as i32).max(0) as usize,
        };

        self.pad_mode = match params.get_int(5, 0) {
            0 => PadMode::Full,
            1 => PadMode::Valid,
            2 => PadMode::SameUpper,
            3 => PadMode::SameLower,
            other => {
                return Err(EngineError::layer(
                    "Pooling",
                    format!("unsupported pad_mode {}", other),
                ));
            }
        };
        self.count_include_pad = params.get_int(6, 0) != 0;
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Pooling")?;
        let input = x.chw()?;
        let (channels, h, w) = input.dim();

        if self.global {
            let pooled: Array1<f32> = input
                .axis_iter(Axis(0))
                .map(|plane| match self.kind {
                    PoolKind::Max => plane.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
                    PoolKind::Avg => plane.sum() / (h * w) as f32,
                })
                .collect();
            return Ok(vec![Mat::from_array(pooled.into_dyn())?]);
        }

        let pad = self.effective_padding(h, w);
        let fill = match self.kind {
            PoolKind::Max => f32::NEG_INFINITY,
            PoolKind::Avg => 0.0,
        };
        let padded = pad_chw(input, pad, fill);
        let (_, ph, pw) = padded.dim();

        let (kw, kh) = self.kernel;
        let (sw, sh) = self.stride;
        if ph < kh || pw < kw {
            return Err(EngineError::layer(
                "Pooling",
                format!("kernel {}x{} exceeds padded input {}x{}", kh, kw, ph, pw),
            ));
        }
        let out_h = (ph - kh) / sh + 1;
        let out_w = (pw - kw) / sw + 1;

        let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
        for c in 0..channels {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let (y0, x0) = (oy * sh, ox * sw);
                    let window = padded.slice(s![c, y0..y0 + kh, x0..x0 + kw]);
                    out[[c, oy, ox]] = match self.kind {
                        PoolKind::Max => window.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
                        PoolKind::Avg => {
                            let divisor = if self.count_include_pad {
                                kh * kw
                            } else {
                                // only cells that overlap the unpadded input
                                let rows = overlap(y0, kh, pad.top, h);
                                let cols = overlap(x0, kw, pad.left, w);
                                (rows * cols).max(1)
                            };
                            window.sum() / divisor as f32
                        }
                    };
                }
            }
        }
        Ok(vec![Mat::from_array(out.into_dyn())?])
    }
}

/// Number of positions in `[start, start + len)` that fall on the original
/// `[offset, offset + size)` range.
fn overlap(start: usize, len: usize, offset: usize, size: usize) -> usize {
    let lo = start.max(offset);
    let hi = (start + len).min(offset + size);
    hi.saturating_sub(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    fn pooling(params: &[(i32, i32)]) -> Pooling {
        let mut pd = ParamDict::new();
        for &(id, v) in params {
            pd.set(id, ParamValue::Int(v));
        }
        let mut layer = Pooling::default();
        layer.load_param(&pd).unwrap();
        layer
    }

    fn ramp(c: usize, h: usize, w: usize) -> Mat {
        Mat::from_shape_vec(&[c, h, w], (0..c * h * w).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_max_pool_2x2() {
        let layer = pooling(&[(0, 0), (1, 2), (2, 2)]);
        let out = layer.forward(&[&ramp(1, 4, 4)], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 2]);
        assert_eq!(out[0].to_vec(), vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_full_mode_keeps_tail_window() {
        let layer = pooling(&[(0, 0), (1, 2), (2, 2)]);
        let out = layer.forward(&[&ramp(1, 3, 3)], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 2]);
        assert_eq!(out[0].to_vec(), vec![4.0, 5.0, 7.0, 8.0]);

        let valid = pooling(&[(0, 0), (1, 2), (2, 2), (5, 1)]);
        let out = valid.forward(&[&ramp(1, 3, 3)], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 1, 1]);
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let layer = pooling(&[(0, 1), (1, 2), (2, 2)]);
        let x = Mat::from_shape_vec(&[1, 3, 3], vec![1.0; 9]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        // every window averages only real cells
        assert_eq!(out[0].to_vec(), vec![1.0; 4]);
    }

    #[test]
    fn test_global_average() {
        let layer = pooling(&[(0, 1), (4, 1)]);
        let out = layer.forward(&[&ramp(2, 2, 2)], 1).unwrap();
        assert_eq!(out[0].shape(), &[2]);
        assert_eq!(out[0].to_vec(), vec![1.5, 5.5]);
    }
}

use ndarray::Array3;

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::param::ParamDict;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ResizeMode {
    #[default]
    Nearest,
    Bilinear,
}

/// Spatial resize of a `(c, h, w)` blob by scale factors or to a fixed size.
#[derive(Debug)]
pub struct Interp {
    mode: ResizeMode,
    scale: (f32, f32),
    output_size: (usize, usize),
    align_corner: bool,
}

impl Default for Interp {
    fn default() -> Self {
        Self {
            mode: ResizeMode::Nearest,
            scale: (1.0, 1.0),
            output_size: (0, 0),
            align_corner: false,
        }
    }
}

impl Interp {
    fn output_dims(&self, h: usize, w: usize) -> (usize, usize) {
        let (out_h, out_w) = self.output_size;
        if out_h > 0 && out_w > 0 {
            (out_h, out_w)
        } else {
            let (sh, sw) = self.scale;
            ((h as f32 * sh) as usize, (w as f32 * sw) as usize)
        }
    }

    /// Map an output coordinate to the source axis.
    fn source_coord(&self, dst: usize, src_len: usize, dst_len: usize) -> f32 {
        if self.align_corner {
            if dst_len > 1 {
                dst as f32 * (src_len - 1) as f32 / (dst_len - 1) as f32
            } else {
                0.0
            }
        } else {
            let scale = src_len as f32 / dst_len as f32;
            ((dst as f32 + 0.5) * scale - 0.5).max(0.0)
        }
    }
}

impl Layer for Interp {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.mode = match params.get_int(0, 1) {
            1 => ResizeMode::Nearest,
            2 => ResizeMode::Bilinear,
            other => {
                return Err(EngineError::layer(
                    "Interp",
                    format!("unsupported resize type {}", other),
                ));
            }
        };
        self.scale = (params.get_float(1, 1.0), params.get_float(2, 1.0));
        self.output_size = (
            params.get_int(3, 0).max(0) as usize,
            params.get_int(4, 0).max(0) as usize,
        );
        self.align_corner = params.get_int(6, 0) != 0;
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Interp")?;
        if x.dims() != 3 {
            return Err(EngineError::layer(
                "Interp",
                format!("expects a (c, h, w) blob, got shape {:?}", x.shape()),
            ));
        }
        let input = x.chw()?;
        let (channels, h, w) = input.dim();
        if h == 0 || w == 0 {
            return Err(EngineError::layer(
                "Interp",
                format!("cannot resize an empty {}x{} input", h, w),
            ));
        }
        let (out_h, out_w) = self.output_dims(h, w);
        if out_h == 0 || out_w == 0 {
            return Err(EngineError::layer(
                "Interp",
                format!("resize of {}x{} yields empty output", h, w),
            ));
        }

        let out = match self.mode {
            ResizeMode::Nearest => {
                let (sy, sx) = (h as f32 / out_h as f32, w as f32 / out_w as f32);
                Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
                    let iy = ((y as f32 * sy) as usize).min(h - 1);
                    let ix = ((x as f32 * sx) as usize).min(w - 1);
                    input[[c, iy, ix]]
                })
            }
            ResizeMode::Bilinear => {
                let rows: Vec<(usize, usize, f32)> = (0..out_h)
                    .map(|y| lerp_taps(self.source_coord(y, h, out_h), h))
                    .collect();
                let cols: Vec<(usize, usize, f32)> = (0..out_w)
                    .map(|x| lerp_taps(self.source_coord(x, w, out_w), w))
                    .collect();
                Array3::from_shape_fn((channels, out_h, out_w), |(c, y, x)| {
                    let (y0, y1, fy) = rows[y];
                    let (x0, x1, fx) = cols[x];
                    let top = input[[c, y0, x0]] * (1.0 - fx) + input[[c, y0, x1]] * fx;
                    let bottom = input[[c, y1, x0]] * (1.0 - fx) + input[[c, y1, x1]] * fx;
                    top * (1.0 - fy) + bottom * fy
                })
            }
        };
        Ok(vec![Mat::from_array(out.into_dyn())?])
    }
}

fn lerp_taps(pos: f32, len: usize) -> (usize, usize, f32) {
    let i0 = (pos.floor() as usize).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, pos - i0 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    fn interp(params: &[(i32, ParamValue)]) -> Interp {
        let mut pd = ParamDict::new();
        for (id, v) in params {
            pd.set(*id, v.clone());
        }
        let mut layer = Interp::default();
        layer.load_param(&pd).unwrap();
        layer
    }

    #[test]
    fn test_nearest_upscale() {
        let layer = interp(&[(1, ParamValue::Float(2.0)), (2, ParamValue::Float(2.0))]);
        let x = Mat::from_shape_vec(&[1, 1, 2], vec![1.0, 2.0]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 4]);
        assert_eq!(out[0].to_vec(), vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_bilinear_align_corner() {
        let layer = interp(&[
            (0, ParamValue::Int(2)),
            (3, ParamValue::Int(1)),
            (4, ParamValue::Int(3)),
            (6, ParamValue::Int(1)),
        ]);
        let x = Mat::from_shape_vec(&[1, 1, 2], vec![0.0, 4.0]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].to_vec(), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_rejects_empty_input() {
        let layer = interp(&[
            (0, ParamValue::Int(1)),
            (3, ParamValue::Int(4)),
            (4, ParamValue::Int(4)),
        ]);
        let x = Mat::new_3d(1, 0, 2);
        let err = layer.forward(&[&x], 1).unwrap_err();
        assert!(matches!(err, EngineError::Layer { .. }));
    }

    #[test]
    fn test_rejects_flat_blob() {
        let layer = interp(&[]);
        assert!(layer.forward(&[&Mat::new_1d(4)], 1).is_err());
    }
}

use ndarray::{s, Array1, Array3, Array4};

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::model_bin::{ModelBin, WeightEncoding};
use crate::engine::param::ParamDict;
use crate::error::EngineError;

use super::{pad_chw, positive, same_padding, Activation, Padding};

const PAD_SAME_UPPER: i32 = -233;
const PAD_SAME_LOWER: i32 = -234;

/// 2-D convolution over a `(c, h, w)` blob, optionally grouped.
///
/// Weights are stored `[out][in / group][kh][kw]`, read as a flagged blob,
/// followed by a raw bias blob when `bias_term` is set.
#[derive(Debug)]
pub struct Convolution {
    layer_type: &'static str,
    num_output: usize,
    kernel: (usize, usize),
    dilation: (usize, usize),
    stride: (usize, usize),
    /// `(left, right, top, bottom)` as written; negative values select SAME padding.
    pad: (i32, i32, i32, i32),
    pad_value: f32,
    bias_term: bool,
    weight_data_size: usize,
    group: usize,
    activation: Activation,
    weights: Array4<f32>,
    bias: Option<Array1<f32>>,
}

impl Default for Convolution {
    fn default() -> Self {
        Self {
            layer_type: "Convolution",
            num_output: 0,
            kernel: (1, 1),
            dilation: (1, 1),
            stride: (1, 1),
            pad: (0, 0, 0, 0),
            pad_value: 0.0,
            bias_term: false,
            weight_data_size: 0,
            group: 1,
            activation: Activation::Identity,
            weights: Array4::zeros((0, 0, 0, 0)),
            bias: None,
        }
    }
}

impl Convolution {
    /// Grouped variant that honours the `group` param.
    pub fn depthwise() -> Self {
        Self {
            layer_type: "ConvolutionDepthWise",
            ..Self::default()
        }
    }

    fn in_per_group(&self) -> usize {
        let (kw, kh) = self.kernel;
        self.weight_data_size / (self.num_output * kw * kh)
    }

    fn resolve_padding(&self, h: usize, w: usize) -> Padding {
        let (left, right, top, bottom) = self.pad;
        let extent_w = self.dilation.0 * (self.kernel.0 - 1) + 1;
        let extent_h = self.dilation.1 * (self.kernel.1 - 1) + 1;

        match left {
            PAD_SAME_UPPER | PAD_SAME_LOWER => {
                let pad_w = same_padding(w, extent_w, self.stride.0);
                let pad_h = same_padding(h, extent_h, self.stride.1);
                let (small_w, small_h) = (pad_w / 2, pad_h / 2);
                if left == PAD_SAME_UPPER {
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
                }
            }
            _ => Padding {
                top: top.max(0) as usize,
                bottom: bottom.max(0) as usize,
                left: left.max(0) as usize,
                right: right.max(0) as usize,
            },
        }
    }
}

impl Layer for Convolution {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        let name = self.layer_type;
        self.num_output = positive(name, "num_output", params.get_int(0, 0))?;

        let kernel_w = params.get_int(1, 0);
        let dilation_w = params.get_int(2, 1);
        let stride_w = params.get_int(3, 1);
        self.kernel = (
            positive(name, "kernel_w", kernel_w)?,
            positive(name, "kernel_h", params.get_int(11, kernel_w))?,
        );
        self.dilation = (
            positive(name, "dilation_w", dilation_w)?,
            positive(name, "dilation_h", params.get_int(12, dilation_w))?,
        );
        self.stride = (
            positive(name, "stride_w", stride_w)?,
            positive(name, "stride_h", params.get_int(13, stride_w))?,
        );

        let left = params.get_int(4, 0);
        let right = params.get_int(15, left);
        let top = params.get_int(14, left);
        let bottom = params.get_int(16, top);
        self.pad = (left, right, top, bottom);
        self.pad_value = params.get_float(18, 0.0);

        self.bias_term = params.get_int(5, 0) != 0;
        self.weight_data_size = positive(name, "weight_data_size", params.get_int(6, 0))?;
        self.group = if self.layer_type == "ConvolutionDepthWise" {
            positive(name, "group", params.get_int(7, 1))?
        } else {
            1
        };
        self.activation = Activation::from_params(name, params.get_int(9, 0), &params.get_floats(10))?;

        let per_output = self.kernel.0 * self.kernel.1;
        if self.weight_data_size % (self.num_output * per_output) != 0 {
            return Err(EngineError::layer(
                name,
                format!(
                    "weight_data_size {} is not a multiple of {} outputs x {}x{} kernel",
                    self.weight_data_size, self.num_output, self.kernel.1, self.kernel.0
                ),
            ));
        }
        if self.num_output % self.group != 0 {
            return Err(EngineError::layer(
                name,
                format!("num_output {} not divisible by group {}", self.num_output, self.group),
            ));
        }
        Ok(())
    }

    fn load_model(&mut self, weights: &mut ModelBin<'_>) -> Result<(), EngineError> {
        let values = weights.load(self.weight_data_size, WeightEncoding::Flagged)?;
        let shape = (self.num_output, self.in_per_group(), self.kernel.1, self.kernel.0);
        self.weights = Array4::from_shape_vec(shape, values)
            .map_err(|e| EngineError::layer(self.layer_type, e.to_string()))?;

        if self.bias_term {
            self.bias = Some(Array1::from(weights.load(self.num_output, WeightEncoding::Raw)?));
        }
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let name = self.layer_type;
        let x = single_bottom(bottoms, name)?;
        let input = x.chw()?;
        let (channels, h, w) = input.dim();

        let in_per_group = self.in_per_group();
        if channels != in_per_group * self.group {
            return Err(EngineError::layer(
                name,
                format!(
                    "expects {} input channels, got {}",
                    in_per_group * self.group,
                    channels
                ),
            ));
        }

        let pad = self.resolve_padding(h, w);
        let padded = pad_chw(input, pad, self.pad_value);
        let (_, ph, pw) = padded.dim();

        let (kw, kh) = self.kernel;
        let (dw, dh) = self.dilation;
        let (sw, sh) = self.stride;
        let extent_w = dw * (kw - 1) + 1;
        let extent_h = dh * (kh - 1) + 1;
        if ph < extent_h || pw < extent_w {
            return Err(EngineError::layer(
                name,
                format!("kernel extent {}x{} exceeds padded input {}x{}", extent_h, extent_w, ph, pw),
            ));
        }
        let out_h = (ph - extent_h) / sh + 1;
        let out_w = (pw - extent_w) / sw + 1;

        let out_per_group = self.num_output / self.group;
        let mut out = Array3::<f32>::zeros((self.num_output, out_h, out_w));

        for oc in 0..self.num_output {
            let g = oc / out_per_group;
            let mut acc = out.slice_mut(s![oc, .., ..]);
            for icl in 0..in_per_group {
                let ic = g * in_per_group + icl;
                for ky in 0..kh {
                    let y0 = ky * dh;
                    let y1 = y0 + (out_h - 1) * sh + 1;
                    for kx in 0..kw {
                        let x0 = kx * dw;
                        let x1 = x0 + (out_w - 1) * sw + 1;
                        let weight = self.weights[[oc, icl, ky, kx]];
                        let window = padded.slice(s![ic, y0..y1;sh, x0..x1;sw]);
                        acc.scaled_add(weight, &window);
                    }
                }
            }
            if let Some(bias) = &self.bias {
                acc += bias[oc];
            }
        }

        let activation = self.activation;
        if activation != Activation::Identity {
            out.mapv_inplace(|v| activation.apply(v));
        }
        Ok(vec![Mat::from_array(out.into_dyn())?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    fn model_bytes(weights: &[f32], bias: Option<&[f32]>) -> Vec<u8> {
        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend(weights.iter().flat_map(|v| v.to_le_bytes()));
        if let Some(bias) = bias {
            bytes.extend(bias.iter().flat_map(|v| v.to_le_bytes()));
        }
        bytes
    }

    fn conv(params: &[(i32, ParamValue)], weights: &[f32], bias: Option<&[f32]>) -> Convolution {
        let mut pd = ParamDict::new();
        for (id, v) in params {
            pd.set(*id, v.clone());
        }
        let mut layer = Convolution::default();
        layer.load_param(&pd).unwrap();
        let bytes = model_bytes(weights, bias);
        let mut mb = ModelBin::new(&bytes);
        layer.load_model(&mut mb).unwrap();
        assert_eq!(mb.remaining(), 0);
        layer
    }

    #[test]
    fn test_box_filter_valid() {
        use ParamValue::Int;
        let layer = conv(
            &[(0, Int(1)), (1, Int(2)), (5, Int(1)), (6, Int(4))],
            &[1.0; 4],
            Some(&[0.5]),
        );
        let x = Mat::from_shape_vec(&[1, 3, 3], (1..=9).map(|v| v as f32).collect()).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 2]);
        assert_eq!(out[0].to_vec(), vec![12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn test_same_padding_with_stride() {
        use ParamValue::Int;
        let layer = conv(
            &[(0, Int(1)), (1, Int(3)), (3, Int(2)), (4, Int(-233)), (6, Int(9))],
            &[1.0; 9],
            None,
        );
        let x = Mat::from_shape_vec(&[1, 4, 4], vec![1.0; 16]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 2]);
        // same-upper puts the single padding row and column at the end
        assert_eq!(out[0].to_vec(), vec![9.0, 6.0, 6.0, 4.0]);
    }

    #[test]
    fn test_depthwise_groups() {
        use ParamValue::Int;
        let mut pd = ParamDict::new();
        for (id, v) in [(0, 2), (1, 1), (6, 2), (7, 2)] {
            pd.set(id, Int(v));
        }
        let mut layer = Convolution::depthwise();
        layer.load_param(&pd).unwrap();
        let bytes = model_bytes(&[2.0, -1.0], None);
        layer.load_model(&mut ModelBin::new(&bytes)).unwrap();

        let x = Mat::from_shape_vec(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].to_vec(), vec![2.0, 4.0, -3.0, -4.0]);
    }

    #[test]
    fn test_channel_mismatch() {
        use ParamValue::Int;
        let layer = conv(&[(0, Int(1)), (1, Int(1)), (6, Int(2))], &[1.0, 1.0], None);
        let x = Mat::new_3d(3, 2, 2);
        assert!(matches!(
            layer.forward(&[&x], 1),
            Err(EngineError::Layer { .. })
        ));
    }

    #[test]
    fn test_fused_relu() {
        use ParamValue::Int;
        let layer = conv(
            &[(0, Int(1)), (1, Int(1)), (6, Int(1)), (9, Int(1))],
            &[-1.0],
            None,
        );
        let x = Mat::from_shape_vec(&[1, 1, 2], vec![1.0, -2.0]).unwrap();
        assert_eq!(layer.forward(&[&x], 1).unwrap()[0].to_vec(), vec![0.0, 2.0]);
    }
}

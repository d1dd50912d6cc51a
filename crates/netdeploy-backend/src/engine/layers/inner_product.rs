use ndarray::{Array1, Array2, Axis};

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::model_bin::{ModelBin, WeightEncoding};
use crate::engine::param::ParamDict;
use crate::error::EngineError;

use super::{positive, Activation};

/// Fully connected layer.
///
/// A 2-D bottom whose row width equals the input size is processed row by
/// row; anything else is flattened into a single vector.
#[derive(Debug)]
pub struct InnerProduct {
    num_output: usize,
    bias_term: bool,
    weight_data_size: usize,
    activation: Activation,
    weights: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Default for InnerProduct {
    fn default() -> Self {
        Self {
            num_output: 0,
            bias_term: false,
            weight_data_size: 0,
            activation: Activation::Identity,
            weights: Array2::zeros((0, 0)),
            bias: None,
        }
    }
}

impl Layer for InnerProduct {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.num_output = positive("InnerProduct", "num_output", params.get_int(0, 0))?;
        self.bias_term = params.get_int(1, 0) != 0;
        self.weight_data_size =
            positive("InnerProduct", "weight_data_size", params.get_int(2, 0))?;
        if self.weight_data_size % self.num_output != 0 {
            return Err(EngineError::layer(
                "InnerProduct",
                format!(
                    "weight_data_size {} not divisible by num_output {}",
                    self.weight_data_size, self.num_output
                ),
            ));
        }
        self.activation =
            Activation::from_params("InnerProduct", params.get_int(9, 0), &params.get_floats(10))?;
        Ok(())
    }

    fn load_model(&mut self, weights: &mut ModelBin<'_>) -> Result<(), EngineError> {
        let num_input = self.weight_data_size / self.num_output;
        let values = weights.load(self.weight_data_size, WeightEncoding::Flagged)?;
        self.weights = Array2::from_shape_vec((self.num_output, num_input), values)
            .map_err(|e| EngineError::layer("InnerProduct", e.to_string()))?;
        if self.bias_term {
            self.bias = Some(Array1::from(weights.load(self.num_output, WeightEncoding::Raw)?));
        }
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "InnerProduct")?;
        let num_input = self.weights.ncols();

        let rows: Array2<f32> = if x.dims() == 2 && x.w() == num_input {
            x.array()
                .view()
                .into_shape_with_order((x.h(), num_input))
                .map_err(|e| EngineError::layer("InnerProduct", e.to_string()))?
                .to_owned()
        } else if x.total() == num_input {
            Array1::from(x.to_vec()).insert_axis(Axis(0))
        } else {
            return Err(EngineError::layer(
                "InnerProduct",
                format!("expects {} inputs, got shape {:?}", num_input, x.shape()),
            ));
        };

        let mut out = rows.dot(&self.weights.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        let activation = self.activation;
        if activation != Activation::Identity {
            out.mapv_inplace(|v| activation.apply(v));
        }

        let out = if x.dims() == 2 && x.w() == num_input {
            out.into_dyn()
        } else {
            out.index_axis_move(Axis(0), 0).into_dyn()
        };
        Ok(vec![Mat::from_array(out)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    fn inner_product(num_output: i32, weights: &[f32], bias: &[f32]) -> InnerProduct {
        let mut pd = ParamDict::new();
        pd.set(0, ParamValue::Int(num_output));
        pd.set(1, ParamValue::Int(1));
        pd.set(2, ParamValue::Int(weights.len() as i32));

        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend(weights.iter().chain(bias).flat_map(|v| v.to_le_bytes()));

        let mut layer = InnerProduct::default();
        layer.load_param(&pd).unwrap();
        layer.load_model(&mut ModelBin::new(&bytes)).unwrap();
        layer
    }

    #[test]
    fn test_flattens_chw_input() {
        let layer = inner_product(2, &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0], &[0.0, 1.0]);
        let x = Mat::from_shape_vec(&[1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].shape(), &[2]);
        assert_eq!(out[0].to_vec(), vec![10.0, 5.0]);
    }

    #[test]
    fn test_row_wise_2d_input() {
        let layer = inner_product(1, &[1.0, -1.0], &[0.0]);
        let x = Mat::from_shape_vec(&[3, 2], vec![1.0, 1.0, 3.0, 1.0, 0.0, 2.0]).unwrap();
        let out = layer.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].shape(), &[3, 1]);
        assert_eq!(out[0].to_vec(), vec![0.0, 2.0, -2.0]);
    }

    #[test]
    fn test_input_size_mismatch() {
        let layer = inner_product(1, &[1.0, 1.0], &[0.0]);
        assert!(layer.forward(&[&Mat::new_1d(3)], 1).is_err());
    }
}

//! Element-wise activations and softmax.

use ndarray::Axis;

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::param::ParamDict;
use crate::error::EngineError;

use super::resolve_axis;

/// ReLU with optional negative slope (param 0).
#[derive(Debug, Default)]
pub struct ReLU {
    slope: f32,
}

impl Layer for ReLU {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.slope = params.get_float(0, 0.0);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "ReLU")?;
        let slope = self.slope;
        let out = x.array().mapv(|v| if v < 0.0 { v * slope } else { v });
        Ok(vec![Mat::from_array(out)?])
    }
}

#[derive(Debug, Default)]
pub struct Sigmoid;

impl Layer for Sigmoid {
    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Sigmoid")?;
        let out = x.array().mapv(|v| 1.0 / (1.0 + (-v).exp()));
        Ok(vec![Mat::from_array(out)?])
    }
}

/// Softmax along param 0 (`axis`, counted over the blob's own dims).
#[derive(Debug, Default)]
pub struct Softmax {
    axis: i32,
}

impl Layer for Softmax {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.axis = params.get_int(0, 0);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Softmax")?;
        let axis = resolve_axis("Softmax", self.axis, x.dims())?;

        let mut out = x.array().clone();
        for mut lane in out.lanes_mut(Axis(axis)) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            lane.mapv_inplace(|v| v / sum);
        }
        Ok(vec![Mat::from_array(out)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    #[test]
    fn test_leaky_relu() {
        let mut relu = ReLU::default();
        let mut pd = ParamDict::new();
        pd.set(0, ParamValue::Float(0.1));
        relu.load_param(&pd).unwrap();

        let x = Mat::from_vec(vec![-10.0, 3.0]);
        let out = relu.forward(&[&x], 1).unwrap();
        assert_eq!(out[0].to_vec(), vec![-1.0, 3.0]);
    }

    #[test]
    fn test_softmax_over_channels() {
        let x = Mat::from_shape_vec(&[2, 1, 2], vec![0.0, 1.0, 0.0, 3.0]).unwrap();
        let out = Softmax::default().forward(&[&x], 1).unwrap();
        let v = out[0].to_vec();
        // first column: equal logits
        assert!((v[0] - 0.5).abs() < 1e-6);
        assert!((v[2] - 0.5).abs() < 1e-6);
        // second column sums to one, larger logit wins
        assert!((v[1] + v[3] - 1.0).abs() < 1e-6);
        assert!(v[3] > v[1]);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        let x = Mat::from_vec(vec![0.0]);
        assert_eq!(Sigmoid.forward(&[&x], 1).unwrap()[0].to_vec(), vec![0.5]);
    }
}

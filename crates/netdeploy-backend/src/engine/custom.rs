//! Custom layer registration.
//!
//! Networks exported from the detection and restoration toolchains reference
//! a handful of layer types the built-in set lacks. They are supplied by a
//! [`CustomLayerRegistrar`] that the caller passes in explicitly; it runs
//! before the param file is parsed.

use ndarray::Axis;

use crate::error::EngineError;

use super::layer::{Layer, single_bottom};
use super::layers::resolve_axis;
use super::mat::Mat;
use super::net::Net;
use super::param::ParamDict;

/// Adds layer types to a network that has not loaded its structure yet.
pub trait CustomLayerRegistrar: Send + Sync {
    fn register_custom_layers(&self, net: &mut Net) -> Result<(), EngineError>;
}

/// The deploy operator set: `Shape` and `Gather`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOps;

impl CustomLayerRegistrar for DeployOps {
    fn register_custom_layers(&self, net: &mut Net) -> Result<(), EngineError> {
        net.register_custom_layer("Shape", || Box::new(Shape))?;
        net.register_custom_layer("Gather", || Box::new(Gather::default()))?;
        Ok(())
    }
}

/// Emits the bottom's shape with a leading batch dimension of 1.
#[derive(Debug, Default)]
pub struct Shape;

impl Layer for Shape {
    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Shape")?;
        let dims = std::iter::once(1.0)
            .chain(x.shape().iter().map(|&d| d as f32))
            .collect();
        Ok(vec![Mat::from_vec(dims)])
    }
}

/// Selects entries along param 0 (`axis`) using indices from the second bottom.
///
/// Negative indices count from the end of the axis.
#[derive(Debug, Default)]
pub struct Gather {
    axis: i32,
}

impl Layer for Gather {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.axis = params.get_int(0, 0);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let [data, indices] = bottoms else {
            return Err(EngineError::layer(
                "Gather",
                format!("expects data and indices bottoms, got {}", bottoms.len()),
            ));
        };
        let axis = resolve_axis("Gather", self.axis, data.dims())?;
        let len = data.shape()[axis] as i64;

        let picks = indices
            .to_vec()
            .into_iter()
            .map(|v| {
                let i = v as i64;
                let i = if i < 0 { i + len } else { i };
                if (0..len).contains(&i) {
                    Ok(i as usize)
                } else {
                    Err(EngineError::layer(
                        "Gather",
                        format!("index {} out of range for axis of length {}", v, len),
                    ))
                }
            })
            .collect::<Result<Vec<usize>, _>>()?;

        let picked = data.array().select(Axis(axis), &picks);
        Ok(vec![Mat::from_array(picked)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    #[test]
    fn test_deploy_ops_register_before_param() {
        let mut net = Net::new();
        DeployOps.register_custom_layers(&mut net).unwrap();
        net.load_param_str("7767517\n2 2\nInput data 0 1 data\nShape shape 1 1 data out\n")
            .unwrap();
        net.load_model_bytes(&[]).unwrap();

        let mut ex = net.create_extractor().unwrap();
        ex.input("data", Mat::new_3d(3, 4, 5)).unwrap();
        assert_eq!(ex.extract("out").unwrap().to_vec(), vec![1.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_unregistered_custom_type_fails_load() {
        let mut net = Net::new();
        let err = net
            .load_param_str("7767517\n2 2\nInput data 0 1 data\nShape shape 1 1 data out\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownLayer(t) if t == "Shape"));
    }

    #[test]
    fn test_gather_rows() {
        let mut pd = ParamDict::new();
        pd.set(0, ParamValue::Int(0));
        let mut gather = Gather::default();
        gather.load_param(&pd).unwrap();

        let data = Mat::from_shape_vec(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let idx = Mat::from_vec(vec![2.0, -3.0]);
        let out = gather.forward(&[&data, &idx], 1).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].to_vec(), vec![5.0, 6.0, 1.0, 2.0]);

        let bad = Mat::from_vec(vec![3.0]);
        assert!(gather.forward(&[&data, &bad], 1).is_err());
    }
}

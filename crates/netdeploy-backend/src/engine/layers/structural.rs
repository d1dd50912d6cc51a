//! Layers that route or reshape data without arithmetic.

use ndarray::{concatenate, ArrayView, Axis, IxDyn};

use crate::engine::layer::{single_bottom, Layer};
use crate::engine::mat::Mat;
use crate::engine::param::ParamDict;
use crate::error::EngineError;

use super::resolve_axis;

/// Marks a network input. Its top is filled by the extractor, never computed.
#[derive(Debug, Default)]
pub struct Input {
    shape: (i32, i32, i32),
}

impl Layer for Input {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.shape = (params.get_int(2, 0), params.get_int(1, 0), params.get_int(0, 0));
        Ok(())
    }

    fn forward(&self, _bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let (c, h, w) = self.shape;
        Err(EngineError::layer(
            "Input",
            format!("declared input (c={}, h={}, w={}) has no bound data", c, h, w),
        ))
    }
}

/// Fans one blob out to every top.
#[derive(Debug, Default)]
pub struct Split;

impl Layer for Split {
    fn forward(&self, bottoms: &[&Mat], top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Split")?;
        Ok(vec![x.clone(); top_count])
    }
}

/// Joins bottoms along param 0 (`axis`).
#[derive(Debug, Default)]
pub struct Concat {
    axis: i32,
}

impl Layer for Concat {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.axis = params.get_int(0, 0);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let first = bottoms
            .first()
            .ok_or_else(|| EngineError::layer("Concat", "needs at least one bottom"))?;
        if let Some(odd) = bottoms.iter().find(|m| m.dims() != first.dims()) {
            return Err(EngineError::layer(
                "Concat",
                format!("rank of {:?} does not match {:?}", odd.shape(), first.shape()),
            ));
        }
        let axis = resolve_axis("Concat", self.axis, first.dims())?;
        let views: Vec<ArrayView<'_, f32, IxDyn>> = bottoms.iter().map(|m| m.array().view()).collect();
        let joined = concatenate(Axis(axis), &views)
            .map_err(|e| EngineError::layer("Concat", e.to_string()))?;
        Ok(vec![Mat::from_array(joined)?])
    }
}

/// Collapses a blob into rank 1.
#[derive(Debug, Default)]
pub struct Flatten;

impl Layer for Flatten {
    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Flatten")?;
        Ok(vec![Mat::from_vec(x.to_vec())])
    }
}

/// Inference-time dropout: multiplies by param 0 (`scale`).
#[derive(Debug)]
pub struct Dropout {
    scale: f32,
}

impl Default for Dropout {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl Layer for Dropout {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.scale = params.get_float(0, 1.0);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let x = single_bottom(bottoms, "Dropout")?;
        if self.scale == 1.0 {
            return Ok(vec![x.clone()]);
        }
        let scale = self.scale;
        Ok(vec![Mat::from_array(x.array().mapv(|v| v * scale))?])
    }
}

#[derive(Debug, Default)]
pub struct Noop;

impl Layer for Noop {
    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        Ok(bottoms.iter().map(|m| (*m).clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::param::ParamValue;

    #[test]
    fn test_split_copies_to_each_top() {
        let x = Mat::from_vec(vec![1.0, 2.0]);
        let out = Split.forward(&[&x], 3).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|m| m == &x));
    }

    #[test]
    fn test_concat_channels() {
        let a = Mat::from_shape_vec(&[1, 1, 2], vec![1.0, 2.0]).unwrap();
        let b = Mat::from_shape_vec(&[2, 1, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let out = Concat::default().forward(&[&a, &b], 1).unwrap();
        assert_eq!(out[0].shape(), &[3, 1, 2]);
        assert_eq!(out[0].to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_last_axis() {
        let mut pd = ParamDict::new();
        pd.set(0, ParamValue::Int(-1));
        let mut concat = Concat::default();
        concat.load_param(&pd).unwrap();

        let a = Mat::from_shape_vec(&[2, 1], vec![1.0, 2.0]).unwrap();
        let b = Mat::from_shape_vec(&[2, 1], vec![3.0, 4.0]).unwrap();
        let out = concat.forward(&[&a, &b], 1).unwrap();
        assert_eq!(out[0].to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_flatten_and_input() {
        let x = Mat::new_3d(2, 2, 2);
        assert_eq!(Flatten.forward(&[&x], 1).unwrap()[0].shape(), &[8]);
        assert!(Input::default().forward(&[], 1).is_err());
    }
}

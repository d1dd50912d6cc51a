use crate::engine::layer::Layer;
use crate::engine::mat::Mat;
use crate::engine::param::ParamDict;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum EltwiseOp {
    Prod,
    #[default]
    Sum,
    Max,
}

/// Element-wise combination of equally shaped bottoms.
#[derive(Debug, Default)]
pub struct Eltwise {
    op: EltwiseOp,
    coeffs: Vec<f32>,
}

impl Layer for Eltwise {
    fn load_param(&mut self, params: &ParamDict) -> Result<(), EngineError> {
        self.op = match params.get_int(0, 1) {
            0 => EltwiseOp::Prod,
            1 => EltwiseOp::Sum,
            2 => EltwiseOp::Max,
            other => {
                return Err(EngineError::layer(
                    "Eltwise",
                    format!("unsupported operation {}", other),
                ));
            }
        };
        self.coeffs = params.get_floats(1);
        Ok(())
    }

    fn forward(&self, bottoms: &[&Mat], _top_count: usize) -> Result<Vec<Mat>, EngineError> {
        let (first, rest) = bottoms
            .split_first()
            .ok_or_else(|| EngineError::layer("Eltwise", "needs at least one bottom"))?;
        if let Some(odd) = rest.iter().find(|m| m.shape() != first.shape()) {
            return Err(EngineError::layer(
                "Eltwise",
                format!("shape {:?} does not match {:?}", odd.shape(), first.shape()),
            ));
        }
        if !self.coeffs.is_empty() && self.coeffs.len() != bottoms.len() {
            return Err(EngineError::layer(
                "Eltwise",
                format!("{} coefficients for {} bottoms", self.coeffs.len(), bottoms.len()),
            ));
        }

        let coeff = |i: usize| self.coeffs.get(i).copied().unwrap_or(1.0);
        let mut acc = first.array().clone();
        if self.op == EltwiseOp::Sum {
            acc.mapv_inplace(|v| v * coeff(0));
        }
        for (i, other) in rest.iter().enumerate() {
            let other = other.array();
            match self.op {
                EltwiseOp::Prod => acc *= other,
                EltwiseOp::Sum => acc.scaled_add(coeff(i + 1), other),
                EltwiseOp::Max => acc.zip_mut_with(other, |a, &b| *a = a.max(b)),
            }
        }
        Ok(vec![Mat::from_array(acc)?])
    }
}

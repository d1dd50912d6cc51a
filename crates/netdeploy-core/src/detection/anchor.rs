use ndarray::{Array2, Axis};

/// Generates anchors for a multi-level detection head.
///
/// Base anchors are centred at `base_size * center_offset`. Within a level
/// they are ordered ratio-major: anchor `r * scales.len() + s` has ratio `r`
/// and scale `s`.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    strides: Vec<usize>,
    base_anchors: Vec<Array2<f32>>,
}

impl AnchorGenerator {
    pub fn new(
        strides: Vec<usize>,
        ratios: &[f32],
        scales: &[f32],
        base_sizes: Option<&[f32]>,
        center_offset: f32,
    ) -> Self {
        let base_anchors = strides
            .iter()
            .enumerate()
            .map(|(level, &stride)| {
                let base_size = base_sizes
                    .and_then(|sizes| sizes.get(level).copied())
                    .unwrap_or(stride as f32);
                single_level_base_anchors(base_size, ratios, scales, center_offset)
            })
            .collect();
        Self {
            strides,
            base_anchors,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.strides.len()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Anchors per position on each level.
    pub fn num_base_anchors(&self) -> Vec<usize> {
        self.base_anchors.iter().map(|a| a.nrows()).collect()
    }

    /// `(A, 4)` base anchors for every level.
    pub fn base_anchors(&self) -> &[Array2<f32>] {
        &self.base_anchors
    }

    /// `(H * W * A, 4)` anchors for one level, position-major.
    pub fn single_level_grid_anchors(&self, level: usize, featmap_size: (usize, usize)) -> Array2<f32> {
        let base = &self.base_anchors[level];
        let stride = self.strides[level] as f32;
        let (feat_h, feat_w) = featmap_size;
        let num_base = base.nrows();

        let mut anchors = Array2::zeros((feat_h * feat_w * num_base, 4));
        for y in 0..feat_h {
            for x in 0..feat_w {
                let (sx, sy) = (x as f32 * stride, y as f32 * stride);
                let offset = (y * feat_w + x) * num_base;
                for (a, anchor) in base.axis_iter(Axis(0)).enumerate() {
                    let mut row = anchors.row_mut(offset + a);
                    row[0] = anchor[0] + sx;
                    row[1] = anchor[1] + sy;
                    row[2] = anchor[2] + sx;
                    row[3] = anchor[3] + sy;
                }
            }
        }
        anchors
    }

    /// Anchors for every level. `featmap_sizes` holds `(height, width)`.
    pub fn grid_anchors(&self, featmap_sizes: &[(usize, usize)]) -> Vec<Array2<f32>> {
        featmap_sizes
            .iter()
            .take(self.num_levels())
            .enumerate()
            .map(|(level, &size)| self.single_level_grid_anchors(level, size))
            .collect()
    }
}

fn single_level_base_anchors(base_size: f32, ratios: &[f32], scales: &[f32], center_offset: f32) -> Array2<f32> {
    let center = base_size * center_offset;
    let mut anchors = Array2::zeros((ratios.len() * scales.len(), 4));
    for (r, &ratio) in ratios.iter().enumerate() {
        let h_ratio = ratio.sqrt();
        let w_ratio = 1.0 / h_ratio;
        for (s, &scale) in scales.iter().enumerate() {
            let w = base_size * w_ratio * scale;
            let h = base_size * h_ratio * scale;
            let mut row = anchors.row_mut(r * scales.len() + s);
            row[0] = center - 0.5 * w;
            row[1] = center - 0.5 * h;
            row[2] = center + 0.5 * w;
            row[3] = center + 0.5 * h;
        }
    }
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_base_anchors_ratio_major() {
        let generator = AnchorGenerator::new(vec![16], &[0.25, 1.0], &[1.0, 2.0], None, 0.0);
        assert_eq!(generator.num_base_anchors(), vec![4]);
        assert_eq!(
            generator.base_anchors()[0],
            array![
                [-16.0f32, -4.0, 16.0, 4.0],
                [-32.0, -8.0, 32.0, 8.0],
                [-8.0, -8.0, 8.0, 8.0],
                [-16.0, -16.0, 16.0, 16.0],
            ]
        );
    }

    #[test]
    fn test_center_offset_and_base_size() {
        let generator = AnchorGenerator::new(vec![8], &[1.0], &[1.0], Some(&[4.0]), 0.5);
        assert_eq!(generator.base_anchors()[0], array![[0.0f32, 0.0, 4.0, 4.0]]);
    }

    #[test]
    fn test_grid_anchors_position_major() {
        let generator = AnchorGenerator::new(vec![10, 20], &[1.0], &[1.0, 2.0], None, 0.0);
        let anchors = generator.grid_anchors(&[(2, 3), (1, 1)]);
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].nrows(), 2 * 3 * 2);
        assert_eq!(anchors[1].nrows(), 2);

        // position (y=1, x=2), second anchor
        assert_eq!(anchors[0].row((3 + 2) * 2 + 1).to_vec(), vec![10.0, 0.0, 30.0, 20.0]);
        assert_eq!(anchors[1].row(0).to_vec(), vec![-10.0, -10.0, 10.0, 10.0]);
    }
}

use ndarray::{Array2, ArrayView2, Zip};

/// Decodes `(dx, dy, dw, dh)` regression deltas against anchors.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaXywhCoder {
    pub means: [f32; 4],
    pub stds: [f32; 4],
    pub wh_ratio_clip: f32,
}

impl Default for DeltaXywhCoder {
    fn default() -> Self {
        Self::new([0.0; 4], [1.0; 4])
    }
}

impl DeltaXywhCoder {
    pub fn new(means: [f32; 4], stds: [f32; 4]) -> Self {
        Self {
            means,
            stds,
            wh_ratio_clip: 16.0 / 1000.0,
        }
    }

    /// Apply `deltas` to `anchors`, both `(N, 4)`.
    ///
    /// Width and height deltas are clamped to `|ln(wh_ratio_clip)|`. With
    /// `max_shape = (height, width)` the result is clipped to the image.
    pub fn decode(
        &self,
        anchors: ArrayView2<'_, f32>,
        deltas: ArrayView2<'_, f32>,
        max_shape: Option<(usize, usize)>,
    ) -> Array2<f32> {
        let max_ratio = self.wh_ratio_clip.ln().abs();
        let mut boxes = Array2::zeros(anchors.raw_dim());

        Zip::from(boxes.rows_mut())
            .and(anchors.rows())
            .and(deltas.rows())
            .for_each(|mut out, anchor, delta| {
                let d: [f32; 4] = std::array::from_fn(|i| delta[i] * self.stds[i] + self.means[i]);
                let dw = d[2].clamp(-max_ratio, max_ratio);
                let dh = d[3].clamp(-max_ratio, max_ratio);

                let pw = anchor[2] - anchor[0];
                let ph = anchor[3] - anchor[1];
                let px = (anchor[0] + anchor[2]) * 0.5;
                let py = (anchor[1] + anchor[3]) * 0.5;

                let gw = pw * dw.exp();
                let gh = ph * dh.exp();
                let gx = px + pw * d[0];
                let gy = py + ph * d[1];

                let mut decoded = [gx - gw * 0.5, gy - gh * 0.5, gx + gw * 0.5, gy + gh * 0.5];
                if let Some((height, width)) = max_shape {
                    let (w, h) = (width as f32, height as f32);
                    decoded[0] = decoded[0].clamp(0.0, w);
                    decoded[1] = decoded[1].clamp(0.0, h);
                    decoded[2] = decoded[2].clamp(0.0, w);
                    decoded[3] = decoded[3].clamp(0.0, h);
                }
                for (o, v) in out.iter_mut().zip(decoded) {
                    *o = v;
                }
            });
        boxes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn close(a: &Array2<f32>, b: &Array2<f32>) -> bool {
        a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn test_zero_deltas_return_anchor() {
        let coder = DeltaXywhCoder::default();
        let anchors = array![[10.0f32, 20.0, 30.0, 60.0]];
        let deltas = Array2::zeros((1, 4));
        assert!(close(&coder.decode(anchors.view(), deltas.view(), None), &anchors));
    }

    #[test]
    fn test_shift_and_scale_with_stds() {
        let coder = DeltaXywhCoder::new([0.0; 4], [0.1, 0.1, 0.2, 0.2]);
        let anchors = array![[0.0f32, 0.0, 10.0, 10.0]];
        // denormalised: dx = 0.5, dy = 0, dw = ln 2, dh = 0
        let deltas = array![[5.0f32, 0.0, 2f32.ln() / 0.2, 0.0]];
        let boxes = coder.decode(anchors.view(), deltas.view(), None);
        assert!(close(&boxes, &array![[0.0f32, 0.0, 20.0, 10.0]]));
    }

    #[test]
    fn test_clamps_ratio_and_clips_to_image() {
        let coder = DeltaXywhCoder::default();
        let anchors = array![[0.0f32, 0.0, 10.0, 10.0]];
        let deltas = array![[0.0f32, 0.0, 100.0, 0.0]];

        let unclipped = coder.decode(anchors.view(), deltas.view(), None);
        let max_w = 10.0 * (1000.0f32 / 16.0);
        assert!((unclipped[[0, 2]] - unclipped[[0, 0]] - max_w).abs() < 1e-2);

        let clipped = coder.decode(anchors.view(), deltas.view(), Some((8, 50)));
        assert!(close(&clipped, &array![[0.0f32, 0.0, 50.0, 8.0]]));
    }
}

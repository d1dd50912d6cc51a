use ndarray::{concatenate, s, Array2, ArrayView3, Axis};
use tracing::debug;

use super::{multiclass_nms, AnchorGenerator, DeltaXywhCoder, Detection};
use crate::config::{AnchorHeadConfig, PostProcessingConfig};
use crate::error::{DeployError, Result};

/// Result of [`AnchorHead::get_bboxes`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeadOutput {
    Detections(Vec<Detection>),
    /// Decoded boxes with per-class scores, before NMS.
    Raw {
        boxes: Vec<[f32; 4]>,
        scores: Array2<f32>,
    },
}

/// Decodes raw anchor-head outputs into boxes.
#[derive(Debug, Clone)]
pub struct AnchorHead {
    num_classes: usize,
    use_sigmoid_cls: bool,
    nms_pre: usize,
    anchor_generator: AnchorGenerator,
    bbox_coder: DeltaXywhCoder,
    post_processing: PostProcessingConfig,
}

impl AnchorHead {
    pub fn new(config: &AnchorHeadConfig, post_processing: PostProcessingConfig) -> Self {
        let anchor_generator = AnchorGenerator::new(
            config.strides.clone(),
            &config.ratios,
            &config.scales,
            config.base_sizes.as_deref(),
            config.center_offset,
        );
        Self {
            num_classes: config.num_classes,
            use_sigmoid_cls: config.use_sigmoid_cls,
            nms_pre: config.nms_pre,
            anchor_generator,
            bbox_coder: DeltaXywhCoder::new(config.target_means, config.target_stds),
            post_processing,
        }
    }

    /// Score columns per anchor: softmax heads carry a background column.
    pub fn cls_out_channels(&self) -> usize {
        if self.use_sigmoid_cls {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    pub fn anchor_generator(&self) -> &AnchorGenerator {
        &self.anchor_generator
    }

    /// Boxes for one sample.
    ///
    /// `cls_scores[l]` is `(A * C, H, W)` and `bbox_preds[l]` is
    /// `(A * 4, H, W)` for level `l`. `img_shape` is `(height, width)` of the
    /// network input; decoded boxes are clipped to it.
    pub fn get_bboxes(
        &self,
        cls_scores: &[ArrayView3<'_, f32>],
        bbox_preds: &[ArrayView3<'_, f32>],
        img_shape: (usize, usize),
        with_nms: bool,
    ) -> Result<HeadOutput> {
        let (boxes, scores) = self.decode_candidates(cls_scores, bbox_preds, img_shape)?;
        if with_nms {
            Ok(HeadOutput::Detections(multiclass_nms(
                &boxes,
                scores.view(),
                &self.post_processing,
            )))
        } else {
            Ok(HeadOutput::Raw { boxes, scores })
        }
    }

    /// [`get_bboxes`](Self::get_bboxes) followed by NMS.
    pub fn detections(
        &self,
        cls_scores: &[ArrayView3<'_, f32>],
        bbox_preds: &[ArrayView3<'_, f32>],
        img_shape: (usize, usize),
    ) -> Result<Vec<Detection>> {
        let (boxes, scores) = self.decode_candidates(cls_scores, bbox_preds, img_shape)?;
        Ok(multiclass_nms(&boxes, scores.view(), &self.post_processing))
    }

    /// Decoded boxes and foreground scores of every kept candidate.
    fn decode_candidates(
        &self,
        cls_scores: &[ArrayView3<'_, f32>],
        bbox_preds: &[ArrayView3<'_, f32>],
        img_shape: (usize, usize),
    ) -> Result<(Vec<[f32; 4]>, Array2<f32>)> {
        let levels = self.anchor_generator.num_levels();
        if cls_scores.len() != levels || bbox_preds.len() != levels {
            return Err(DeployError::Postprocess(format!(
                "expected {} levels, got {} cls_score and {} bbox_pred maps",
                levels,
                cls_scores.len(),
                bbox_preds.len()
            )));
        }

        let channels = self.cls_out_channels();
        let num_base = self.anchor_generator.num_base_anchors();

        let mut level_scores = Vec::with_capacity(levels);
        let mut level_deltas = Vec::with_capacity(levels);
        let mut level_anchors = Vec::with_capacity(levels);

        for level in 0..levels {
            let (cls, reg) = (&cls_scores[level], &bbox_preds[level]);
            let (_, height, width) = cls.dim();
            let anchors_per_pos = num_base[level];

            if cls.dim() != (anchors_per_pos * channels, height, width)
                || reg.dim() != (anchors_per_pos * 4, height, width)
            {
                return Err(DeployError::Postprocess(format!(
                    "level {}: cls_score {:?} and bbox_pred {:?} do not match {} anchors x {} classes",
                    level,
                    cls.shape(),
                    reg.shape(),
                    anchors_per_pos,
                    channels
                )));
            }

            let mut scores = flatten_level(cls, channels)?;
            if self.use_sigmoid_cls {
                scores.mapv_inplace(sigmoid);
            } else {
                softmax_rows(&mut scores);
            }
            let mut deltas = flatten_level(reg, 4)?;
            let mut anchors = self
                .anchor_generator
                .single_level_grid_anchors(level, (height, width));

            if self.nms_pre > 0 && scores.nrows() > self.nms_pre {
                let keep = self.top_candidates(&scores);
                scores = scores.select(Axis(0), &keep);
                deltas = deltas.select(Axis(0), &keep);
                anchors = anchors.select(Axis(0), &keep);
            }

            level_scores.push(scores);
            level_deltas.push(deltas);
            level_anchors.push(anchors);
        }

        let scores = concat_rows(&level_scores)?;
        let deltas = concat_rows(&level_deltas)?;
        let anchors = concat_rows(&level_anchors)?;

        let decoded = self
            .bbox_coder
            .decode(anchors.view(), deltas.view(), Some(img_shape));
        let boxes: Vec<[f32; 4]> = decoded
            .rows()
            .into_iter()
            .map(|r| [r[0], r[1], r[2], r[3]])
            .collect();
        let scores = scores.slice(s![.., ..self.num_classes]).to_owned();
        debug!("Anchor head decoded {} candidate boxes", boxes.len());
        Ok((boxes, scores))
    }

    /// Row indices of the `nms_pre` best candidates by foreground max score.
    fn top_candidates(&self, scores: &Array2<f32>) -> Vec<usize> {
        let foreground = scores.slice(s![.., ..self.num_classes]);
        let max_scores: Vec<f32> = foreground
            .rows()
            .into_iter()
            .map(|row| row.iter().cloned().fold(f32::NEG_INFINITY, f32::max))
            .collect();

        let mut order: Vec<usize> = (0..max_scores.len()).collect();
        order.sort_by(|&a, &b| {
            max_scores[b]
                .partial_cmp(&max_scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(self.nms_pre);
        order
    }
}

/// `(A * C, H, W)` to `(H * W * A, C)`.
fn flatten_level(map: &ArrayView3<'_, f32>, columns: usize) -> Result<Array2<f32>> {
    let (_, height, width) = map.dim();
    let rows = map.len() / columns.max(1);
    map.view()
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, columns))
        .map_err(|e| {
            DeployError::Postprocess(format!("cannot flatten {}x{} level: {}", height, width, e))
        })
}

fn concat_rows(parts: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| DeployError::Postprocess(e.to_string()))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use pretty_assertions::assert_eq;

    fn head_config(use_sigmoid_cls: bool, nms_pre: usize) -> AnchorHeadConfig {
        AnchorHeadConfig {
            num_classes: 2,
            use_sigmoid_cls,
            strides: vec![10],
            ratios: vec![1.0],
            scales: vec![1.0],
            base_sizes: None,
            center_offset: 0.5,
            nms_pre,
            ..AnchorHeadConfig::default()
        }
    }

    fn post() -> PostProcessingConfig {
        PostProcessingConfig {
            score_threshold: 0.5,
            ..PostProcessingConfig::default()
        }
    }

    /// A 1x2 map with strong logits for class 1 at x=0 and class 0 at x=1.
    fn sigmoid_level() -> (Array3<f32>, Array3<f32>) {
        let mut cls = Array3::from_elem((2, 1, 2), -10.0f32);
        cls[[1, 0, 0]] = 10.0;
        cls[[0, 0, 1]] = 10.0;
        (cls, Array3::zeros((4, 1, 2)))
    }

    #[test]
    fn test_sigmoid_head_decodes_and_nms() {
        let head = AnchorHead::new(&head_config(true, 0), post());
        let (cls, reg) = sigmoid_level();

        let out = head
            .get_bboxes(&[cls.view()], &[reg.view()], (10, 20), true)
            .unwrap();
        let HeadOutput::Detections(dets) = out else {
            panic!("expected detections");
        };
        let mut found: Vec<(usize, [f32; 4])> = dets.iter().map(|d| (d.label, d.bbox)).collect();
        found.sort_by_key(|(label, _)| *label);
        assert_eq!(
            found,
            vec![(0, [10.0, 0.0, 20.0, 10.0]), (1, [0.0, 0.0, 10.0, 10.0])]
        );
    }

    #[test]
    fn test_detections_always_apply_nms() {
        let head = AnchorHead::new(&head_config(true, 0), post());
        let (cls, reg) = sigmoid_level();

        let dets = head.detections(&[cls.view()], &[reg.view()], (10, 20)).unwrap();
        let via_bboxes = head
            .get_bboxes(&[cls.view()], &[reg.view()], (10, 20), true)
            .unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(HeadOutput::Detections(dets), via_bboxes);
    }

    #[test]
    fn test_softmax_head_drops_background() {
        let head = AnchorHead::new(&head_config(false, 0), post());
        assert_eq!(head.cls_out_channels(), 3);

        let mut cls = Array3::zeros((3, 1, 1));
        cls[[2, 0, 0]] = 5.0f32;
        let reg = Array3::zeros((4, 1, 1));

        let out = head
            .get_bboxes(&[cls.view()], &[reg.view()], (10, 10), false)
            .unwrap();
        let HeadOutput::Raw { boxes, scores } = out else {
            panic!("expected raw output");
        };
        assert_eq!(boxes.len(), 1);
        assert_eq!(scores.shape(), &[1, 2]);
        assert!(scores.iter().all(|&s| s < 0.01));
    }

    #[test]
    fn test_nms_pre_keeps_best_candidates() {
        let head = AnchorHead::new(&head_config(true, 1), post());
        let (mut cls, reg) = sigmoid_level();
        cls[[0, 0, 1]] = 12.0;

        let HeadOutput::Raw { boxes, .. } = head
            .get_bboxes(&[cls.view()], &[reg.view()], (10, 20), false)
            .unwrap()
        else {
            panic!("expected raw output");
        };
        assert_eq!(boxes, vec![[10.0, 0.0, 20.0, 10.0]]);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let head = AnchorHead::new(&head_config(true, 0), post());
        let cls = Array3::<f32>::zeros((3, 1, 2));
        let reg = Array3::<f32>::zeros((4, 1, 2));
        assert!(head
            .get_bboxes(&[cls.view()], &[reg.view()], (10, 20), true)
            .is_err());
        assert!(head.get_bboxes(&[], &[], (10, 20), true).is_err());
    }
}

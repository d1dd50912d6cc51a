use image::DynamicImage;
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};
use netdeploy_backend::{BackendWrapper, Tensor, TensorMap};
use tracing::{debug, warn};

use super::{AnchorHead, Detection};
use crate::config::{DeployConfig, DetectionLayout, PostProcessingConfig};
use crate::error::{DeployError, Result};
use crate::preprocess::{ImageMeta, ImagePreprocessor};

/// Object detector over any backend wrapper.
pub struct Detector {
    wrapper: Box<dyn BackendWrapper>,
    preprocessor: ImagePreprocessor,
    input_name: String,
    layout: Layout,
}

enum Layout {
    DetsLabels {
        dets: String,
        labels: String,
        post_processing: PostProcessingConfig,
    },
    AnchorHead {
        head: AnchorHead,
        cls_scores: Vec<String>,
        bbox_preds: Vec<String>,
    },
}

impl Detector {
    pub fn new(wrapper: Box<dyn BackendWrapper>, config: &DeployConfig) -> Result<Self> {
        config.validate()?;
        let detection = &config.codebase.detection;
        let post_processing = config.codebase.post_processing.clone();

        let layout = match detection.layout {
            DetectionLayout::DetsLabels => Layout::DetsLabels {
                dets: detection.dets_output.clone(),
                labels: detection.labels_output.clone(),
                post_processing,
            },
            DetectionLayout::AnchorHead => Layout::AnchorHead {
                head: AnchorHead::new(&detection.anchor_head, post_processing),
                cls_scores: detection.anchor_head.cls_score_outputs.clone(),
                bbox_preds: detection.anchor_head.bbox_pred_outputs.clone(),
            },
        };

        let required: Vec<&String> = match &layout {
            Layout::DetsLabels { dets, labels, .. } => vec![dets, labels],
            Layout::AnchorHead {
                cls_scores,
                bbox_preds,
                ..
            } => cls_scores.iter().chain(bbox_preds).collect(),
        };
        if let Some(missing) = required
            .into_iter()
            .find(|name| !wrapper.output_names().contains(name))
        {
            return Err(DeployError::Config(format!(
                "backend does not fetch detection output '{}'",
                missing
            )));
        }

        Ok(Self {
            wrapper,
            preprocessor: ImagePreprocessor::new(&config.input),
            input_name: config.codebase.input_name.clone(),
            layout,
        })
    }

    pub fn wrapper(&self) -> &dyn BackendWrapper {
        self.wrapper.as_ref()
    }

    /// Detect objects in every image, as one batch.
    ///
    /// Boxes are mapped back to each image's original size.
    pub fn detect(&self, images: &[DynamicImage]) -> Result<Vec<Vec<Detection>>> {
        let batch = self.preprocessor.batch(images)?;
        let metas: Vec<ImageMeta> = images.iter().map(|i| self.preprocessor.meta(i)).collect();

        let mut inputs = TensorMap::with_capacity(1);
        inputs.insert(self.input_name.clone(), batch);
        let outputs = self.wrapper.forward(&inputs)?;

        self.postprocess(&outputs, &metas)
    }

    /// Turn backend outputs for a batch into per-image detections.
    pub fn postprocess(&self, outputs: &TensorMap, metas: &[ImageMeta]) -> Result<Vec<Vec<Detection>>> {
        let per_image = match &self.layout {
            Layout::DetsLabels {
                dets,
                labels,
                post_processing,
            } => decode_dets_labels(
                output(outputs, dets)?,
                output(outputs, labels)?,
                metas.len(),
                post_processing,
            )?,
            Layout::AnchorHead {
                head,
                cls_scores,
                bbox_preds,
            } => {
                let cls = cls_scores
                    .iter()
                    .map(|n| output(outputs, n).map(Tensor::to_f32))
                    .collect::<Result<Vec<_>>>()?;
                let reg = bbox_preds
                    .iter()
                    .map(|n| output(outputs, n).map(Tensor::to_f32))
                    .collect::<Result<Vec<_>>>()?;

                (0..metas.len())
                    .map(|i| {
                        let cls = sample_views(&cls, i)?;
                        let reg = sample_views(&reg, i)?;
                        head.detections(&cls, &reg, self.preprocessor.input_size())
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        Ok(per_image
            .into_iter()
            .zip(metas)
            .map(|(dets, meta)| {
                dets.into_iter()
                    .map(|d| Detection::new(meta.rescale_box(d.bbox), d.score, d.label))
                    .collect()
            })
            .collect())
    }
}

fn output<'a>(outputs: &'a TensorMap, name: &str) -> Result<&'a Tensor> {
    outputs
        .get(name)
        .ok_or_else(|| DeployError::Postprocess(format!("missing output '{}'", name)))
}

/// Per-level `(C, H, W)` views of sample `index`.
fn sample_views(levels: &[ArrayD<f32>], index: usize) -> Result<Vec<ArrayView3<'_, f32>>> {
    levels
        .iter()
        .map(|level| {
            if level.ndim() != 4 || index >= level.shape()[0] {
                return Err(DeployError::Postprocess(format!(
                    "head output of shape {:?} has no sample {}",
                    level.shape(),
                    index
                )));
            }
            level
                .index_axis(Axis(0), index)
                .into_dimensionality::<Ix3>()
                .map_err(|e| DeployError::Postprocess(e.to_string()))
        })
        .collect()
}

/// `dets [N, K, 5]` and `labels [N, K]` into per-image detections.
fn decode_dets_labels(
    dets: &Tensor,
    labels: &Tensor,
    batch: usize,
    params: &PostProcessingConfig,
) -> Result<Vec<Vec<Detection>>> {
    let dets = dets.to_f32();
    let labels = labels.to_f32();
    let shape = dets.shape();
    if shape.len() != 3 || shape[2] != 5 || shape[0] != batch {
        return Err(DeployError::Postprocess(format!(
            "dets must be [{}, K, 5], got {:?}",
            batch, shape
        )));
    }
    if labels.shape() != &shape[..2] {
        return Err(DeployError::Postprocess(format!(
            "labels shape {:?} does not match dets {:?}",
            labels.shape(),
            shape
        )));
    }

    let mut results = Vec::with_capacity(batch);
    for i in 0..batch {
        let mut image = Vec::new();
        for k in 0..shape[1] {
            let score = dets[[i, k, 4]];
            if score <= params.score_threshold {
                continue;
            }
            let label = labels[[i, k]];
            if label < 0.0 {
                warn!("Skipping detection {} with negative label {}", k, label);
                continue;
            }
            let bbox = [dets[[i, k, 0]], dets[[i, k, 1]], dets[[i, k, 2]], dets[[i, k, 3]]];
            image.push(Detection::new(bbox, score, label as usize));
        }
        if params.keep_top_k > 0 {
            image.truncate(params.keep_top_k);
        }
        debug!("Image {}: {} detections", i, image.len());
        results.push(image);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdeploy_backend::{BackendKind, Result as BackendResult};
    use pretty_assertions::assert_eq;

    /// Replays fixed outputs regardless of input.
    struct FixedOutputs {
        names: Vec<String>,
        outputs: TensorMap,
    }

    impl BackendWrapper for FixedOutputs {
        fn forward(&self, inputs: &TensorMap) -> BackendResult<TensorMap> {
            netdeploy_backend::validate_inputs(inputs)?;
            Ok(self.outputs.clone())
        }

        fn output_names(&self) -> &[String] {
            &self.names
        }

        fn backend(&self) -> BackendKind {
            BackendKind::Ncnn
        }

        fn backend_file_count() -> usize {
            2
        }
    }

    fn dets_labels_backend() -> Box<dyn BackendWrapper> {
        let dets = Tensor::from_f32(
            vec![
                4.0, 4.0, 8.0, 8.0, 0.9, //
                0.0, 0.0, 2.0, 2.0, 0.01,
            ],
            &[1, 2, 5],
        )
        .unwrap();
        let labels = Tensor::from_i64(vec![3, 1], &[1, 2]).unwrap();
        Box::new(FixedOutputs {
            names: vec!["dets".to_string(), "labels".to_string()],
            outputs: [("dets", dets), ("labels", labels)].into_iter().collect(),
        })
    }

    fn small_config() -> DeployConfig {
        let mut config = DeployConfig::default();
        config.input.height = 16;
        config.input.width = 16;
        config
    }

    #[test]
    fn test_dets_labels_rescaled_to_original() {
        let detector = Detector::new(dets_labels_backend(), &small_config()).unwrap();
        let image = DynamicImage::new_rgb8(32, 8);

        let results = detector.detect(&[image]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], vec![Detection::new([8.0, 2.0, 16.0, 4.0], 0.9, 3)]);
    }

    #[test]
    fn test_missing_output_rejected_at_construction() {
        let mut config = small_config();
        config.codebase.detection.dets_output = "boxes".to_string();
        let err = Detector::new(dets_labels_backend(), &config).err().unwrap();
        assert!(err.to_string().contains("boxes"));
    }

    #[test]
    fn test_anchor_head_layout() {
        let mut config = small_config();
        config.codebase.post_processing.score_threshold = 0.5;
        config.codebase.detection.layout = crate::config::DetectionLayout::AnchorHead;
        let head = &mut config.codebase.detection.anchor_head;
        head.num_classes = 1;
        head.strides = vec![16];
        head.ratios = vec![1.0];
        head.scales = vec![1.0];
        head.center_offset = 0.5;
        head.cls_score_outputs = vec!["cls".to_string()];
        head.bbox_pred_outputs = vec!["reg".to_string()];

        let cls = Tensor::from_f32(vec![10.0], &[1, 1, 1, 1]).unwrap();
        let reg = Tensor::from_f32(vec![0.0; 4], &[1, 4, 1, 1]).unwrap();
        let backend = Box::new(FixedOutputs {
            names: vec!["cls".to_string(), "reg".to_string()],
            outputs: [("cls", cls), ("reg", reg)].into_iter().collect(),
        });

        let detector = Detector::new(backend, &config).unwrap();
        let results = detector.detect(&[DynamicImage::new_rgb8(32, 32)]).unwrap();
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[0][0].bbox, [0.0, 0.0, 32.0, 32.0]);
        assert_eq!(results[0][0].label, 0);
    }
}

//! Deploy configuration: which backend to load, what the model computes,
//! and how inputs are prepared.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use netdeploy_backend::BackendKind;

use crate::error::{DeployError, Result};

/// Main configuration for a deployed model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Backend selection and artifacts.
    pub backend: BackendConfig,

    /// Task and post-processing settings.
    pub codebase: CodebaseConfig,

    /// Input preparation.
    pub input: InputConfig,
}

/// Backend names as they appear in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Ncnn,
    #[serde(alias = "ort")]
    OnnxRuntime,
    Tract,
}

impl From<BackendType> for BackendKind {
    fn from(kind: BackendType) -> Self {
        match kind {
            BackendType::Ncnn => BackendKind::Ncnn,
            BackendType::OnnxRuntime => BackendKind::OnnxRuntime,
            BackendType::Tract => BackendKind::Tract,
        }
    }
}

impl From<BackendKind> for BackendType {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Ncnn => BackendType::Ncnn,
            BackendKind::OnnxRuntime => BackendType::OnnxRuntime,
            BackendKind::Tract => BackendType::Tract,
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend to run the model with.
    pub kind: BackendType,

    /// Artifact paths: `[param, bin]` for ncnn, `[model.onnx]` otherwise.
    pub files: Vec<PathBuf>,

    /// Outputs to fetch. Falls back to what the model declares.
    pub output_names: Option<Vec<String>>,

    /// Run batch samples concurrently (ncnn only).
    pub parallel: bool,

    /// Register the deploy-time custom layers before loading (ncnn only).
    pub custom_layers: bool,

    /// Concrete input shape used to optimise the tract plan.
    pub input_shape: Vec<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendType::Ncnn,
            files: vec![PathBuf::from("end2end.param"), PathBuf::from("end2end.bin")],
            output_names: None,
            parallel: false,
            custom_layers: true,
            input_shape: vec![1, 3, 640, 640],
        }
    }
}

/// What the model computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    ObjectDetection,
    SuperResolution,
    /// Outputs are reported as-is.
    Raw,
}

/// Codebase (task) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodebaseConfig {
    pub task: Task,

    /// Name the preprocessed image batch is bound to.
    pub input_name: String,

    /// Detection NMS settings.
    pub post_processing: PostProcessingConfig,

    /// Detection output layout.
    pub detection: DetectionConfig,
}

impl Default for CodebaseConfig {
    fn default() -> Self {
        Self {
            task: Task::ObjectDetection,
            input_name: "input".to_string(),
            post_processing: PostProcessingConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

/// Multi-class NMS parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessingConfig {
    /// Boxes scoring at or below this are dropped (0.0 - 1.0).
    pub score_threshold: f32,

    /// Boxes overlapping a kept box above this IoU are suppressed (0.0 - 1.0).
    pub iou_threshold: f32,

    /// Per-class cap after suppression (0 = unlimited).
    pub max_output_boxes_per_class: usize,

    /// Candidates kept by max class score before NMS (0 = all).
    pub pre_top_k: usize,

    /// Detections kept per image after NMS (0 = all).
    pub keep_top_k: usize,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.05,
            iou_threshold: 0.5,
            max_output_boxes_per_class: 200,
            pre_top_k: 5000,
            keep_top_k: 100,
        }
    }
}

/// How detection results leave the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionLayout {
    /// The graph emits `dets [N, K, 5]` and `labels [N, K]`.
    DetsLabels,
    /// The graph emits raw per-level head outputs.
    AnchorHead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub layout: DetectionLayout,

    pub dets_output: String,

    pub labels_output: String,

    pub anchor_head: AnchorHeadConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            layout: DetectionLayout::DetsLabels,
            dets_output: "dets".to_string(),
            labels_output: "labels".to_string(),
            anchor_head: AnchorHeadConfig::default(),
        }
    }
}

/// Anchor head settings. Defaults describe a RetinaNet head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorHeadConfig {
    /// Foreground classes.
    pub num_classes: usize,

    /// Sigmoid scores per class; otherwise softmax with a trailing background column.
    pub use_sigmoid_cls: bool,

    /// Feature map strides, one per level.
    pub strides: Vec<usize>,

    pub ratios: Vec<f32>,

    pub scales: Vec<f32>,

    /// Base anchor sizes per level. Defaults to the strides.
    pub base_sizes: Option<Vec<f32>>,

    pub center_offset: f32,

    pub target_means: [f32; 4],

    pub target_stds: [f32; 4],

    /// Per-level candidates kept before NMS (0 = all).
    pub nms_pre: usize,

    /// Classification output per level, finest first.
    pub cls_score_outputs: Vec<String>,

    /// Box regression output per level, finest first.
    pub bbox_pred_outputs: Vec<String>,
}

impl Default for AnchorHeadConfig {
    fn default() -> Self {
        let strides = vec![8, 16, 32, 64, 128];
        let levels = strides.len();
        Self {
            num_classes: 80,
            use_sigmoid_cls: true,
            strides,
            ratios: vec![0.5, 1.0, 2.0],
            // octave base scale 4, three scales per octave
            scales: (0..3).map(|i| 4.0 * 2f32.powf(i as f32 / 3.0)).collect(),
            base_sizes: None,
            center_offset: 0.0,
            target_means: [0.0; 4],
            target_stds: [1.0; 4],
            nms_pre: 1000,
            cls_score_outputs: (0..levels).map(|i| format!("cls_score_{}", i)).collect(),
            bbox_pred_outputs: (0..levels).map(|i| format!("bbox_pred_{}", i)).collect(),
        }
    }
}

/// Input preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Resize height.
    pub height: u32,

    /// Resize width.
    pub width: u32,

    /// Per-channel mean on the 0-255 pixel scale.
    pub mean: [f32; 3],

    /// Per-channel std on the 0-255 pixel scale.
    pub std: [f32; 3],

    /// Feed channels in RGB order; BGR when false.
    pub to_rgb: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            height: 640,
            width: 640,
            mean: [123.675, 116.28, 103.53],
            std: [58.395, 57.12, 57.375],
            to_rgb: true,
        }
    }
}

impl DeployConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let kind = BackendKind::from(self.backend.kind);
        if self.backend.files.len() != kind.file_count() {
            return Err(DeployError::Config(format!(
                "{} expects {} artifact file(s), got {}",
                kind,
                kind.file_count(),
                self.backend.files.len()
            )));
        }

        let post = &self.codebase.post_processing;
        for (name, value) in [
            ("score_threshold", post.score_threshold),
            ("iou_threshold", post.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DeployError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.input.height == 0 || self.input.width == 0 {
            return Err(DeployError::Config("input size must be non-zero".to_string()));
        }
        if self.input.std.iter().any(|&s| s == 0.0) {
            return Err(DeployError::Config("input std must be non-zero".to_string()));
        }

        if self.codebase.task == Task::ObjectDetection
            && self.codebase.detection.layout == DetectionLayout::AnchorHead
        {
            let head = &self.codebase.detection.anchor_head;
            let levels = head.strides.len();
            if levels == 0 || head.ratios.is_empty() || head.scales.is_empty() {
                return Err(DeployError::Config(
                    "anchor head needs strides, ratios and scales".to_string(),
                ));
            }
            if head.cls_score_outputs.len() != levels || head.bbox_pred_outputs.len() != levels {
                return Err(DeployError::Config(format!(
                    "anchor head has {} levels but {} cls_score and {} bbox_pred outputs",
                    levels,
                    head.cls_score_outputs.len(),
                    head.bbox_pred_outputs.len()
                )));
            }
            if head.base_sizes.as_ref().is_some_and(|b| b.len() != levels) {
                return Err(DeployError::Config(
                    "anchor head base_sizes must match strides".to_string(),
                ));
            }
        }
        Ok(())
    }
}

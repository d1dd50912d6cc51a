//! Detection post-processing.
//!
//! Turns backend outputs into per-image [`Detection`] lists, either from a
//! graph that already ends in NMS or from raw anchor-head outputs.

mod anchor;
mod bbox_coder;
mod detector;
mod head;
mod nms;

pub use anchor::AnchorGenerator;
pub use bbox_coder::DeltaXywhCoder;
pub use detector::Detector;
pub use head::{AnchorHead, HeadOutput};
pub use nms::{iou, multiclass_nms};

use serde::{Deserialize, Serialize};

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Box corners `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub label: usize,
}

impl Detection {
    pub fn new(bbox: [f32; 4], score: f32, label: usize) -> Self {
        Self { bbox, score, label }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

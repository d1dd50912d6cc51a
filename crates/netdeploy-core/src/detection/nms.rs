use std::cmp::Ordering;

use ndarray::{ArrayView2, Axis};

use super::Detection;
use crate::config::PostProcessingConfig;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    if x2 < x1 || y2 < y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = area(a) + area(b) - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Multi-class NMS for one image.
///
/// `boxes` holds one box per candidate and `scores` is `(candidates,
/// classes)`. Candidates are first cut to the `pre_top_k` best by max class
/// score. Each class then keeps boxes scoring above `score_threshold`, greedily
/// suppressing any box whose IoU with a kept box of that class exceeds
/// `iou_threshold`, up to `max_output_boxes_per_class`. The survivors of all
/// classes are sorted by score and cut to `keep_top_k`.
pub fn multiclass_nms(
    boxes: &[[f32; 4]],
    scores: ArrayView2<'_, f32>,
    params: &PostProcessingConfig,
) -> Vec<Detection> {
    let num_boxes = boxes.len().min(scores.nrows());

    let mut candidates: Vec<usize> = (0..num_boxes).collect();
    if params.pre_top_k > 0 && num_boxes > params.pre_top_k {
        let max_scores: Vec<f32> = scores
            .axis_iter(Axis(0))
            .take(num_boxes)
            .map(|row| row.iter().cloned().fold(f32::NEG_INFINITY, f32::max))
            .collect();
        candidates.sort_by(|&a, &b| by_score_desc(max_scores[a], max_scores[b]));
        candidates.truncate(params.pre_top_k);
    }

    let mut detections = Vec::new();
    for (class, column) in scores.axis_iter(Axis(1)).enumerate() {
        let mut ranked: Vec<(usize, f32)> = candidates
            .iter()
            .map(|&i| (i, column[i]))
            .filter(|&(_, score)| score > params.score_threshold)
            .collect();
        ranked.sort_by(|a, b| by_score_desc(a.1, b.1));

        let mut kept: Vec<usize> = Vec::new();
        for (index, score) in ranked {
            if params.max_output_boxes_per_class > 0 && kept.len() >= params.max_output_boxes_per_class {
                break;
            }
            let suppressed = kept
                .iter()
                .any(|&k| iou(&boxes[k], &boxes[index]) > params.iou_threshold);
            if !suppressed {
                kept.push(index);
                detections.push(Detection::new(boxes[index], score, class));
            }
        }
    }

    detections.sort_by(|a, b| by_score_desc(a.score, b.score));
    if params.keep_top_k > 0 {
        detections.truncate(params.keep_top_k);
    }
    detections
}

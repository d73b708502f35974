//! RetinaFace output decoding: anchor-relative deltas to absolute face boxes.

use crate::anchors::{Anchor, AnchorSet};
use crate::types::FaceBox;
use serde::{Deserialize, Serialize};

// --- Named constants (RetinaFace training convention) ---
const RETINA_CONFIDENCE_THRESHOLD: f32 = 0.6;
const RETINA_CENTER_VARIANCE: f32 = 0.1;
const RETINA_SIZE_VARIANCE: f32 = 0.2;
const RETINA_NMS_THRESHOLD: f32 = 0.4;

/// How many faces a decode pass returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    /// Only the highest-confidence face.
    #[default]
    Single,
    /// Every surviving face after non-maximum suppression.
    Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub confidence_threshold: f32,
    pub center_variance: f32,
    pub size_variance: f32,
    pub nms_threshold: f32,
    pub mode: DetectionMode,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: RETINA_CONFIDENCE_THRESHOLD,
            center_variance: RETINA_CENTER_VARIANCE,
            size_variance: RETINA_SIZE_VARIANCE,
            nms_threshold: RETINA_NMS_THRESHOLD,
            mode: DetectionMode::Single,
        }
    }
}

/// Decode raw detector tensors into face boxes in `frame_width × frame_height` pixels.
///
/// `conf` holds two scores per anchor (background, face); `loc` holds four
/// deltas per anchor (dx, dy, dw, dh). Boxes are sorted by confidence, highest
/// first. An empty result means no face was detected.
pub fn decode(
    loc: &[f32],
    conf: &[f32],
    anchors: &AnchorSet,
    frame_width: u32,
    frame_height: u32,
    config: &DecoderConfig,
) -> Vec<FaceBox> {
    let n = anchors.len().min(conf.len() / 2).min(loc.len() / 4);
    if conf.len() != anchors.len() * 2 || loc.len() != anchors.len() * 4 {
        tracing::warn!(
            anchors = anchors.len(),
            conf = conf.len(),
            loc = loc.len(),
            "detector output does not match anchor set; decoding common prefix"
        );
    }

    let mut candidates = Vec::new();
    for (i, anchor) in anchors.as_slice()[..n].iter().enumerate() {
        let score = conf[i * 2 + 1];
        // NaN scores never pass.
        if !(score >= config.confidence_threshold) {
            continue;
        }
        let delta = [loc[i * 4], loc[i * 4 + 1], loc[i * 4 + 2], loc[i * 4 + 3]];
        if let Some(face) = decode_box(anchor, delta, score, frame_width, frame_height, config) {
            candidates.push(face);
        }
    }

    tracing::trace!(survivors = candidates.len(), "decoded detector output");

    match config.mode {
        DetectionMode::Single => best_candidate(candidates).into_iter().collect(),
        DetectionMode::Multi => nms(candidates, config.nms_threshold),
    }
}

/// Apply one anchor's regression deltas, then map to clamped pixel coordinates.
fn decode_box(
    anchor: &Anchor,
    delta: [f32; 4],
    score: f32,
    frame_width: u32,
    frame_height: u32,
    config: &DecoderConfig,
) -> Option<FaceBox> {
    let cx = anchor.cx + delta[0] * config.center_variance * anchor.width;
    let cy = anchor.cy + delta[1] * config.center_variance * anchor.height;
    let w = anchor.width * (delta[2] * config.size_variance).exp();
    let h = anchor.height * (delta[3] * config.size_variance).exp();

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let x1 = ((cx - w / 2.0) * fw).round().clamp(0.0, fw);
    let y1 = ((cy - h / 2.0) * fh).round().clamp(0.0, fh);
    let x2 = ((cx + w / 2.0) * fw).round().clamp(0.0, fw);
    let y2 = ((cy + h / 2.0) * fh).round().clamp(0.0, fh);

    if !(x2 > x1 && y2 > y1) {
        return None;
    }

    Some(FaceBox {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
        confidence: score,
    })
}

/// Highest-confidence box; on equal scores the earliest anchor wins.
fn best_candidate(candidates: Vec<FaceBox>) -> Option<FaceBox> {
    let mut best: Option<FaceBox> = None;
    for face in candidates {
        if best.map_or(true, |b| face.confidence > b.confidence) {
            best = Some(face);
        }
    }
    best
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    // Stable sort keeps anchor order among equal scores.
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].iou(&detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

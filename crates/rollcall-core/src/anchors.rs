//! Prior boxes for the RetinaFace detector head.
//!
//! The detector predicts one (score, delta) pair per anchor, so the order produced
//! here must match the order of the network's output rows:
//! stride-major, then row-major over the feature map, then column, then size.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reference box in normalized [0, 1] image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

/// One feature-map level: its downsampling stride and base box sizes in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLevel {
    pub stride: u32,
    pub min_sizes: Vec<f32>,
}

/// Input resolution plus per-stride levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub width: u32,
    pub height: u32,
    pub levels: Vec<FeatureLevel>,
}

impl AnchorConfig {
    /// RetinaFace MobileNet/ResNet layout for a square input.
    pub fn retinaface(input_size: u32) -> Self {
        Self {
            width: input_size,
            height: input_size,
            levels: vec![
                FeatureLevel { stride: 8, min_sizes: vec![16.0, 32.0] },
                FeatureLevel { stride: 16, min_sizes: vec![64.0, 128.0] },
                FeatureLevel { stride: 32, min_sizes: vec![256.0, 512.0] },
            ],
        }
    }

    /// Number of anchors `generate` will produce.
    pub fn anchor_count(&self) -> usize {
        self.levels
            .iter()
            .map(|level| {
                let (fm_w, fm_h) = self.feature_map(level.stride);
                fm_w as usize * fm_h as usize * level.min_sizes.len()
            })
            .sum()
    }

    fn feature_map(&self, stride: u32) -> (u32, u32) {
        (self.width.div_ceil(stride), self.height.div_ceil(stride))
    }

    /// Generate the full anchor sequence. Pure function of the config.
    pub fn generate(&self) -> AnchorSet {
        let w = self.width as f32;
        let h = self.height as f32;
        let mut anchors = Vec::with_capacity(self.anchor_count());

        for level in &self.levels {
            let (fm_w, fm_h) = self.feature_map(level.stride);
            let step = level.stride as f32;
            for y in 0..fm_h {
                for x in 0..fm_w {
                    for &size in &level.min_sizes {
                        anchors.push(Anchor {
                            cx: (x as f32 + 0.5) * step / w,
                            cy: (y as f32 + 0.5) * step / h,
                            width: size / w,
                            height: size / h,
                        });
                    }
                }
            }
        }

        tracing::debug!(count = anchors.len(), width = self.width, height = self.height, "generated anchors");
        AnchorSet {
            anchors: anchors.into(),
        }
    }
}

/// Immutable, cheaply clonable anchor sequence.
#[derive(Debug, Clone)]
pub struct AnchorSet {
    anchors: Arc<[Anchor]>,
}

impl AnchorSet {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn as_slice(&self) -> &[Anchor] {
        &self.anchors
    }
}

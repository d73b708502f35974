//! ArcFace descriptor extraction.
//!
//! Resizes a face crop to 112×112, runs the w600k_r50 embedding network and
//! L2-normalizes its output into a [`Descriptor`].

use crate::models::{EmbeddingModel, ModelError};
use crate::types::{Descriptor, DescriptorError};
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (different from RetinaFace!) ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization to [-1, 1]
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("face crop has zero area")]
    InvalidFaceCrop,
    #[error("embedder: {0}")]
    Model(#[from] ModelError),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding output unusable: {0}")]
    Degenerate(#[from] DescriptorError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub input_size: u32,
    pub descriptor_dim: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            input_size: ARCFACE_INPUT_SIZE,
            descriptor_dim: ARCFACE_EMBEDDING_DIM,
        }
    }
}

/// ArcFace-based descriptor extractor. Stateless across calls.
pub struct DescriptorExtractor {
    model: Box<dyn EmbeddingModel>,
    config: ExtractorConfig,
}

impl DescriptorExtractor {
    pub fn new(model: Box<dyn EmbeddingModel>, config: ExtractorConfig) -> Self {
        Self { model, config }
    }

    pub fn descriptor_dim(&self) -> usize {
        self.config.descriptor_dim
    }

    /// Extract a unit-norm descriptor from an RGB face crop.
    pub fn embed(&self, crop: &RgbImage) -> Result<Descriptor, ExtractorError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ExtractorError::InvalidFaceCrop);
        }

        let input = self.preprocess(crop);
        let raw = self.model.embed(&input)?;

        if raw.len() != self.config.descriptor_dim {
            return Err(ExtractorError::DimensionMismatch {
                expected: self.config.descriptor_dim,
                actual: raw.len(),
            });
        }

        Ok(Descriptor::from_raw(raw)?)
    }

    /// Resize the crop and build an RGB NCHW tensor scaled to [-1, 1].
    fn preprocess(&self, crop: &RgbImage) -> Array4<f32> {
        let size = self.config.input_size;
        let resized = imageops::resize(crop, size, size, FilterType::Triangle);

        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for (c, &value) in pixel.0.iter().enumerate() {
                tensor[[0, c, y, x]] = (value as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

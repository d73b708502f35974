//! Face localization: resize, normalize, run RetinaFace, decode, crop.

use crate::anchors::{AnchorConfig, AnchorSet};
use crate::decoder::{self, DecoderConfig};
use crate::frame::{Frame, FrameError};
use crate::models::{DetectionModel, ModelError};
use crate::types::FaceBox;
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (different from ArcFace!) ---
const RETINA_INPUT_SIZE: u32 = 320;
/// Per-channel means in B, G, R order; the network was trained on BGR input.
const RETINA_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

#[derive(Error, Debug)]
pub enum LocalizerError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] FrameError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Square network input resolution.
    pub input_size: u32,
    pub mean_bgr: [f32; 3],
    pub decoder: DecoderConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: RETINA_INPUT_SIZE,
            mean_bgr: RETINA_MEAN_BGR,
            decoder: DecoderConfig::default(),
        }
    }
}

/// A detected face with its pixels copied out of the source frame.
#[derive(Debug, Clone)]
pub struct LocatedFace {
    pub face: FaceBox,
    pub crop: RgbImage,
}

/// RetinaFace-based face localizer. Anchors are generated once at construction.
pub struct FaceLocalizer {
    model: Box<dyn DetectionModel>,
    anchors: AnchorSet,
    config: DetectorConfig,
}

impl FaceLocalizer {
    pub fn new(model: Box<dyn DetectionModel>, config: DetectorConfig) -> Self {
        let anchors = AnchorConfig::retinaface(config.input_size).generate();
        Self {
            model,
            anchors,
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces, sorted by confidence. Fails with `NoFaceDetected` when none survive.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<FaceBox>, LocalizerError> {
        let input = self.preprocess(frame);
        let raw = self.model.detect(&input)?;
        let expected = self.anchors.len();
        if raw.conf.len() != expected * 2 || raw.loc.len() != expected * 4 {
            return Err(ModelError::InferenceFailed(format!(
                "detector produced {} scores and {} deltas for {expected} anchors",
                raw.conf.len(),
                raw.loc.len()
            ))
            .into());
        }

        // The input was a plain (non-letterboxed) resize, so normalized
        // coordinates map straight onto the original frame.
        let faces = decoder::decode(
            &raw.loc,
            &raw.conf,
            &self.anchors,
            frame.width(),
            frame.height(),
            &self.config.decoder,
        );

        if faces.is_empty() {
            return Err(LocalizerError::NoFaceDetected);
        }
        tracing::debug!(
            count = faces.len(),
            best = faces[0].confidence,
            "faces located"
        );
        Ok(faces)
    }

    /// Detect faces and crop each one out of the frame.
    pub fn locate(&self, frame: &Frame) -> Result<Vec<LocatedFace>, LocalizerError> {
        let faces = self.detect(frame)?;
        Ok(faces
            .into_iter()
            .map(|face| LocatedFace {
                crop: frame.crop(&face),
                face,
            })
            .collect())
    }

    /// Decode encoded image bytes, then `locate`.
    pub fn locate_bytes(&self, bytes: &[u8]) -> Result<Vec<LocatedFace>, LocalizerError> {
        let frame = Frame::decode(bytes)?;
        self.locate(&frame)
    }

    /// Resize to the network input and build a mean-subtracted BGR NCHW tensor.
    fn preprocess(&self, frame: &Frame) -> Array4<f32> {
        let size = self.config.input_size;
        let resized = imageops::resize(frame.pixels(), size, size, FilterType::Triangle);
        let [mean_b, mean_g, mean_r] = self.config.mean_bgr;

        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = b as f32 - mean_b;
            tensor[[0, 1, y, x]] = g as f32 - mean_g;
            tensor[[0, 2, y, x]] = r as f32 - mean_r;
        }

        tensor
    }
}

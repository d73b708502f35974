//! A decoded still image owned by the calling request.

use crate::types::FaceBox;
use image::{imageops, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero area")]
    Empty,
    #[error("invalid pixel buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Byte order of a packed 3-channel pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// A decoded image, stored internally as packed RGB.
#[derive(Clone)]
pub struct Frame {
    pixels: RgbImage,
}

impl Frame {
    /// Decode an encoded image (JPEG, PNG, ...) from memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let pixels = image::load_from_memory(bytes)?.to_rgb8();
        Self::from_rgb(pixels)
    }

    /// Wrap a raw packed 3-channel buffer.
    pub fn from_raw(
        width: u32,
        height: u32,
        order: ChannelOrder,
        mut data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        if order == ChannelOrder::Bgr {
            data.chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
        }
        let pixels = RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
            expected,
            actual: 0,
        })?;
        Self::from_rgb(pixels)
    }

    pub fn from_rgb(pixels: RgbImage) -> Result<Self, FrameError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Copy out the region covered by `face`, clipped to the frame.
    pub fn crop(&self, face: &FaceBox) -> RgbImage {
        let x = face.x.min(self.width());
        let y = face.y.min(self.height());
        let w = face.width.min(self.width() - x);
        let h = face.height.min(self.height() - y);
        imageops::crop_imm(&self.pixels, x, y, w, h).to_image()
    }
}

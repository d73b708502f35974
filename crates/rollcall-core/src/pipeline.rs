//! Recognition pipeline: image → faces → descriptors → match → attendance.
//!
//! Stages run sequentially within one call. The registry is read through a
//! single snapshot per call; nothing is written to the registry or the stores
//! until a stage has fully completed.

use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::frame::{Frame, FrameError};
use crate::gate::{AttendanceGate, MarkOutcome, StoreError};
use crate::localizer::{FaceLocalizer, LocalizerError};
use crate::log::{MemoryRecognitionLog, RecognitionEntry, RecognitionSink};
use crate::matcher::{Matcher, MatcherKind};
use crate::models::ModelError;
use crate::registry::{IdentityRecord, IdentityRegistry, IdentityStore, RegistryError};
use crate::types::{Descriptor, FaceBox, MatchResult, Period};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid face crop")]
    InvalidFaceCrop,
    #[error("detection failed: {0}")]
    Detection(ModelError),
    #[error("descriptor extraction failed: {0}")]
    Extraction(ExtractorError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl PipelineError {
    /// Problems with one input image, as opposed to the models or stores.
    pub fn is_image_problem(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidImage(_)
                | PipelineError::NoFaceDetected
                | PipelineError::InvalidFaceCrop
                | PipelineError::Extraction(ExtractorError::Degenerate(_))
        )
    }
}

impl From<FrameError> for PipelineError {
    fn from(err: FrameError) -> Self {
        PipelineError::InvalidImage(err.to_string())
    }
}

impl From<LocalizerError> for PipelineError {
    fn from(err: LocalizerError) -> Self {
        match err {
            LocalizerError::InvalidImage(e) => e.into(),
            LocalizerError::NoFaceDetected => PipelineError::NoFaceDetected,
            LocalizerError::Model(e) => PipelineError::Detection(e),
        }
    }
}

impl From<ExtractorError> for PipelineError {
    fn from(err: ExtractorError) -> Self {
        match err {
            ExtractorError::InvalidFaceCrop => PipelineError::InvalidFaceCrop,
            other => PipelineError::Extraction(other),
        }
    }
}

/// An enrollment image that was skipped, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollReport {
    pub id: String,
    pub name: String,
    pub used: usize,
    pub skipped: Vec<SkippedImage>,
}

/// What happened to the attendance side effect of one recognized face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Marked,
    AlreadyMarked,
    /// The match was not accepted, so no mark was attempted.
    NotAttempted,
    /// The match stands; only the mark failed and may be retried.
    Failed { reason: String },
}

impl From<MarkOutcome> for AttendanceStatus {
    fn from(outcome: MarkOutcome) -> Self {
        match outcome {
            MarkOutcome::Marked => AttendanceStatus::Marked,
            MarkOutcome::AlreadyMarked => AttendanceStatus::AlreadyMarked,
        }
    }
}

/// Per-face outcome of a recognition call.
#[derive(Debug, Clone, Serialize)]
pub struct FaceRecognition {
    /// Position of this face in confidence order within the call.
    pub face_index: usize,
    pub attempt_id: Uuid,
    pub face: FaceBox,
    #[serde(rename = "match")]
    pub result: MatchResult,
    pub attendance: AttendanceStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Recognition {
    NoFace,
    Faces { faces: Vec<FaceRecognition> },
}

pub struct Pipeline {
    localizer: FaceLocalizer,
    extractor: DescriptorExtractor,
    registry: Arc<IdentityRegistry>,
    matcher: Box<dyn Matcher>,
    gate: AttendanceGate,
    log: Arc<dyn RecognitionSink>,
    identities: Option<Arc<dyn IdentityStore>>,
}

impl Pipeline {
    /// A pipeline with an empty registry, the default cosine matcher and an
    /// in-memory recognition log.
    pub fn new(localizer: FaceLocalizer, extractor: DescriptorExtractor, gate: AttendanceGate) -> Self {
        Self {
            localizer,
            extractor,
            registry: Arc::new(IdentityRegistry::new()),
            matcher: MatcherKind::default().build(),
            gate,
            log: Arc::new(MemoryRecognitionLog::new()),
            identities: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<IdentityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn RecognitionSink>) -> Self {
        self.log = log;
        self
    }

    pub fn with_identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identities = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &AttendanceGate {
        &self.gate
    }

    pub fn log(&self) -> &Arc<dyn RecognitionSink> {
        &self.log
    }

    /// Enroll `id` from several images. Unusable images are skipped; at least one
    /// must yield a face.
    pub fn enroll(&self, id: &str, name: &str, images: &[Vec<u8>]) -> Result<EnrollReport, PipelineError> {
        let mut samples = Vec::with_capacity(images.len());
        let mut skipped = Vec::new();

        for (index, bytes) in images.iter().enumerate() {
            match self.enrollment_sample(bytes) {
                Ok(descriptor) => samples.push(descriptor),
                Err(err) if err.is_image_problem() => {
                    tracing::warn!(id, index, error = %err, "skipping enrollment image");
                    skipped.push(SkippedImage {
                        index,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        if samples.is_empty() {
            return Err(PipelineError::InvalidImage(format!(
                "no usable face in {} enrollment image(s)",
                images.len()
            )));
        }

        let used = samples.len();
        let record = IdentityRecord::from_samples(id, name, samples)?;
        // Persisting inside the registry's writer section keeps the store and the
        // published snapshot in the same order under concurrent re-enrollment.
        self.registry.insert_with(record, |record| match &self.identities {
            Some(store) => store.save_identity(record).map_err(PipelineError::from),
            None => Ok(()),
        })?;

        tracing::info!(id, name, used, skipped = skipped.len(), "identity enrolled");
        Ok(EnrollReport {
            id: id.to_string(),
            name: name.to_string(),
            used,
            skipped,
        })
    }

    /// Best face of one enrollment image.
    fn enrollment_sample(&self, bytes: &[u8]) -> Result<Descriptor, PipelineError> {
        let frame = Frame::decode(bytes)?;
        let faces = self.localizer.locate(&frame)?;
        let best = faces.first().ok_or(PipelineError::NoFaceDetected)?;
        Ok(self.extractor.embed(&best.crop)?)
    }

    /// Recognize every located face in an encoded image and mark attendance for
    /// accepted matches.
    pub fn recognize(
        &self,
        image: &[u8],
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<Recognition, PipelineError> {
        let frame = Frame::decode(image)?;
        self.recognize_frame(&frame, date, period)
    }

    pub fn recognize_frame(
        &self,
        frame: &Frame,
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<Recognition, PipelineError> {
        let located = match self.localizer.locate(frame) {
            Ok(faces) => faces,
            Err(LocalizerError::NoFaceDetected) => {
                tracing::debug!(width = frame.width(), height = frame.height(), "recognize: no face");
                return Ok(Recognition::NoFace);
            }
            Err(err) => return Err(err.into()),
        };

        // Embed everything first so a failure leaves no marks behind.
        let descriptors = located
            .iter()
            .map(|face| self.extractor.embed(&face.crop))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = self.registry.snapshot();
        let mut faces = Vec::with_capacity(located.len());

        for (face_index, (face, descriptor)) in located.into_iter().zip(descriptors).enumerate() {
            let result = self.matcher.compare(&descriptor, &snapshot);
            let attempt_id = Uuid::new_v4();

            let entry = RecognitionEntry::from_match(attempt_id, &result, period.clone());
            if let Err(err) = self.log.append(&entry) {
                tracing::warn!(%attempt_id, error = %err, "recognition log append failed");
            }

            let attendance = match (&result.identity, &result.name) {
                (Some(id), Some(name)) if result.is_accepted() => {
                    match self.gate.try_mark(id, name, date, period.clone()) {
                        Ok(outcome) => outcome.into(),
                        Err(err) => {
                            tracing::warn!(%attempt_id, identity = %id, error = %err, "attendance mark failed");
                            AttendanceStatus::Failed {
                                reason: err.to_string(),
                            }
                        }
                    }
                }
                _ => AttendanceStatus::NotAttempted,
            };

            tracing::info!(
                %attempt_id,
                face_index,
                decision = ?result.decision,
                similarity = result.similarity,
                identity = ?result.identity,
                "face recognized"
            );

            faces.push(FaceRecognition {
                face_index,
                attempt_id,
                face: face.face,
                result,
                attendance,
            });
        }

        Ok(Recognition::Faces { faces })
    }

    /// Detection only, for diagnostics. No face yields an empty list.
    pub fn detect(&self, image: &[u8]) -> Result<Vec<FaceBox>, PipelineError> {
        let frame = Frame::decode(image)?;
        match self.localizer.detect(&frame) {
            Ok(faces) => Ok(faces),
            Err(LocalizerError::NoFaceDetected) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Forget an identity in both the identity store and the registry.
    pub fn remove(&self, id: &str) -> Result<bool, PipelineError> {
        let (stored, registered) = self.registry.remove_with(id, |id| match &self.identities {
            Some(store) => store.delete_identity(id).map_err(PipelineError::from),
            None => Ok(false),
        })?;
        tracing::info!(id, stored, registered, "identity removed");
        Ok(stored || registered)
    }
}

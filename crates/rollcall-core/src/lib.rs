//! rollcall-core — Face identification and attendance marking.
//!
//! Uses RetinaFace for face localization and ArcFace for face descriptors,
//! both running via ONNX Runtime, plus a snapshot-consistent identity registry
//! and an idempotent attendance gate.

pub mod anchors;
pub mod decoder;
pub mod extractor;
pub mod frame;
pub mod gate;
pub mod localizer;
pub mod log;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod types;

pub use extractor::{DescriptorExtractor, ExtractorConfig};
pub use frame::{ChannelOrder, Frame};
pub use gate::{AttendanceGate, AttendanceStore, MarkOutcome, MemoryAttendanceStore, StoreError};
pub use localizer::{DetectorConfig, FaceLocalizer};
pub use log::{MemoryRecognitionLog, RecognitionEntry, RecognitionSink};
pub use matcher::{CosineMatcher, Matcher, MatcherKind, NearestSampleMatcher};
pub use models::{DetectionModel, EmbeddingModel, OnnxDetector, OnnxEmbedder};
pub use pipeline::{AttendanceStatus, EnrollReport, FaceRecognition, Pipeline, PipelineError, Recognition};
pub use registry::{IdentityRecord, IdentityRegistry, IdentityStore, RegistrySnapshot};
pub use types::{AttendanceKey, AttendanceRecord, Attendee, Descriptor, FaceBox, MatchDecision, MatchResult, Period};

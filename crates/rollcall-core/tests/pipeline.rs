//! End-to-end pipeline behaviour with stub detection and embedding models.

use chrono::NaiveDate;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array4, Axis};
use rollcall_core::anchors::AnchorConfig;
use rollcall_core::decoder::DetectionMode;
use rollcall_core::gate::StoreError;
use rollcall_core::models::{ModelError, RawDetections};
use rollcall_core::pipeline::FaceRecognition;
use rollcall_core::{
    AttendanceGate, AttendanceKey, AttendanceRecord, AttendanceStatus, AttendanceStore, Attendee, Descriptor,
    DescriptorExtractor, DetectionModel, DetectorConfig, EmbeddingModel, ExtractorConfig, FaceLocalizer,
    IdentityRecord, IdentityRegistry, IdentityStore, MatchDecision, MemoryAttendanceStore, Period, Pipeline,
    PipelineError, Recognition, RecognitionSink,
};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Stride-32 level, cell (5, 5), 256px size.
const LARGE_CENTRE_ANCHOR: usize = 3200 + 800 + (5 * 10 + 5) * 2;
/// Two small, far-apart stride-8 anchors.
const SMALL_ANCHOR_A: usize = (10 * 40 + 10) * 2;
const SMALL_ANCHOR_B: usize = (30 * 40 + 30) * 2;

const RED: [u8; 3] = [255, 0, 0];
const BLUE: [u8; 3] = [0, 0, 255];
const BLACK: [u8; 3] = [0, 0, 0];

/// Reports faces at fixed anchors whenever the frame is not black.
struct StubDetector {
    faces: Vec<(usize, f32)>,
}

impl DetectionModel for StubDetector {
    fn detect(&self, input: &Array4<f32>) -> Result<RawDetections, ModelError> {
        let n = AnchorConfig::retinaface(320).anchor_count();
        let mut conf = vec![0.0; n * 2];
        // Black pixels are below every channel mean.
        if input.iter().any(|&v| v > 0.0) {
            for &(anchor, score) in &self.faces {
                conf[anchor * 2 + 1] = score;
            }
        }
        Ok(RawDetections {
            loc: vec![0.0; n * 4],
            conf,
        })
    }
}

/// Embeds a crop as its per-channel means, padded to 512 dimensions.
struct ChannelMeanEmbedder;

impl EmbeddingModel for ChannelMeanEmbedder {
    fn embed(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let mut v = vec![0.0; 512];
        for (c, slot) in v.iter_mut().take(3).enumerate() {
            *slot = input.index_axis(Axis(1), c).mean().unwrap_or(0.0);
        }
        Ok(v)
    }
}

struct FailingStore;

impl AttendanceStore for FailingStore {
    fn insert_if_absent(&self, _: &AttendanceRecord) -> Result<bool, StoreError> {
        Err(StoreError::Corrupt("write refused".into()))
    }
    fn exists(&self, _: &AttendanceKey) -> Result<bool, StoreError> {
        Ok(false)
    }
    fn query_by_identity_and_range(
        &self,
        _: &str,
        _: NaiveDate,
        _: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(vec![])
    }
    fn delete_by_identity(&self, _: &str) -> Result<usize, StoreError> {
        Ok(0)
    }
    fn delete_all(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
    fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(vec![])
    }
    fn attendees(&self) -> Result<Vec<Attendee>, StoreError> {
        Ok(vec![])
    }
}

/// In-memory identity store. Saving a record named "slow" stalls after the
/// write, widening the window between persisting and publishing.
#[derive(Default)]
struct MemoryIdentities {
    saved: Mutex<BTreeMap<String, IdentityRecord>>,
}

impl MemoryIdentities {
    fn name_of(&self, id: &str) -> Option<String> {
        self.saved.lock().unwrap().get(id).map(|r| r.name.clone())
    }
}

impl IdentityStore for MemoryIdentities {
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        self.saved.lock().unwrap().insert(record.id.clone(), record.clone());
        if record.name == "slow" {
            thread::sleep(Duration::from_millis(300));
        }
        Ok(())
    }
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self.saved.lock().unwrap().values().cloned().collect())
    }
    fn delete_identity(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.saved.lock().unwrap().remove(id).is_some())
    }
}

struct RefusingIdentities;

impl IdentityStore for RefusingIdentities {
    fn save_identity(&self, _: &IdentityRecord) -> Result<(), StoreError> {
        Err(StoreError::Corrupt("read-only".into()))
    }
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(vec![])
    }
    fn delete_identity(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Corrupt("read-only".into()))
    }
}

fn pipeline_with(store: Arc<dyn AttendanceStore>, faces: Vec<(usize, f32)>, mode: DetectionMode) -> Pipeline {
    let mut config = DetectorConfig::default();
    config.decoder.mode = mode;
    let localizer = FaceLocalizer::new(Box::new(StubDetector { faces }), config);
    let extractor = DescriptorExtractor::new(Box::new(ChannelMeanEmbedder), ExtractorConfig::default());
    Pipeline::new(localizer, extractor, AttendanceGate::new(store))
}

fn single_face_pipeline() -> (Pipeline, Arc<MemoryAttendanceStore>) {
    let store = Arc::new(MemoryAttendanceStore::new());
    let pipeline = pipeline_with(store.clone(), vec![(LARGE_CENTRE_ANCHOR, 0.97)], DetectionMode::Single);
    (pipeline, store)
}

fn png(rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(200, 100, Rgb(rgb));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
    bytes
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 8, 12).unwrap()
}

fn faces(recognition: Recognition) -> Vec<FaceRecognition> {
    match recognition {
        Recognition::Faces { faces } => faces,
        Recognition::NoFace => panic!("expected faces"),
    }
}

#[test]
fn test_enroll_then_recognize_marks_once() {
    let (pipeline, store) = single_face_pipeline();
    let report = pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();
    assert_eq!(report.used, 1);
    assert!(report.skipped.is_empty());

    let period = Some(Period::new("DBMS", Some(2)));
    let first = faces(pipeline.recognize(&png(RED), today(), period.clone()).unwrap());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].result.decision, MatchDecision::Accepted);
    assert_eq!(first[0].result.identity.as_deref(), Some("21CS001"));
    assert_eq!(first[0].result.name.as_deref(), Some("Asha"));
    assert!(first[0].result.similarity > 0.99);
    assert_eq!(first[0].attendance, AttendanceStatus::Marked);

    let second = faces(pipeline.recognize(&png(RED), today(), period).unwrap());
    assert_eq!(second[0].attendance, AttendanceStatus::AlreadyMarked);
    assert_eq!(store.len(), 1);

    let log = pipeline.log().entries().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].attempt_id, first[0].attempt_id);
    assert_eq!(log[1].attempt_id, second[0].attempt_id);
    assert!(log.iter().all(|e| e.outcome == MatchDecision::Accepted));
}

#[test]
fn test_unknown_face_is_logged_but_not_marked() {
    let (pipeline, store) = single_face_pipeline();

    let empty = faces(pipeline.recognize(&png(BLUE), today(), None).unwrap());
    assert_eq!(empty[0].result.decision, MatchDecision::NoCandidates);
    assert_eq!(empty[0].attendance, AttendanceStatus::NotAttempted);

    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();
    let rejected = faces(pipeline.recognize(&png(BLUE), today(), None).unwrap());
    assert_eq!(rejected[0].result.decision, MatchDecision::Rejected);
    assert!(rejected[0].result.identity.is_none());
    assert!(rejected[0].result.similarity < 0.0);
    assert_eq!(rejected[0].attendance, AttendanceStatus::NotAttempted);

    assert!(store.is_empty());
    let outcomes: Vec<_> = pipeline.log().entries().unwrap().iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![MatchDecision::NoCandidates, MatchDecision::Rejected]);
}

#[test]
fn test_no_face_has_no_side_effects() {
    let (pipeline, store) = single_face_pipeline();
    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();

    let result = pipeline.recognize(&png(BLACK), today(), None).unwrap();
    assert!(matches!(result, Recognition::NoFace));
    assert!(store.is_empty());
    assert!(pipeline.log().entries().unwrap().is_empty());
}

#[test]
fn test_invalid_image_rejected() {
    let (pipeline, _) = single_face_pipeline();
    let err = pipeline.recognize(b"not an image", today(), None).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
    assert!(matches!(pipeline.detect(&[]).unwrap_err(), PipelineError::InvalidImage(_)));
}

#[test]
fn test_enroll_skips_unusable_images() {
    let (pipeline, _) = single_face_pipeline();
    let report = pipeline
        .enroll("21CS002", "Ben", &[b"garbage".to_vec(), png(BLACK), png(BLUE)])
        .unwrap();
    assert_eq!(report.used, 1);
    let skipped: Vec<_> = report.skipped.iter().map(|s| s.index).collect();
    assert_eq!(skipped, vec![0, 1]);
    assert_eq!(pipeline.registry().len(), 1);
}

#[test]
fn test_enroll_with_no_usable_image_changes_nothing() {
    let (pipeline, _) = single_face_pipeline();
    let err = pipeline
        .enroll("21CS003", "Cara", &[png(BLACK), b"x".to_vec()])
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
    assert!(pipeline.registry().is_empty());
}

#[test]
fn test_reenroll_replaces_descriptor() {
    let (pipeline, _) = single_face_pipeline();
    pipeline.enroll("x", "X", &[png(RED)]).unwrap();
    pipeline.enroll("x", "X", &[png(BLUE)]).unwrap();
    assert_eq!(pipeline.registry().len(), 1);

    let red = faces(pipeline.recognize(&png(RED), today(), None).unwrap());
    assert_eq!(red[0].result.decision, MatchDecision::Rejected);
    let blue = faces(pipeline.recognize(&png(BLUE), today(), None).unwrap());
    assert_eq!(blue[0].result.identity.as_deref(), Some("x"));
}

#[test]
fn test_persistence_failure_keeps_match() {
    let pipeline = pipeline_with(Arc::new(FailingStore), vec![(LARGE_CENTRE_ANCHOR, 0.97)], DetectionMode::Single);
    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();

    let result = faces(pipeline.recognize(&png(RED), today(), None).unwrap());
    assert!(result[0].result.is_accepted());
    assert!(matches!(result[0].attendance, AttendanceStatus::Failed { .. }));
    assert_eq!(pipeline.log().entries().unwrap().len(), 1);
}

#[test]
fn test_multi_face_indices_follow_confidence() {
    let store = Arc::new(MemoryAttendanceStore::new());
    let pipeline = pipeline_with(
        store.clone(),
        vec![(SMALL_ANCHOR_B, 0.80), (SMALL_ANCHOR_A, 0.95)],
        DetectionMode::Multi,
    );
    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();

    let result = faces(pipeline.recognize(&png(RED), today(), None).unwrap());
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].face_index, 0);
    assert_eq!(result[1].face_index, 1);
    assert!(result[0].face.confidence > result[1].face.confidence);
    assert_ne!(result[0].attempt_id, result[1].attempt_id);

    // Same person twice in one frame: one mark only.
    assert_eq!(result[0].attendance, AttendanceStatus::Marked);
    assert_eq!(result[1].attendance, AttendanceStatus::AlreadyMarked);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_detect_reports_boxes_without_side_effects() {
    let (pipeline, store) = single_face_pipeline();
    let boxes = pipeline.detect(&png(RED)).unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!((boxes[0].x, boxes[0].y, boxes[0].width, boxes[0].height), (30, 15, 160, 80));

    assert!(pipeline.detect(&png(BLACK)).unwrap().is_empty());
    assert!(store.is_empty());
    assert!(pipeline.log().entries().unwrap().is_empty());
}

#[test]
fn test_removed_identity_no_longer_matches() {
    let (pipeline, _) = single_face_pipeline();
    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();
    assert!(pipeline.remove("21CS001").unwrap());
    assert!(!pipeline.remove("21CS001").unwrap());

    let result = faces(pipeline.recognize(&png(RED), today(), None).unwrap());
    assert_eq!(result[0].result.decision, MatchDecision::NoCandidates);
}

#[test]
fn test_recognition_json_shape() {
    let (pipeline, _) = single_face_pipeline();
    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();

    let json = serde_json::to_value(pipeline.recognize(&png(RED), today(), None).unwrap()).unwrap();
    assert_eq!(json["status"], "faces");
    let face = &json["faces"][0];
    assert_eq!(face["match"]["decision"], "accepted");
    assert_eq!(face["match"]["identity"], "21CS001");
    assert_eq!(face["attendance"]["status"], "marked");

    let none = serde_json::to_value(pipeline.recognize(&png(BLACK), today(), None).unwrap()).unwrap();
    assert_eq!(none["status"], "no-face");
}

fn persistent_pipeline(identities: Arc<dyn IdentityStore>) -> Pipeline {
    let (pipeline, _) = single_face_pipeline();
    pipeline.with_identity_store(identities)
}

#[test]
fn test_enroll_persists_and_remove_deletes() {
    let identities = Arc::new(MemoryIdentities::default());
    let pipeline = persistent_pipeline(identities.clone());

    pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap();
    assert_eq!(identities.name_of("21CS001").as_deref(), Some("Asha"));

    assert!(pipeline.remove("21CS001").unwrap());
    assert!(identities.name_of("21CS001").is_none());
    assert!(pipeline.registry().is_empty());
}

#[test]
fn test_enrollments_survive_restart() {
    let identities = Arc::new(MemoryIdentities::default());
    persistent_pipeline(identities.clone())
        .enroll("21CS001", "Asha", &[png(RED)])
        .unwrap();

    let registry = Arc::new(IdentityRegistry::new());
    assert_eq!(registry.restore(identities.load_identities().unwrap()), 1);
    let (restarted, _) = single_face_pipeline();
    let restarted = restarted.with_registry(registry);

    let result = faces(restarted.recognize(&png(RED), today(), None).unwrap());
    assert_eq!(result[0].result.identity.as_deref(), Some("21CS001"));
}

#[test]
fn test_identity_store_failure_leaves_registry_unchanged() {
    let pipeline = persistent_pipeline(Arc::new(RefusingIdentities));

    let err = pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(_)));
    assert!(pipeline.registry().is_empty());

    let result = faces(pipeline.recognize(&png(RED), today(), None).unwrap());
    assert_eq!(result[0].result.decision, MatchDecision::NoCandidates);
}

#[test]
fn test_remove_failure_keeps_identity() {
    let pipeline = persistent_pipeline(Arc::new(RefusingIdentities));
    let sample = Descriptor::from_raw(vec![1.0; 512]).unwrap();
    let record = IdentityRecord::from_samples("21CS001", "Asha", vec![sample]).unwrap();
    pipeline.registry().insert(record).unwrap();

    assert!(matches!(pipeline.remove("21CS001").unwrap_err(), PipelineError::Persistence(_)));
    assert_eq!(pipeline.registry().len(), 1);
}

#[test]
fn test_mismatched_dimension_is_not_persisted() {
    let identities = Arc::new(MemoryIdentities::default());
    let pipeline = persistent_pipeline(identities.clone());
    let sample = Descriptor::from_raw(vec![1.0; 128]).unwrap();
    let short = IdentityRecord::from_samples("legacy", "Old", vec![sample]).unwrap();
    pipeline.registry().insert(short).unwrap();

    let err = pipeline.enroll("21CS001", "Asha", &[png(RED)]).unwrap_err();
    assert!(matches!(err, PipelineError::Registry(_)));
    assert!(identities.name_of("21CS001").is_none());
}

#[test]
fn test_concurrent_reenroll_keeps_store_and_registry_in_step() {
    let identities = Arc::new(MemoryIdentities::default());
    let pipeline = persistent_pipeline(identities.clone());

    thread::scope(|s| {
        s.spawn(|| pipeline.enroll("21CS001", "slow", &[png(RED)]).unwrap());
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            pipeline.enroll("21CS001", "fast", &[png(BLUE)]).unwrap();
        });
    });

    let registered = pipeline.registry().snapshot().get("21CS001").unwrap().name.clone();
    assert_eq!(identities.name_of("21CS001"), Some(registered));
}

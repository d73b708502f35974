use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed drift of ‖v‖₂ from 1.0 before a vector is rejected as a descriptor.
const UNIT_NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has no components")]
    Empty,
    #[error("descriptor contains NaN or infinite components")]
    NonFinite,
    #[error("descriptor has zero norm and cannot be normalized")]
    ZeroNorm,
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Unit-norm face descriptor (512-dimensional for ArcFace w600k_r50).
///
/// Every constructor normalizes, so `similarity` can be a plain dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// L2-normalize raw network output into a descriptor.
    pub fn from_raw(mut raw: Vec<f32>) -> Result<Self, DescriptorError> {
        if raw.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite);
        }
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(DescriptorError::ZeroNorm);
        }
        for v in raw.iter_mut() {
            *v /= norm;
        }
        Ok(Self { values: raw })
    }

    /// Component-wise mean of several descriptors, re-normalized to unit length.
    pub fn centroid(samples: &[Descriptor]) -> Result<Self, DescriptorError> {
        let first = samples.first().ok_or(DescriptorError::Empty)?;
        let dim = first.dim();
        let mut sum = vec![0.0f32; dim];
        for sample in samples {
            if sample.dim() != dim {
                return Err(DescriptorError::DimensionMismatch {
                    expected: dim,
                    actual: sample.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }
        let n = samples.len() as f32;
        sum.iter_mut().for_each(|v| *v /= n);
        Self::from_raw(sum)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Both sides are unit-norm, so this is a dot product.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }

    /// Euclidean distance. For unit vectors d² = 2 − 2·cos.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// True when ‖v‖₂ is within tolerance of 1.
    pub fn is_unit_norm(&self) -> bool {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::from_raw(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.values
    }
}

/// Absolute pixel rectangle of a detected face, fully inside its source frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = x2.saturating_sub(x1) as u64 * y2.saturating_sub(y1) as u64;
        let union = self.area() + other.area() - inter;

        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// Outcome class of a single match computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchDecision {
    Accepted,
    Rejected,
    NoCandidates,
}

/// Result of matching a probe descriptor against a registry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub decision: MatchDecision,
    /// Identifier of the accepted identity. Always `None` unless accepted.
    pub identity: Option<String>,
    pub name: Option<String>,
    /// Best similarity seen, kept for diagnostics even when rejected.
    pub similarity: f32,
}

impl MatchResult {
    pub fn no_candidates() -> Self {
        Self {
            decision: MatchDecision::NoCandidates,
            identity: None,
            name: None,
            similarity: 0.0,
        }
    }

    pub fn rejected(similarity: f32) -> Self {
        Self {
            decision: MatchDecision::Rejected,
            identity: None,
            name: None,
            similarity,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.decision == MatchDecision::Accepted
    }
}

/// Lecture slot an attendance mark belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub lecture: String,
    pub slot: Option<u32>,
}

impl Period {
    pub fn new(lecture: impl Into<String>, slot: Option<u32>) -> Self {
        Self {
            lecture: lecture.into(),
            slot,
        }
    }
}

/// Uniqueness tuple for attendance: at most one record per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttendanceKey {
    pub identity: String,
    pub date: NaiveDate,
    pub period: Option<Period>,
}

/// A persisted attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub period: Option<Period>,
}

impl AttendanceRecord {
    pub fn key(&self) -> AttendanceKey {
        AttendanceKey {
            identity: self.identity.clone(),
            date: self.date,
            period: self.period.clone(),
        }
    }
}

/// Someone with at least one attendance mark, as recorded at marking time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attendee {
    pub identity: String,
    pub name: String,
}

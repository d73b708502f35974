//! Matching strategies: probe descriptor against a registry snapshot.
//!
//! Both strategies visit every record and resolve equal scores to the
//! lexicographically lowest identifier, so a fixed snapshot always yields the
//! same answer.

use crate::registry::{IdentityRecord, RegistrySnapshot};
use crate::types::{Descriptor, MatchDecision, MatchResult};
use serde::{Deserialize, Serialize};

// Calibrated for ArcFace w600k_r50 centroids; re-tune for any other model pair.
const DEFAULT_MATCH_THRESHOLD: f32 = 0.60;
const DEFAULT_MAX_DISTANCE: f32 = 0.9;

/// Strategy for comparing a probe descriptor against enrolled identities.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Descriptor, snapshot: &RegistrySnapshot) -> MatchResult;
}

/// Configuration-level choice of matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "strategy")]
pub enum MatcherKind {
    Cosine { threshold: f32 },
    NearestSample { max_distance: f32 },
}

impl Default for MatcherKind {
    fn default() -> Self {
        MatcherKind::Cosine {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl MatcherKind {
    pub fn build(self) -> Box<dyn Matcher> {
        match self {
            MatcherKind::Cosine { threshold } => Box::new(CosineMatcher { threshold }),
            MatcherKind::NearestSample { max_distance } => {
                Box::new(NearestSampleMatcher { max_distance })
            }
        }
    }
}

/// Cosine similarity against each identity's centroid descriptor.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    /// Accept iff the best similarity is strictly greater than this.
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Descriptor, snapshot: &RegistrySnapshot) -> MatchResult {
        let best = best_by(snapshot, |record| probe.similarity(&record.descriptor));

        match best {
            None => MatchResult::no_candidates(),
            Some((record, sim)) if sim > self.threshold => accepted(record, sim),
            Some((_, sim)) => MatchResult::rejected(sim),
        }
    }
}

/// 1-nearest-neighbour classifier over every stored enrollment sample.
///
/// Labels are identities; the distance is Euclidean. The reported similarity
/// is the cosine equivalent `1 − d²/2` of the winning distance.
#[derive(Debug, Clone, Copy)]
pub struct NearestSampleMatcher {
    /// Accept iff the nearest sample is strictly closer than this.
    pub max_distance: f32,
}

impl Default for NearestSampleMatcher {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }
}

impl Matcher for NearestSampleMatcher {
    fn compare(&self, probe: &Descriptor, snapshot: &RegistrySnapshot) -> MatchResult {
        // Maximize negated distance so both strategies share one tie-break.
        let best = best_by(snapshot, |record| {
            let nearest = record
                .samples
                .iter()
                .chain(std::iter::once(&record.descriptor))
                .map(|s| probe.euclidean_distance(s))
                .fold(f32::INFINITY, f32::min);
            -nearest
        });

        match best {
            None => MatchResult::no_candidates(),
            Some((record, neg_dist)) => {
                let distance = -neg_dist;
                let similarity = (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0);
                if distance < self.max_distance {
                    accepted(record, similarity)
                } else {
                    MatchResult::rejected(similarity)
                }
            }
        }
    }
}

/// Highest-scoring record. Iterates in ascending id order and only replaces on a
/// strictly greater score, so ties go to the lowest id.
fn best_by<'a>(
    snapshot: &'a RegistrySnapshot,
    score: impl Fn(&IdentityRecord) -> f32,
) -> Option<(&'a IdentityRecord, f32)> {
    let mut best: Option<(&IdentityRecord, f32)> = None;

    // Always visit every entry, no early exit.
    for record in snapshot.iter() {
        let s = score(record);
        if s.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((record, s));
        }
    }

    best
}

fn accepted(record: &IdentityRecord, similarity: f32) -> MatchResult {
    MatchResult {
        decision: MatchDecision::Accepted,
        identity: Some(record.id.clone()),
        name: Some(record.name.clone()),
        similarity,
    }
}

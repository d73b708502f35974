//! Append-only audit log of recognition attempts.

use crate::gate::StoreError;
use crate::types::{MatchDecision, MatchResult, Period};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEntry {
    pub attempt_id: Uuid,
    pub identity: Option<String>,
    pub name: Option<String>,
    pub period: Option<Period>,
    pub at: DateTime<Utc>,
    pub score: f32,
    pub outcome: MatchDecision,
}

impl RecognitionEntry {
    pub fn from_match(attempt_id: Uuid, result: &MatchResult, period: Option<Period>) -> Self {
        Self {
            attempt_id,
            identity: result.identity.clone(),
            name: result.name.clone(),
            period,
            at: Utc::now(),
            score: result.similarity,
            outcome: result.decision,
        }
    }
}

/// Sink for recognition entries. Reads return insertion order.
pub trait RecognitionSink: Send + Sync {
    fn append(&self, entry: &RecognitionEntry) -> Result<(), StoreError>;
    fn entries(&self) -> Result<Vec<RecognitionEntry>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecognitionLog {
    entries: Mutex<Vec<RecognitionEntry>>,
}

impl MemoryRecognitionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecognitionSink for MemoryRecognitionLog {
    fn append(&self, entry: &RecognitionEntry) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<RecognitionEntry>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

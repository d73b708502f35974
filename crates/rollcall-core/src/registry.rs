//! Identity registry: enrolled people and their descriptors.
//!
//! Writers build a new immutable snapshot and swap it in; readers clone the
//! current `Arc` and never observe a half-written record.

use crate::gate::StoreError;
use crate::types::{Descriptor, DescriptorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("enrollment needs at least one descriptor")]
    NoDescriptors,
    #[error("identifier must not be empty")]
    EmptyIdentifier,
    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("descriptor dimension {actual} does not match registry dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    /// Unit-norm centroid of `samples`.
    pub descriptor: Descriptor,
    /// The individual enrollment descriptors the centroid was built from.
    pub samples: Vec<Descriptor>,
    pub enrolled_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// Build a record whose descriptor is the re-normalized mean of `samples`.
    pub fn from_samples(
        id: impl Into<String>,
        name: impl Into<String>,
        samples: Vec<Descriptor>,
    ) -> Result<Self, RegistryError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::EmptyIdentifier);
        }
        if samples.is_empty() {
            return Err(RegistryError::NoDescriptors);
        }
        let descriptor = Descriptor::centroid(&samples)?;
        Ok(Self {
            id,
            name: name.into(),
            descriptor,
            samples,
            enrolled_at: Utc::now(),
        })
    }
}

/// Point-in-time view of the registry, ordered by identifier.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    records: BTreeMap<String, Arc<IdentityRecord>>,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&IdentityRecord> {
        self.records.get(id).map(Arc::as_ref)
    }

    /// Records in ascending identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values().map(Arc::as_ref)
    }
}

impl FromIterator<IdentityRecord> for RegistrySnapshot {
    fn from_iter<I: IntoIterator<Item = IdentityRecord>>(iter: I) -> Self {
        Self {
            records: iter
                .into_iter()
                .map(|r| (r.id.clone(), Arc::new(r)))
                .collect(),
        }
    }
}

/// Concurrent identity store with snapshot reads.
///
/// Writers are serialized by `writer` for the whole read-validate-persist-publish
/// sequence; readers only touch `current` for the duration of an `Arc` clone.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<()>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average `descriptors` into one record and publish it, replacing any prior
    /// record for `id`.
    pub fn enroll(
        &self,
        id: &str,
        name: &str,
        descriptors: Vec<Descriptor>,
    ) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let record = IdentityRecord::from_samples(id, name, descriptors)?;
        self.insert(record)
    }

    /// Publish a prebuilt record, replacing any prior record with the same id.
    ///
    /// All records must share one descriptor dimension.
    pub fn insert(&self, record: IdentityRecord) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        self.insert_with(record, |_| Ok::<(), RegistryError>(()))
    }

    /// Like [`insert`](Self::insert), but runs `persist` after validation and
    /// before publishing, with all other writers held off. A `persist` error
    /// leaves the registry unchanged.
    pub fn insert_with<E>(
        &self,
        record: IdentityRecord,
        persist: impl FnOnce(&IdentityRecord) -> Result<(), E>,
    ) -> Result<Arc<RegistrySnapshot>, E>
    where
        E: From<RegistryError>,
    {
        let _writer = self.writer_lock();
        let mut records = self.snapshot().records.clone();

        if let Some(other) = records.values().find(|r| r.id != record.id) {
            if other.descriptor.dim() != record.descriptor.dim() {
                return Err(RegistryError::DimensionMismatch {
                    expected: other.descriptor.dim(),
                    actual: record.descriptor.dim(),
                }
                .into());
            }
        }

        persist(&record)?;

        tracing::debug!(id = %record.id, replaced = records.contains_key(&record.id), "registry insert");
        records.insert(record.id.clone(), Arc::new(record));
        Ok(self.publish(records))
    }

    /// Remove `id`. Returns whether a record existed.
    pub fn remove(&self, id: &str) -> bool {
        match self.remove_with(id, |_| Ok::<bool, RegistryError>(false)) {
            Ok((_, registered)) => registered,
            Err(_) => false,
        }
    }

    /// Remove `id`, running `persist` first with all other writers held off.
    /// Returns (what `persist` reported, whether the registry held `id`). A
    /// `persist` error leaves the registry unchanged.
    pub fn remove_with<E>(
        &self,
        id: &str,
        persist: impl FnOnce(&str) -> Result<bool, E>,
    ) -> Result<(bool, bool), E> {
        let _writer = self.writer_lock();
        let stored = persist(id)?;

        let mut records = self.snapshot().records.clone();
        let registered = records.remove(id).is_some();
        if registered {
            self.publish(records);
        }
        Ok((stored, registered))
    }

    /// Replace the whole registry, e.g. with records loaded at startup.
    ///
    /// The lowest identifier fixes the descriptor dimension; records of any
    /// other dimension are skipped. Returns the number of records loaded.
    pub fn restore(&self, records: impl IntoIterator<Item = IdentityRecord>) -> usize {
        let _writer = self.writer_lock();
        let mut by_id: BTreeMap<String, IdentityRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        let dim = by_id.values().next().map(|r| r.descriptor.dim());
        by_id.retain(|id, record| {
            let keep = Some(record.descriptor.dim()) == dim
                && record.samples.iter().all(|s| Some(s.dim()) == dim);
            if !keep {
                tracing::warn!(
                    id = %id,
                    dim = record.descriptor.dim(),
                    expected = ?dim,
                    "skipping stored identity with mismatched descriptor dimension"
                );
            }
            keep
        });

        let snapshot: RegistrySnapshot = by_id.into_values().collect();
        let count = snapshot.len();
        tracing::info!(count, "registry restored");
        self.publish(snapshot.records);
        count
    }

    /// Atomically obtain the current snapshot (lookup_all).
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Swap in a new snapshot built from an edited copy of the record map.
    fn publish(&self, records: BTreeMap<String, Arc<IdentityRecord>>) -> Arc<RegistrySnapshot> {
        let next = Arc::new(RegistrySnapshot { records });
        // Snapshots are swapped whole, so a poisoned lock still holds a consistent value.
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::clone(&next);
        next
    }

    fn writer_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Durable home for identity records, so enrollments survive restarts.
pub trait IdentityStore: Send + Sync {
    /// Insert or replace the record for `record.id`.
    fn save_identity(&self, record: &IdentityRecord) -> Result<(), StoreError>;
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;
    /// Returns whether a record existed.
    fn delete_identity(&self, id: &str) -> Result<bool, StoreError>;
}

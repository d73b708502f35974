//! Attendance gate. At most one mark per (identity, date, period).
//!
//! The store's uniqueness constraint is the arbiter. The optional existence
//! check only saves a write; it is never trusted to prevent duplicates.

use crate::types::{AttendanceKey, AttendanceRecord, Attendee, Period};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Persistence collaborator for attendance records.
///
/// Implementations must enforce uniqueness of [`AttendanceKey`] themselves.
pub trait AttendanceStore: Send + Sync {
    /// Insert unless a record with the same key exists. Returns `true` if inserted.
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, StoreError>;

    fn exists(&self, key: &AttendanceKey) -> Result<bool, StoreError>;

    /// Records for `identity` with `start <= date <= end`, oldest first.
    fn query_by_identity_and_range(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Returns the number of records removed.
    fn delete_by_identity(&self, identity: &str) -> Result<usize, StoreError>;

    fn delete_all(&self) -> Result<usize, StoreError>;

    /// Every record, ordered by date, time, then identity.
    fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// One entry per identity that has any record, ordered by identity. The
    /// name is the one on that identity's most recent record.
    fn attendees(&self) -> Result<Vec<Attendee>, StoreError>;
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("attendance persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("invalid month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
}

pub struct AttendanceGate {
    store: Arc<dyn AttendanceStore>,
    fast_path: bool,
}

impl AttendanceGate {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self {
            store,
            fast_path: true,
        }
    }

    /// Enable or disable the pre-insert existence check.
    pub fn with_fast_path(mut self, enabled: bool) -> Self {
        self.fast_path = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.store
    }

    /// Mark `identity` present for `date`/`period`, stamped with the current local time.
    pub fn try_mark(
        &self,
        identity: &str,
        name: &str,
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<MarkOutcome, GateError> {
        let record = AttendanceRecord {
            identity: identity.to_string(),
            name: name.to_string(),
            date,
            time: Local::now().time(),
            period,
        };

        if self.fast_path && self.store.exists(&record.key())? {
            tracing::debug!(identity, %date, "attendance already marked (fast path)");
            return Ok(MarkOutcome::AlreadyMarked);
        }

        if self.store.insert_if_absent(&record)? {
            tracing::info!(identity, name, %date, lecture = ?record.period.as_ref().map(|p| &p.lecture), "attendance marked");
            Ok(MarkOutcome::Marked)
        } else {
            tracing::debug!(identity, %date, "attendance already marked");
            Ok(MarkOutcome::AlreadyMarked)
        }
    }

    /// All records for `identity` within one calendar month.
    pub fn history(
        &self,
        identity: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<AttendanceRecord>, GateError> {
        let (start, end) = month_bounds(year, month).ok_or(GateError::InvalidMonth { year, month })?;
        Ok(self.store.query_by_identity_and_range(identity, start, end)?)
    }

    pub fn records_between(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, GateError> {
        Ok(self.store.query_by_identity_and_range(identity, start, end)?)
    }

    pub fn all_records(&self) -> Result<Vec<AttendanceRecord>, GateError> {
        Ok(self.store.all_records()?)
    }

    /// Distinct identities that have been marked at least once.
    pub fn attendees(&self) -> Result<Vec<Attendee>, GateError> {
        Ok(self.store.attendees()?)
    }
}

/// Records in reporting order: date, time, then identity.
fn sort_chronologically(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| (a.date, a.time, &a.identity).cmp(&(b.date, b.time, &b.identity)));
}

/// First and last day of a calendar month.
fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((start, next.pred_opt()?))
}

/// In-process store honouring the same uniqueness contract as the SQLite one.
#[derive(Debug, Default)]
pub struct MemoryAttendanceStore {
    records: Mutex<BTreeMap<AttendanceKey, AttendanceRecord>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<AttendanceKey, AttendanceRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AttendanceStore for MemoryAttendanceStore {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let mut records = self.lock();
        let key = record.key();
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    fn exists(&self, key: &AttendanceKey) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(key))
    }

    fn query_by_identity_and_range(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut found: Vec<AttendanceRecord> = self
            .lock()
            .values()
            .filter(|r| r.identity == identity && r.date >= start && r.date <= end)
            .cloned()
            .collect();
        sort_chronologically(&mut found);
        Ok(found)
    }

    fn delete_by_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|key, _| key.identity != identity);
        Ok(before - records.len())
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let mut records = self.lock();
        let removed = records.len();
        records.clear();
        Ok(removed)
    }

    fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut all: Vec<AttendanceRecord> = self.lock().values().cloned().collect();
        sort_chronologically(&mut all);
        Ok(all)
    }

    fn attendees(&self) -> Result<Vec<Attendee>, StoreError> {
        let mut latest: BTreeMap<String, AttendanceRecord> = BTreeMap::new();
        for record in self.all_records()? {
            latest.insert(record.identity.clone(), record);
        }
        Ok(latest
            .into_values()
            .map(|r| Attendee {
                identity: r.identity,
                name: r.name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn gate() -> (AttendanceGate, Arc<MemoryAttendanceStore>) {
        let store = Arc::new(MemoryAttendanceStore::new());
        (AttendanceGate::new(store.clone()), store)
    }

    #[test]
    fn test_mark_then_already_marked() {
        let (gate, store) = gate();
        let period = Some(Period::new("DBMS", Some(2)));
        let d = date(2024, 3, 4);
        assert_eq!(gate.try_mark("21CS001", "Asha", d, period.clone()).unwrap(), MarkOutcome::Marked);
        assert_eq!(gate.try_mark("21CS001", "Asha", d, period).unwrap(), MarkOutcome::AlreadyMarked);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_periods_are_distinct_keys() {
        let (gate, store) = gate();
        let d = date(2024, 3, 4);
        gate.try_mark("1", "A", d, Some(Period::new("DBMS", Some(1)))).unwrap();
        gate.try_mark("1", "A", d, Some(Period::new("DBMS", Some(2)))).unwrap();
        gate.try_mark("1", "A", d, Some(Period::new("OS", Some(1)))).unwrap();
        gate.try_mark("1", "A", d, None).unwrap();
        gate.try_mark("1", "A", date(2024, 3, 5), None).unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(gate.try_mark("1", "A", d, None).unwrap(), MarkOutcome::AlreadyMarked);
    }

    #[test]
    fn test_concurrent_marks_yield_exactly_one() {
        for fast_path in [true, false] {
            let store = Arc::new(MemoryAttendanceStore::new());
            let gate = AttendanceGate::new(store.clone()).with_fast_path(fast_path);
            let marked = AtomicUsize::new(0);
            let already = AtomicUsize::new(0);
            let d = date(2024, 9, 2);

            std::thread::scope(|s| {
                for _ in 0..32 {
                    s.spawn(|| {
                        match gate.try_mark("21CS042", "Ravi", d, Some(Period::new("CN", Some(3)))).unwrap() {
                            MarkOutcome::Marked => marked.fetch_add(1, Ordering::SeqCst),
                            MarkOutcome::AlreadyMarked => already.fetch_add(1, Ordering::SeqCst),
                        };
                    });
                }
            });

            assert_eq!(marked.load(Ordering::SeqCst), 1);
            assert_eq!(already.load(Ordering::SeqCst), 31);
            assert_eq!(store.len(), 1);
        }
    }

    /// Store whose existence check always says "absent", as if racing another writer.
    struct StaleExistsStore(MemoryAttendanceStore);

    impl AttendanceStore for StaleExistsStore {
        fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
            self.0.insert_if_absent(record)
        }
        fn exists(&self, _key: &AttendanceKey) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn query_by_identity_and_range(
            &self,
            identity: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.0.query_by_identity_and_range(identity, start, end)
        }
        fn delete_by_identity(&self, identity: &str) -> Result<usize, StoreError> {
            self.0.delete_by_identity(identity)
        }
        fn delete_all(&self) -> Result<usize, StoreError> {
            self.0.delete_all()
        }
        fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.0.all_records()
        }
        fn attendees(&self) -> Result<Vec<Attendee>, StoreError> {
            self.0.attendees()
        }
    }

    #[test]
    fn test_insert_is_arbiter_when_check_is_stale() {
        let gate = AttendanceGate::new(Arc::new(StaleExistsStore(MemoryAttendanceStore::new())));
        let d = date(2024, 1, 1);
        assert_eq!(gate.try_mark("x", "X", d, None).unwrap(), MarkOutcome::Marked);
        assert_eq!(gate.try_mark("x", "X", d, None).unwrap(), MarkOutcome::AlreadyMarked);
    }

    struct FailingStore;

    impl AttendanceStore for FailingStore {
        fn insert_if_absent(&self, _: &AttendanceRecord) -> Result<bool, StoreError> {
            Err(StoreError::Corrupt("disk on fire".into()))
        }
        fn exists(&self, _: &AttendanceKey) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn query_by_identity_and_range(&self, _: &str, _: NaiveDate, _: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
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

    #[test]
    fn test_persistence_failure_surfaces() {
        let gate = AttendanceGate::new(Arc::new(FailingStore));
        let err = gate.try_mark("x", "X", date(2024, 1, 1), None).unwrap_err();
        assert!(matches!(err, GateError::Persistence(_)));
    }

    #[test]
    fn test_history_month_range() {
        let (gate, _) = gate();
        for (m, d) in [(1, 31), (2, 1), (2, 29), (3, 1)] {
            gate.try_mark("s1", "S", date(2024, m, d), None).unwrap();
        }
        gate.try_mark("s2", "T", date(2024, 2, 10), None).unwrap();

        let feb = gate.history("s1", 2024, 2).unwrap();
        let days: Vec<_> = feb.iter().map(|r| r.date).collect();
        assert_eq!(days, vec![date(2024, 2, 1), date(2024, 2, 29)]);

        let dec = gate.history("s1", 2023, 12).unwrap();
        assert!(dec.is_empty());
        assert!(matches!(gate.history("s1", 2024, 13), Err(GateError::InvalidMonth { .. })));
    }

    #[test]
    fn test_memory_store_deletes() {
        let (gate, store) = gate();
        gate.try_mark("a", "A", date(2024, 5, 1), None).unwrap();
        gate.try_mark("a", "A", date(2024, 5, 2), None).unwrap();
        gate.try_mark("b", "B", date(2024, 5, 1), None).unwrap();
        assert_eq!(store.delete_by_identity("a").unwrap(), 2);
        assert_eq!(store.delete_all().unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_all_records_and_attendees() {
        let (gate, _) = gate();
        gate.try_mark("b", "Bea", date(2024, 5, 2), None).unwrap();
        gate.try_mark("a", "A", date(2024, 5, 1), Some(Period::new("OS", Some(1)))).unwrap();
        gate.try_mark("b", "Beatrice", date(2024, 5, 3), None).unwrap();

        let all = gate.all_records().unwrap();
        let order: Vec<_> = all.iter().map(|r| (r.identity.as_str(), r.date)).collect();
        assert_eq!(order, vec![("a", date(2024, 5, 1)), ("b", date(2024, 5, 2)), ("b", date(2024, 5, 3))]);

        let attendees = gate.attendees().unwrap();
        assert_eq!(
            attendees,
            vec![
                Attendee { identity: "a".into(), name: "A".into() },
                Attendee { identity: "b".into(), name: "Beatrice".into() },
            ]
        );
    }
}

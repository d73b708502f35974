use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Local, Utc};
use rollcall_core::gate::{AttendanceStore, GateError, MarkOutcome};
use rollcall_core::{Period, Pipeline, RecognitionSink};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<SqliteStore>,
    pub started_at: DateTime<Utc>,
    pub matcher: String,
    pub workers: usize,
}

#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: &'a str,
    name: &'a str,
    samples: usize,
    enrolled_at: DateTime<Utc>,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) an identity from one or more encoded images.
    async fn enroll(&self, id: &str, name: &str, images: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        tracing::info!(id, name, images = images.len(), "enroll requested");
        if id.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identifier must not be empty".into()));
        }
        let report = self
            .engine
            .enroll(id.to_string(), name.to_string(), images)
            .await
            .map_err(engine_error)?;
        to_json(&report)
    }

    /// Recognize faces in an encoded image and mark attendance for today.
    ///
    /// An empty `lecture` means no period; a negative `slot` means no slot.
    async fn recognize(&self, image: Vec<u8>, lecture: &str, slot: i32) -> zbus::fdo::Result<String> {
        let period = period_from_args(lecture, slot);
        let date = Local::now().date_naive();
        tracing::debug!(bytes = image.len(), %date, ?period, "recognize requested");
        let recognition = self
            .engine
            .recognize(image, date, period)
            .await
            .map_err(engine_error)?;
        to_json(&recognition)
    }

    /// Detect faces without matching or marking.
    async fn detect(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let faces = self.engine.detect(image).await.map_err(engine_error)?;
        to_json(&faces)
    }

    /// Mark attendance for `id` by hand, without an image. Returns "marked"
    /// or "already-marked".
    async fn mark(&self, id: &str, name: &str, lecture: &str, slot: i32) -> zbus::fdo::Result<String> {
        if id.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identifier must not be empty".into()));
        }
        let period = period_from_args(lecture, slot);
        let date = Local::now().date_naive();
        tracing::info!(id, name, %date, ?period, "manual mark requested");

        let pipeline = Arc::clone(&self.pipeline);
        let (id, name) = (id.to_string(), name.to_string());
        let outcome = blocking(move || {
            pipeline
                .gate()
                .try_mark(&id, &name, date, period)
                .map_err(failed)
        })
        .await?;
        Ok(match outcome {
            MarkOutcome::Marked => "marked",
            MarkOutcome::AlreadyMarked => "already-marked",
        }
        .to_string())
    }

    /// Attendance records for one identity within a calendar month.
    async fn history(&self, id: &str, year: i32, month: u32) -> zbus::fdo::Result<String> {
        let pipeline = Arc::clone(&self.pipeline);
        let id = id.to_string();
        let records = blocking(move || {
            pipeline.gate().history(&id, year, month).map_err(|e| match e {
                GateError::InvalidMonth { .. } => zbus::fdo::Error::InvalidArgs(e.to_string()),
                other => zbus::fdo::Error::Failed(other.to_string()),
            })
        })
        .await?;
        to_json(&records)
    }

    /// Every attendance record, oldest first.
    async fn list_attendance(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let records = blocking(move || store.all_records().map_err(failed)).await?;
        to_json(&records)
    }

    /// Each identity with at least one attendance mark.
    async fn list_attendees(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let attendees = blocking(move || store.attendees().map_err(failed)).await?;
        to_json(&attendees)
    }

    /// Delete every attendance record for one identity.
    async fn clear_identity(&self, id: &str) -> zbus::fdo::Result<u64> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        let removed = blocking(move || store.delete_by_identity(&id).map_err(failed)).await?;
        Ok(removed as u64)
    }

    /// Delete every attendance record.
    async fn clear_all(&self) -> zbus::fdo::Result<u64> {
        tracing::warn!("clearing all attendance records");
        let store = Arc::clone(&self.store);
        let removed = blocking(move || store.delete_all().map_err(failed)).await?;
        Ok(removed as u64)
    }

    /// The recognition log, oldest first.
    async fn logs(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let entries = blocking(move || store.entries().map_err(failed)).await?;
        to_json(&entries)
    }

    /// Enrolled identities in identifier order.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.pipeline.registry().snapshot();
        let identities: Vec<IdentitySummary<'_>> = snapshot
            .iter()
            .map(|r| IdentitySummary {
                id: &r.id,
                name: &r.name,
                samples: r.samples.len(),
                enrolled_at: r.enrolled_at,
            })
            .collect();
        to_json(&identities)
    }

    /// Forget an enrolled identity. Its attendance history is kept.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        let pipeline = Arc::clone(&self.pipeline);
        let id = id.to_string();
        blocking(move || pipeline.remove(&id).map_err(failed)).await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at,
            "identities": self.pipeline.registry().len(),
            "matcher": self.matcher,
            "workers": self.workers,
            "models_loaded": true,
        })
        .to_string())
    }
}

/// Map D-Bus recognize arguments to an optional period.
pub fn period_from_args(lecture: &str, slot: i32) -> Option<Period> {
    if lecture.is_empty() {
        return None;
    }
    Some(Period::new(lecture, u32::try_from(slot).ok()))
}

/// Run a database call on tokio's blocking pool, off the D-Bus executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> zbus::fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(failed)?
}

fn engine_error(err: EngineError) -> zbus::fdo::Error {
    match &err {
        EngineError::Pipeline(e) if e.is_image_problem() => zbus::fdo::Error::InvalidArgs(err.to_string()),
        _ => {
            tracing::error!(error = %err, "engine request failed");
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_from_args() {
        assert_eq!(period_from_args("", 3), None);
        assert_eq!(period_from_args("DBMS", -1), Some(Period::new("DBMS", None)));
        assert_eq!(period_from_args("DBMS", 2), Some(Period::new("DBMS", Some(2))));
    }

    #[tokio::test]
    async fn test_blocking_runs_off_the_caller() {
        let caller = std::thread::current().id();
        let worker = blocking(move || Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(worker, caller);

        let err = blocking(|| Err::<(), _>(failed("nope"))).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(msg) if msg == "nope"));
    }
}

use anyhow::{Context, Result};
use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use rollcall_core::registry::IdentityStore;
use rollcall_core::{
    AttendanceGate, DescriptorExtractor, ExtractorConfig, FaceLocalizer, IdentityRegistry, Pipeline,
};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        matcher = ?config.matcher,
        workers = config.workers,
        multi_face = config.multi_face,
        "configuration loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path).context("opening attendance database")?);

    let registry = Arc::new(IdentityRegistry::new());
    registry.restore(store.load_identities().context("loading enrolled identities")?);

    // Fail fast: no point serving requests without both models.
    let (detector, embedder) = engine::load_models(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.intra_threads,
    )?;

    let gate = AttendanceGate::new(store.clone()).with_fast_path(config.fast_path);
    let pipeline = Arc::new(
        Pipeline::new(
            FaceLocalizer::new(Box::new(detector), config.detector_config()),
            DescriptorExtractor::new(Box::new(embedder), ExtractorConfig::default()),
            gate,
        )
        .with_registry(registry)
        .with_matcher(config.matcher_kind().build())
        .with_log(store.clone())
        .with_identity_store(store.clone()),
    );

    let engine = engine::spawn_engine(Arc::clone(&pipeline), config.workers)?;

    let service = AttendanceService {
        engine,
        pipeline,
        store,
        started_at: chrono::Utc::now(),
        matcher: format!("{:?}", config.matcher_kind()),
        workers: config.workers,
    };

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

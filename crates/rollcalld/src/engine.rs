use chrono::NaiveDate;
use rollcall_core::models::{ModelError, OnnxDetector, OnnxEmbedder};
use rollcall_core::pipeline::{EnrollReport, Recognition};
use rollcall_core::{FaceBox, Period, Pipeline, PipelineError};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine workers.
enum EngineRequest {
    Enroll {
        id: String,
        name: String,
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        date: NaiveDate,
        period: Option<Period>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceBox>, EngineError>>,
    },
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request enrollment of `id` from encoded images.
    pub async fn enroll(&self, id: String, name: String, images: Vec<Vec<u8>>) -> Result<EnrollReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            id,
            name,
            images,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request recognition of every face in an encoded image.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        date: NaiveDate,
        period: Option<Period>,
    ) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Recognize {
            image,
            date,
            period,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request detection only.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<FaceBox>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Detect { image, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load both ONNX models. Fails fast if either is missing or invalid.
pub fn load_models(
    detector_path: &str,
    embedder_path: &str,
    intra_threads: usize,
) -> Result<(OnnxDetector, OnnxEmbedder), EngineError> {
    let detector = OnnxDetector::load(detector_path, intra_threads)?;
    tracing::info!(path = detector_path, "RetinaFace detector loaded");

    let embedder = OnnxEmbedder::load(embedder_path, intra_threads)?;
    tracing::info!(path = embedder_path, "ArcFace embedder loaded");

    Ok((detector, embedder))
}

/// Spawn `workers` OS threads that serve requests against a shared pipeline.
///
/// Workers take turns pulling from one queue; each request runs to completion
/// on the worker that received it.
pub fn spawn_engine(pipeline: Arc<Pipeline>, workers: usize) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers.max(1) * 4);
    let rx = Arc::new(Mutex::new(rx));

    for worker in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        std::thread::Builder::new()
            .name(format!("rollcall-engine-{worker}"))
            .spawn(move || {
                tracing::info!(worker, "engine worker started");
                while let Some(req) = next_request(&rx) {
                    serve(&pipeline, req);
                }
                tracing::info!(worker, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    Ok(EngineHandle { tx })
}

fn next_request(rx: &Mutex<mpsc::Receiver<EngineRequest>>) -> Option<EngineRequest> {
    let mut guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.blocking_recv()
}

fn serve(pipeline: &Pipeline, req: EngineRequest) {
    match req {
        EngineRequest::Enroll {
            id,
            name,
            images,
            reply,
        } => {
            let result = pipeline.enroll(&id, &name, &images).map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Recognize {
            image,
            date,
            period,
            reply,
        } => {
            let result = pipeline
                .recognize(&image, date, period)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Detect { image, reply } => {
            let result = pipeline.detect(&image).map_err(EngineError::from);
            let _ = reply.send(result);
        }
    }
}

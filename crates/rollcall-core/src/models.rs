//! Numeric model seams and their ONNX Runtime implementations.
//!
//! The pipeline only sees two opaque functions: `detect(tensor) → (loc, conf)`
//! and `embed(tensor) → vector`. ONNX sessions need `&mut` to run, so each
//! instance serializes calls behind a mutex.

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0} (place the ONNX files in the model directory)")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw RetinaFace head output, one row per anchor.
#[derive(Debug, Clone, Default)]
pub struct RawDetections {
    /// Box regression deltas, 4 per anchor.
    pub loc: Vec<f32>,
    /// (background, face) scores, 2 per anchor.
    pub conf: Vec<f32>,
}

pub trait DetectionModel: Send + Sync {
    fn detect(&self, input: &Array4<f32>) -> Result<RawDetections, ModelError>;
}

pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError>;
}

fn load_session(model_path: &str, intra_threads: usize) -> Result<Session, ModelError> {
    if !Path::new(model_path).exists() {
        return Err(ModelError::ModelUnavailable(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(intra_threads)
        .map_err(ort::Error::from)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Output tensor indices: (loc, conf).
type DetectorOutputIndices = (usize, usize);

/// RetinaFace detector session.
#[derive(Debug)]
pub struct OnnxDetector {
    session: Mutex<Session>,
    outputs: DetectorOutputIndices,
}

impl OnnxDetector {
    /// Load the RetinaFace ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ModelError> {
        let session = load_session(model_path, intra_threads)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded RetinaFace model"
        );

        if output_names.len() < 2 {
            return Err(ModelError::InferenceFailed(format!(
                "RetinaFace model requires loc and conf outputs, got {}",
                output_names.len()
            )));
        }

        let outputs = discover_output_indices(&output_names);
        tracing::debug!(?outputs, "RetinaFace output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            outputs,
        })
    }
}

impl DetectionModel for OnnxDetector {
    fn detect(&self, input: &Array4<f32>) -> Result<RawDetections, ModelError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceFailed("detector session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (loc_idx, conf_idx) = self.outputs;
        let (_, loc) = outputs[loc_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("loc: {e}")))?;
        let (_, conf) = outputs[conf_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("conf: {e}")))?;

        Ok(RawDetections {
            loc: loc.to_vec(),
            conf: conf.to_vec(),
        })
    }
}

/// Discover output tensor ordering by name.
///
/// RetinaFace exports usually name their heads "loc", "conf" and "landms".
/// Generic numeric names fall back to the standard ordering: [0] = loc, [1] = conf.
fn discover_output_indices(names: &[String]) -> DetectorOutputIndices {
    let find = |target: &str| names.iter().position(|n| n == target);

    match (find("loc"), find("conf")) {
        (Some(loc), Some(conf)) => {
            tracing::info!("RetinaFace: using name-based output tensor mapping");
            (loc, conf)
        }
        _ => {
            tracing::info!(
                ?names,
                "RetinaFace: output names not recognized, using positional mapping [0]=loc, [1]=conf"
            );
            (0, 1)
        }
    }
}

/// ArcFace embedding session.
#[derive(Debug)]
pub struct OnnxEmbedder {
    session: Mutex<Session>,
}

impl OnnxEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ModelError> {
        let session = load_session(model_path, intra_threads)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceFailed("embedder session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_discover_output_indices_named() {
        assert_eq!(discover_output_indices(&names(&["loc", "conf", "landms"])), (0, 1));
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        assert_eq!(discover_output_indices(&names(&["landms", "conf", "loc"])), (2, 1));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        assert_eq!(discover_output_indices(&names(&["output0", "592", "591"])), (0, 1));
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let err = OnnxEmbedder::load("/nonexistent/w600k_r50.onnx", 1).err().unwrap();
        assert!(matches!(err, ModelError::ModelUnavailable(_)));
        let err = OnnxDetector::load("/nonexistent/retinaface.onnx", 1).err().unwrap();
        assert!(matches!(err, ModelError::ModelUnavailable(_)));
    }
}

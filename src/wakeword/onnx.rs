//! ONNX Runtime inference for the openWakeWord models
//!
//! Expects the model directory to contain `melspectrogram.onnx`,
//! `embedding_model.onnx` and one `<wake_word>.onnx` classifier per
//! supported wake word.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ndarray::ArrayD;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::engine::{InferenceEngine, ModelKind, ModelProvider, is_supported};
use crate::{Error, Result};

/// Shared mel model file name
pub const MELSPECTROGRAM_FILE: &str = "melspectrogram.onnx";

/// Shared embedding model file name
pub const EMBEDDING_FILE: &str = "embedding_model.onnx";

/// ONNX sessions for one wake word
pub struct OnnxEngine {
    melspectrogram: Mutex<Session>,
    embedding: Mutex<Session>,
    classifier: Mutex<Session>,
}

impl OnnxEngine {
    /// Load the three sessions from `model_dir`
    ///
    /// # Errors
    ///
    /// Returns error if a model file is missing or fails to load
    pub fn load(model_dir: &Path, wake_word: &str) -> Result<Self> {
        let engine = Self {
            melspectrogram: Mutex::new(load_session(&model_dir.join(MELSPECTROGRAM_FILE))?),
            embedding: Mutex::new(load_session(&model_dir.join(EMBEDDING_FILE))?),
            classifier: Mutex::new(load_session(
                &model_dir.join(format!("{wake_word}.onnx")),
            )?),
        };

        tracing::info!(
            model_dir = %model_dir.display(),
            wake_word,
            "wake word models loaded"
        );
        Ok(engine)
    }

    const fn session(&self, model: ModelKind) -> &Mutex<Session> {
        match model {
            ModelKind::Melspectrogram => &self.melspectrogram,
            ModelKind::Embedding => &self.embedding,
            ModelKind::Classifier => &self.classifier,
        }
    }
}

fn load_session(path: &Path) -> Result<Session> {
    if !path.exists() {
        return Err(Error::WakeWord(format!(
            "model not found: {}",
            path.display()
        )));
    }

    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(1))
        .and_then(|b| b.with_inter_threads(1))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| Error::Inference(format!("{}: {e}", path.display())))
}

impl InferenceEngine for OnnxEngine {
    fn run(&self, model: ModelKind, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let tensor = Tensor::from_array(input)
            .map_err(|e| Error::Inference(format!("{}: {e}", model.name())))?;

        let mut session = self
            .session(model)
            .lock()
            .map_err(|_| Error::Inference(format!("{} session poisoned", model.name())))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| Error::Inference(format!("{}: {e}", model.name())))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| Error::Inference(format!("{}: {e}", model.name())))?;

        Ok(output.to_owned())
    }
}

/// Loads [`OnnxEngine`]s from a model directory
pub struct OnnxModelProvider {
    model_dir: PathBuf,
}

impl OnnxModelProvider {
    /// Provider reading models from `model_dir`
    #[must_use]
    pub const fn new(model_dir: PathBuf) -> Self {
        Self { model_dir }
    }
}

impl ModelProvider for OnnxModelProvider {
    fn load(&self, wake_word: &str) -> Result<Arc<dyn InferenceEngine>> {
        if !is_supported(wake_word) {
            return Err(Error::WakeWord(format!("unsupported wake word: {wake_word}")));
        }
        Ok(Arc::new(OnnxEngine::load(&self.model_dir, wake_word)?))
    }
}

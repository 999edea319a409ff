//! Wake word detection
//!
//! A streaming openWakeWord pipeline ([`Model`]) wrapped in a debounced
//! [`WakeWordDetector`]. Inference is reached through [`InferenceEngine`];
//! the ONNX Runtime backend is enabled with the `onnx` feature.

mod detector;
mod engine;
mod model;
#[cfg(feature = "onnx")]
mod onnx;

use std::path::PathBuf;
use std::sync::Arc;

pub use detector::{DEBOUNCE_CHUNKS, Detection, WakeWordDetector};
pub use engine::{
    InferenceEngine, ModelKind, ModelProvider, SUPPORTED_WAKE_WORDS, StaticModelProvider,
    is_supported, phrase,
};
pub use model::{
    CHUNK_SAMPLES, CLASSIFIER_FRAMES, EMBEDDING_BUFFER_MAX, EMBEDDING_DIM, EMBEDDING_STEP,
    EMBEDDING_WINDOW, MEL_BINS, MEL_BUFFER_MAX, MEL_CONTEXT_SAMPLES, Model, RAW_BUFFER_CAPACITY,
    Score,
};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxEngine, OnnxModelProvider};

/// Model provider for this build
///
/// Without the `onnx` feature every load fails, which leaves the satellite
/// able to stream audio on request but unable to detect wake words.
#[must_use]
pub fn default_provider(model_dir: PathBuf) -> Arc<dyn ModelProvider> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(OnnxModelProvider::new(model_dir))
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(NoRuntimeProvider { model_dir })
    }
}

#[cfg(not(feature = "onnx"))]
struct NoRuntimeProvider {
    model_dir: PathBuf,
}

#[cfg(not(feature = "onnx"))]
impl ModelProvider for NoRuntimeProvider {
    fn load(&self, wake_word: &str) -> crate::Result<Arc<dyn InferenceEngine>> {
        Err(crate::Error::WakeWord(format!(
            "cannot load {wake_word} from {}: built without the `onnx` feature",
            self.model_dir.display()
        )))
    }
}

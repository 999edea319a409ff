//! Inference boundary for the wake word models
//!
//! The pipeline treats the three models as opaque tensor functions. Anything
//! that can map an input tensor to an output tensor for a [`ModelKind`] can
//! drive it, which keeps the buffering logic testable without a runtime.

use std::sync::Arc;

use ndarray::ArrayD;

use crate::Result;

/// Wake word phrases with bundled classifier models
pub const SUPPORTED_WAKE_WORDS: &[&str] = &[
    "alexa",
    "hey_jarvis",
    "hey_mycroft",
    "hey_rhasspy",
    "ok_nabu",
    "ok_computer",
];

/// Check whether a classifier exists for a wake word
#[must_use]
pub fn is_supported(wake_word: &str) -> bool {
    SUPPORTED_WAKE_WORDS.contains(&wake_word)
}

/// Human-readable phrase for a wake word model name
///
/// `hey_jarvis` becomes `Hey Jarvis`.
#[must_use]
pub fn phrase(wake_word: &str) -> String {
    wake_word
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The three stages of the openWakeWord pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Raw samples `[1, n]` → mel frames `[.., frames, 32]`
    Melspectrogram,
    /// Mel windows `[batch, 76, 32, 1]` → embeddings `[batch, .., 96]`
    Embedding,
    /// Embedding history `[1, 16, 96]` → probability `[1, 1]`
    Classifier,
}

impl ModelKind {
    /// Model name used in logs and file lookups
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Melspectrogram => "melspectrogram",
            Self::Embedding => "embedding",
            Self::Classifier => "classifier",
        }
    }
}

/// Runs one of the pipeline models on an input tensor
pub trait InferenceEngine: Send + Sync {
    /// Evaluate `model` on `input`
    ///
    /// # Errors
    ///
    /// Returns error if the model rejects the input or the runtime fails
    fn run(&self, model: ModelKind, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// Loads an inference engine for a wake word
pub trait ModelProvider: Send + Sync {
    /// Load the models needed to detect `wake_word`
    ///
    /// # Errors
    ///
    /// Returns error if the models cannot be found or loaded
    fn load(&self, wake_word: &str) -> Result<Arc<dyn InferenceEngine>>;
}

/// Provider that always hands out the same engine
///
/// Useful when a single engine serves every wake word, as in tests.
pub struct StaticModelProvider {
    engine: Arc<dyn InferenceEngine>,
}

impl StaticModelProvider {
    /// Wrap an engine
    #[must_use]
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine }
    }
}

impl ModelProvider for StaticModelProvider {
    fn load(&self, _wake_word: &str) -> Result<Arc<dyn InferenceEngine>> {
        Ok(Arc::clone(&self.engine))
    }
}

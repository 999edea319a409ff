//! Debounced wake word detection on top of the streaming model

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::engine::{InferenceEngine, ModelProvider};
use super::model::Model;
use crate::Result;

/// Processed chunks ignored after a detection (1.6 s)
pub const DEBOUNCE_CHUNKS: u32 = 20;

/// A wake word detection
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Wake word model name
    pub wake_word: String,
    /// Classifier score that crossed the threshold
    pub probability: f32,
    /// When the detection fired
    pub timestamp: DateTime<Utc>,
}

/// Wake word detector with a post-detection calm period
pub struct WakeWordDetector {
    model: Model,
    wake_word: String,
    calm: u32,
}

impl WakeWordDetector {
    /// Create a detector for `wake_word` on an engine
    ///
    /// # Errors
    ///
    /// Returns error if the model warm-up fails
    pub fn new(engine: Arc<dyn InferenceEngine>, wake_word: impl Into<String>) -> Result<Self> {
        Ok(Self {
            model: Model::new(engine)?,
            wake_word: wake_word.into(),
            calm: 0,
        })
    }

    /// Load the models for `wake_word` from a provider
    ///
    /// # Errors
    ///
    /// Returns error if the models cannot be loaded or warmed up
    pub fn load(provider: &dyn ModelProvider, wake_word: &str) -> Result<Self> {
        let engine = provider.load(wake_word)?;
        Self::new(engine, wake_word)
    }

    /// Wake word this detector listens for
    #[must_use]
    pub fn wake_word(&self) -> &str {
        &self.wake_word
    }

    /// Underlying model
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Feed normalised samples and report a detection
    ///
    /// Inference failures are logged and count as no detection. The calm
    /// period counts chunks, so one call covering several chunks uses up
    /// several chunks of it.
    pub fn process(&mut self, samples: &[f32], threshold: f32) -> Option<Detection> {
        let (probability, chunks) = match self.model.score(samples) {
            Ok(Some(score)) => (
                score.probability,
                u32::try_from(score.chunks).unwrap_or(u32::MAX),
            ),
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, wake_word = %self.wake_word, "wake word inference failed");
                return None;
            }
        };

        // The score belongs to the newest chunk
        if self.calm >= chunks {
            self.calm -= chunks;
            return None;
        }
        self.calm = 0;

        if probability < threshold {
            return None;
        }

        self.calm = DEBOUNCE_CHUNKS;
        tracing::info!(
            wake_word = %self.wake_word,
            probability,
            threshold,
            "wake word detected"
        );

        Some(Detection {
            wake_word: self.wake_word.clone(),
            probability,
            timestamp: Utc::now(),
        })
    }
}

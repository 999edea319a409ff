//! Streaming openWakeWord feature pipeline
//!
//! Audio arrives in small, irregular chunks. The model keeps three rolling
//! buffers so that each new 80 ms chunk only costs one incremental pass:
//!
//! 1. raw samples (10 s ring), of which the newest chunk plus 480 samples of
//!    context are converted to mel frames
//! 2. mel frames (32 bins), from which a 76-frame window ending at each new
//!    chunk boundary is embedded
//! 3. embeddings (96 dims), the newest 16 of which are scored by the
//!    wake word classifier

use std::collections::VecDeque;
use std::sync::Arc;

use ndarray::{Array2, Array3, Array4};
use rand::Rng;

use super::engine::{InferenceEngine, ModelKind};
use crate::{Error, Result};

/// Samples per processing step (80 ms at 16 kHz)
pub const CHUNK_SAMPLES: usize = 1280;

/// Raw sample history (10 s at 16 kHz)
pub const RAW_BUFFER_CAPACITY: usize = 160_000;

/// Extra samples fed to the mel model ahead of each new chunk
pub const MEL_CONTEXT_SAMPLES: usize = 480;

/// Mel bins per frame
pub const MEL_BINS: usize = 32;

/// Maximum retained mel frames
pub const MEL_BUFFER_MAX: usize = 970;

/// Mel frames per embedding window
pub const EMBEDDING_WINDOW: usize = 76;

/// Mel frames between consecutive embedding windows
pub const EMBEDDING_STEP: usize = 8;

/// Embedding vector width
pub const EMBEDDING_DIM: usize = 96;

/// Maximum retained embeddings
pub const EMBEDDING_BUFFER_MAX: usize = 120;

/// Embeddings scored by the classifier
pub const CLASSIFIER_FRAMES: usize = 16;

/// Noise used to seed the embedding buffer (4 s)
const WARMUP_SAMPLES: usize = 64_000;

type MelFrame = [f32; MEL_BINS];
type Embedding = [f32; EMBEDDING_DIM];

/// Classifier output for one call to [`Model::score`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    /// Wake word probability after the newest chunk
    pub probability: f32,
    /// Chunks completed by this call; the classifier runs once per call
    pub chunks: usize,
}

/// Incremental wake word scorer
pub struct Model {
    engine: Arc<dyn InferenceEngine>,
    raw: VecDeque<f32>,
    remainder: Vec<f32>,
    accumulated: usize,
    mel: VecDeque<MelFrame>,
    embeddings: VecDeque<Embedding>,
    last_probability: Option<f32>,
}

impl Model {
    /// Build a model and seed its buffers
    ///
    /// The mel buffer starts with one window of ones and the embedding
    /// buffer with the embeddings of 4 s of low-level noise, so the
    /// classifier has a full history from the first chunk.
    ///
    /// # Errors
    ///
    /// Returns error if the warm-up inference fails
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let mut model = Self {
            engine,
            raw: VecDeque::with_capacity(RAW_BUFFER_CAPACITY),
            remainder: Vec::new(),
            accumulated: 0,
            mel: std::iter::repeat_n([1.0; MEL_BINS], EMBEDDING_WINDOW).collect(),
            embeddings: VecDeque::with_capacity(EMBEDDING_BUFFER_MAX),
            last_probability: None,
        };
        model.warm_up()?;
        Ok(model)
    }

    fn warm_up(&mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let noise: Vec<f32> = (0..WARMUP_SAMPLES)
            .map(|_| f32::from(rng.gen_range(-1000_i16..1000)))
            .collect();

        let frames = melspectrogram(self.engine.as_ref(), &noise)?;
        let starts: Vec<usize> = (0..)
            .step_by(EMBEDDING_STEP)
            .take_while(|start| start + EMBEDDING_WINDOW <= frames.len())
            .collect();
        let embeddings = embed(self.engine.as_ref(), &frames, &starts)?;

        self.push_embeddings(embeddings);
        tracing::debug!(
            embeddings = self.embeddings.len(),
            "wake word model warmed up"
        );
        Ok(())
    }

    /// Feed samples and score the wake word if a full chunk completed
    ///
    /// Returns `None` while fewer than [`CHUNK_SAMPLES`] unprocessed samples
    /// are buffered.
    ///
    /// # Errors
    ///
    /// Returns error if any model fails; buffered audio is kept and the
    /// next chunk starts from a clean count.
    pub fn predict(&mut self, samples: &[f32]) -> Result<Option<f32>> {
        Ok(self.score(samples)?.map(|score| score.probability))
    }

    /// Like [`Model::predict`], also reporting how many chunks completed
    ///
    /// # Errors
    ///
    /// Returns error if any model fails
    pub fn score(&mut self, samples: &[f32]) -> Result<Option<Score>> {
        let chunks = self.streaming_features(samples)?;
        if chunks == 0 {
            return Ok(None);
        }

        if self.embeddings.len() < CLASSIFIER_FRAMES {
            return Err(Error::WakeWord(format!(
                "need {CLASSIFIER_FRAMES} embeddings, have {}",
                self.embeddings.len()
            )));
        }

        let start = self.embeddings.len() - CLASSIFIER_FRAMES;
        let data: Vec<f32> = self
            .embeddings
            .range(start..)
            .flat_map(|e| e.iter().copied())
            .collect();
        let input = Array3::from_shape_vec((1, CLASSIFIER_FRAMES, EMBEDDING_DIM), data)
            .map_err(|e| Error::Inference(e.to_string()))?;

        let output = self.engine.run(ModelKind::Classifier, input.into_dyn())?;
        let probability = output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::Inference("classifier returned no score".to_string()))?;

        self.last_probability = Some(probability);
        Ok(Some(Score {
            probability,
            chunks,
        }))
    }

    /// Buffer samples and extend the mel and embedding buffers
    ///
    /// Returns the number of chunks processed.
    fn streaming_features(&mut self, samples: &[f32]) -> Result<usize> {
        let mut incoming = std::mem::take(&mut self.remainder);
        incoming.extend_from_slice(samples);

        let total = self.accumulated + incoming.len();
        if total >= CHUNK_SAMPLES {
            let keep = incoming.len() - total % CHUNK_SAMPLES;
            self.push_raw(&incoming[..keep]);
            self.accumulated += keep;
            self.remainder = incoming.split_off(keep);
        } else {
            self.push_raw(&incoming);
            self.accumulated += incoming.len();
        }

        if self.accumulated < CHUNK_SAMPLES || self.accumulated % CHUNK_SAMPLES != 0 {
            return Ok(0);
        }

        let accumulated = std::mem::take(&mut self.accumulated);
        let chunks = accumulated / CHUNK_SAMPLES;

        let context = (accumulated + MEL_CONTEXT_SAMPLES).min(self.raw.len());
        let window: Vec<f32> = self
            .raw
            .range(self.raw.len() - context..)
            .copied()
            .collect();
        let frames = melspectrogram(self.engine.as_ref(), &window)?;
        self.mel.extend(frames);
        let excess = self.mel.len().saturating_sub(MEL_BUFFER_MAX);
        self.mel.drain(..excess);

        // One window per new chunk, oldest first, each ending 8 frames
        // after the previous one
        let mel = self.mel.make_contiguous();
        let starts: Vec<usize> = (0..chunks)
            .rev()
            .filter_map(|i| {
                mel.len()
                    .checked_sub(EMBEDDING_STEP * i)?
                    .checked_sub(EMBEDDING_WINDOW)
            })
            .collect();
        let embeddings = embed(self.engine.as_ref(), mel, &starts)?;
        self.push_embeddings(embeddings);

        Ok(chunks)
    }

    fn push_raw(&mut self, samples: &[f32]) {
        self.raw.extend(samples);
        let excess = self.raw.len().saturating_sub(RAW_BUFFER_CAPACITY);
        self.raw.drain(..excess);
    }

    fn push_embeddings(&mut self, embeddings: Vec<Embedding>) {
        self.embeddings.extend(embeddings);
        let excess = self.embeddings.len().saturating_sub(EMBEDDING_BUFFER_MAX);
        self.embeddings.drain(..excess);
    }

    /// Most recent classifier score
    #[must_use]
    pub const fn last_probability(&self) -> Option<f32> {
        self.last_probability
    }

    /// Number of buffered raw samples
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Number of buffered mel frames
    #[must_use]
    pub fn mel_len(&self) -> usize {
        self.mel.len()
    }

    /// Number of buffered embeddings
    #[must_use]
    pub fn embedding_len(&self) -> usize {
        self.embeddings.len()
    }
}

/// Run the mel model and apply the `x / 10 + 2` scaling
fn melspectrogram(engine: &dyn InferenceEngine, samples: &[f32]) -> Result<Vec<MelFrame>> {
    let input = Array2::from_shape_vec((1, samples.len()), samples.to_vec())
        .map_err(|e| Error::Inference(e.to_string()))?;
    let output = engine.run(ModelKind::Melspectrogram, input.into_dyn())?;

    if output.len() % MEL_BINS != 0 {
        return Err(Error::Inference(format!(
            "melspectrogram output of {} values is not a multiple of {MEL_BINS}",
            output.len()
        )));
    }

    let values: Vec<f32> = output.iter().map(|x| x / 10.0 + 2.0).collect();
    Ok(values
        .chunks_exact(MEL_BINS)
        .map(|bins| {
            let mut frame = [0.0; MEL_BINS];
            frame.copy_from_slice(bins);
            frame
        })
        .collect())
}

/// Embed the windows of `frames` starting at each of `starts`
fn embed(
    engine: &dyn InferenceEngine,
    frames: &[MelFrame],
    starts: &[usize],
) -> Result<Vec<Embedding>> {
    if starts.is_empty() {
        return Ok(Vec::new());
    }

    let data: Vec<f32> = starts
        .iter()
        .flat_map(|&start| frames[start..start + EMBEDDING_WINDOW].iter().flatten())
        .copied()
        .collect();
    let input = Array4::from_shape_vec((starts.len(), EMBEDDING_WINDOW, MEL_BINS, 1), data)
        .map_err(|e| Error::Inference(e.to_string()))?;
    let output = engine.run(ModelKind::Embedding, input.into_dyn())?;

    if output.len() != starts.len() * EMBEDDING_DIM {
        return Err(Error::Inference(format!(
            "expected {} embedding values, got {}",
            starts.len() * EMBEDDING_DIM,
            output.len()
        )));
    }

    let values: Vec<f32> = output.iter().copied().collect();
    Ok(values
        .chunks_exact(EMBEDDING_DIM)
        .map(|dims| {
            let mut embedding = [0.0; EMBEDDING_DIM];
            embedding.copy_from_slice(dims);
            embedding
        })
        .collect())
}

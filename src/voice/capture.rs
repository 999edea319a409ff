//! Audio capture from microphone
//!
//! A dedicated thread owns the input stream and hands fixed-size i16 chunks
//! to a callback. The callback runs on that thread, in capture order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::wakeword::CHUNK_SAMPLES;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

const RECV_POLL: Duration = Duration::from_millis(100);

/// Receives each captured chunk
pub type ChunkCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Microphone capture loop
pub trait Recorder: Send {
    /// Start delivering chunks to `on_chunk`; no-op if already recording
    ///
    /// # Errors
    ///
    /// Returns error if the audio hardware cannot be opened
    fn start(&mut self, on_chunk: ChunkCallback) -> Result<()>;

    /// Stop recording; safe to call when not recording
    fn stop(&mut self);

    /// Whether the capture loop is running
    fn is_recording(&self) -> bool;
}

/// Cuts an irregular sample stream into fixed-size chunks
#[derive(Debug)]
pub struct ChunkBuffer {
    size: usize,
    pending: Vec<i16>,
}

impl ChunkBuffer {
    /// Buffer emitting chunks of `size` samples
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            pending: Vec::with_capacity(size * 2),
        }
    }

    /// Append samples and emit every completed chunk
    pub fn push(&mut self, samples: &[i16], mut emit: impl FnMut(&[i16])) {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.size * self.size;
        for chunk in self.pending[..complete].chunks_exact(self.size) {
            emit(chunk);
        }
        self.pending.drain(..complete);
    }

    /// Samples waiting for a full chunk
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Records the default input device at 16 kHz mono
pub struct CpalRecorder {
    chunk_samples: usize,
    worker: Option<Worker>,
}

impl Default for CpalRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalRecorder {
    /// Recorder delivering wake word sized chunks
    #[must_use]
    pub const fn new() -> Self {
        Self::with_chunk_size(CHUNK_SAMPLES)
    }

    /// Recorder delivering chunks of `chunk_samples`
    #[must_use]
    pub const fn with_chunk_size(chunk_samples: usize) -> Self {
        Self {
            chunk_samples,
            worker: None,
        }
    }
}

impl Recorder for CpalRecorder {
    fn start(&mut self, mut on_chunk: ChunkCallback) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let chunk_samples = self.chunk_samples;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = std::thread::Builder::new()
            .name("microphone".to_string())
            .spawn(move || {
                let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>();
                let stream = match open_input_stream(sample_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut chunks = ChunkBuffer::new(chunk_samples);
                while !thread_stop.load(Ordering::SeqCst) {
                    match sample_rx.recv_timeout(RECV_POLL) {
                        Ok(samples) => chunks.push(&samples, &mut on_chunk),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            tracing::error!("audio input stream ended");
                            break;
                        }
                    }
                }

                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Audio("capture thread exited during startup".to_string()));
            }
        }

        self.worker = Some(Worker { stop, handle });
        tracing::debug!(chunk_samples, "audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                tracing::error!("audio capture thread panicked");
            }
        }
    }

    fn is_recording(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(sample_tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let config: StreamConfig = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_possible_truncation)]
                let samples = data
                    .iter()
                    .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();
                let _ = sample_tx.send(samples);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Encode i16 samples as a mono 16-bit WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

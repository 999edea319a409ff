//! Voice processing module
//!
//! Handles microphone capture, signal conditioning, audio routing, and
//! playback of media and response audio.

mod capture;
pub mod dsp;
mod playback;
mod router;

pub use capture::{
    ChunkBuffer, ChunkCallback, CpalRecorder, Recorder, SAMPLE_RATE, samples_to_wav,
};
pub use playback::{CpalMediaPlayer, CpalPcmSink, MediaPlayer, PcmSink, Volume};
pub use router::{AudioRoute, AudioRouter};

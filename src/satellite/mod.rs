//! Satellite event server
//!
//! [`SatelliteServer`] accepts controller connections and runs one
//! connection state machine per socket. At most one connection holds the
//! active pipeline at a time; it receives wake word detections and
//! microphone audio, and its lifecycle drives the audio router through
//! [`SatelliteEvent`]s.

pub mod actions;
mod handler;
mod pairing;
mod server;

use std::sync::Arc;

pub use actions::{CustomAction, LogScreen, ScreenControl};
pub use pairing::{PairingDecision, PairingRecord, PairingStore};
pub use server::{Claim, ConnectionId, SatelliteServer};

use crate::config::{DeviceIdentity, SharedSettings};
use crate::voice::{MediaPlayer, PcmSink};

/// Whether a connection is running a satellite session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteState {
    /// No session; only handshake events are served
    Stopped,
    /// Holding the satellite session
    Running,
}

/// Progress of the voice pipeline on the active connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Idle
    Inactive,
    /// Microphone audio is streaming to the controller
    Listening,
    /// Response audio is streaming from the controller
    Streaming,
}

impl PipelineState {
    /// Lowercase name for status reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Listening => "listening",
            Self::Streaming => "streaming",
        }
    }
}

/// Lifecycle notifications for the audio router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteEvent {
    /// A session became live
    Started,
    /// The live session ended
    Stopped,
    /// The controller wants microphone audio
    RequestInputStream,
    /// The controller no longer wants microphone audio
    ReleaseInputStream,
}

/// Collaborators shared by every connection
pub struct SatelliteContext {
    /// How the satellite names itself
    pub identity: DeviceIdentity,
    /// Runtime settings
    pub settings: Arc<SharedSettings>,
    /// Controller pairing
    pub pairing: Arc<PairingStore>,
    /// Media playback
    pub media: Arc<dyn MediaPlayer>,
    /// TTS audio output
    pub speaker: Arc<dyn PcmSink>,
    /// Display surface
    pub screen: Arc<dyn ScreenControl>,
}

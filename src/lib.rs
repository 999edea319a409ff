//! Beacon Satellite - Voice satellite endpoint for home automation controllers
//!
//! This library provides the core functionality for the satellite:
//! - Event protocol server with controller pairing
//! - Streaming wake word detection
//! - Microphone routing, signal conditioning, and playback
//! - mDNS service advertisement
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Controller (TCP)                   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ events
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Satellite Server                    │
//! │   Connections  │  Pairing  │  Active Pipeline       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ lifecycle
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Audio Router                       │
//! │   Microphone  │  Auto-gain  │  Wake Word  │  Stream │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod satellite;
pub mod voice;
pub mod wakeword;

pub use config::Config;
pub use daemon::Daemon;
pub use discovery::MdnsAdvertiser;
pub use error::{Error, Result};

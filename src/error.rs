//! Error types for the satellite

use thiserror::Error;

/// Result type alias for satellite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the satellite
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected protocol traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Media or PCM playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Wake word pipeline error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Model inference error
    #[error("inference error: {0}")]
    Inference(String),

    /// Service discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Pairing record error
    #[error("pairing error: {0}")]
    Pairing(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

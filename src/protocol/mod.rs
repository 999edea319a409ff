//! Satellite event protocol
//!
//! Line-delimited JSON headers with optional binary data and payload
//! sections, compatible with Wyoming satellite peers.

pub mod events;
mod packet;

pub use events::AudioFormat;
pub use packet::{
    MAX_HEADER_BYTES, MAX_SECTION_BYTES, Packet, READ_RETRY_INTERVAL, READ_RETRY_LIMIT,
};

/// Protocol version stamped on every outbound header
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

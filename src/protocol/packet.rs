//! Wire framing for satellite events
//!
//! Each packet is a single JSON header line terminated by `\n`, followed by
//! `data_length` bytes of JSON data and `payload_length` bytes of raw
//! payload. Empty sections are omitted from the header. Older peers embed
//! `data` directly in the header line instead, which is still accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Longest accepted header line
pub const MAX_HEADER_BYTES: u64 = 64 * 1024;

/// Largest accepted data or payload section
pub const MAX_SECTION_BYTES: usize = 16 * 1024 * 1024;

/// Wait per attempt while a section is partially delivered
pub const READ_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Attempts before a partially delivered section is abandoned
pub const READ_RETRY_LIMIT: u32 = 100;

/// A decoded or outbound event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Event type, e.g. `run-satellite`
    pub kind: String,
    /// Event data (empty object when absent)
    pub data: Map<String, Value>,
    /// Raw payload (PCM audio for `audio-chunk`)
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct OutboundHeader<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
}

#[derive(Deserialize)]
struct InboundHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    data_length: Option<usize>,
    #[serde(default)]
    payload_length: Option<usize>,
}

impl Packet {
    /// Packet with no data or payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Packet with a data object
    pub fn with_data(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            payload: Vec::new(),
        }
    }

    /// Attach a payload
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// String field from the data object
    #[must_use]
    pub fn str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer field from the data object
    #[must_use]
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    /// Serialize to wire bytes
    ///
    /// # Errors
    ///
    /// Returns error if the data object cannot be serialized
    pub fn encode(&self, version: &str) -> Result<Vec<u8>> {
        let data = if self.data.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.data)?
        };

        let header = OutboundHeader {
            kind: &self.kind,
            version,
            data_length: (!data.is_empty()).then_some(data.len()),
            payload_length: (!self.payload.is_empty()).then_some(self.payload.len()),
        };

        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&data);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Encode and write to a stream
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the write fails
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, version: &str) -> Result<()> {
        let bytes = self.encode(version)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next packet
    ///
    /// Returns `Ok(None)` for a packet that was malformed or only partially
    /// delivered; the stream stays usable and the caller should keep
    /// reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] at end of stream, [`Error::Io`] on
    /// socket failure and [`Error::Protocol`] when a header declares more
    /// than the size limits allow.
    pub async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(MAX_HEADER_BYTES)
            .read_until(b'\n', &mut line)
            .await?;

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        if line.last() != Some(&b'\n') {
            if read as u64 >= MAX_HEADER_BYTES {
                return Err(Error::Protocol(format!(
                    "header line exceeds {MAX_HEADER_BYTES} bytes"
                )));
            }
            return Err(Error::ConnectionClosed);
        }

        let header: InboundHeader = match serde_json::from_slice(&line) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(error = %e, "discarding packet with malformed header");
                return Ok(None);
            }
        };

        let data_length = header.data_length.unwrap_or(0);
        let payload_length = header.payload_length.unwrap_or(0);
        if data_length > MAX_SECTION_BYTES || payload_length > MAX_SECTION_BYTES {
            return Err(Error::Protocol(format!(
                "{} declares {data_length} data and {payload_length} payload bytes",
                header.kind
            )));
        }

        let mut data = match header.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                tracing::warn!(kind = %header.kind, data = %other, "discarding packet with non-object data");
                return Ok(None);
            }
        };

        if data_length > 0 {
            let Some(bytes) = read_section(reader, data_length).await? else {
                tracing::warn!(kind = %header.kind, data_length, "data section incomplete, discarding packet");
                return Ok(None);
            };
            match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(section) => data.extend(section),
                Err(e) => {
                    tracing::warn!(kind = %header.kind, error = %e, "discarding packet with malformed data");
                    if payload_length > 0 {
                        // Keep the stream aligned on the next header
                        let _ = read_section(reader, payload_length).await?;
                    }
                    return Ok(None);
                }
            }
        }

        let payload = if payload_length > 0 {
            let Some(bytes) = read_section(reader, payload_length).await? else {
                tracing::warn!(kind = %header.kind, payload_length, "payload incomplete, discarding packet");
                return Ok(None);
            };
            bytes
        } else {
            Vec::new()
        };

        Ok(Some(Self {
            kind: header.kind,
            data,
            payload,
        }))
    }
}

/// Read exactly `len` bytes, waiting up to the retry budget for stragglers
async fn read_section<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0; len];
    let mut filled = 0;
    let mut attempts = 0;

    while filled < len {
        match tokio::time::timeout(READ_RETRY_INTERVAL, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => return Err(Error::ConnectionClosed),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                attempts += 1;
                if attempts >= READ_RETRY_LIMIT {
                    tracing::debug!(expected = len, received = filled, "section read timed out");
                    return Ok(None);
                }
            }
        }
    }

    Ok(Some(buf))
}

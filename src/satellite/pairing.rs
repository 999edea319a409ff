//! Controller pairing
//!
//! The first peer to start a satellite session becomes the paired
//! controller. From then on only that peer may start sessions, until the
//! record is cleared locally.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Persisted pairing record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    /// Identity of the paired controller (peer IP address)
    pub peer: String,
    /// When pairing happened
    pub paired_at: DateTime<Utc>,
}

/// Outcome of checking a peer against the pairing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDecision {
    /// No controller was paired; this peer is now
    Paired,
    /// This peer is the paired controller
    Matched,
    /// Another controller is paired
    Rejected,
}

/// Pairing record storage
#[derive(Debug)]
pub struct PairingStore {
    path: Option<PathBuf>,
    record: Mutex<Option<PairingRecord>>,
}

impl PairingStore {
    /// Load the record from `path`; a missing file means unpaired
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: PathBuf) -> Result<Self> {
        let record = match std::fs::read_to_string(&path) {
            Ok(content) => Some(serde_json::from_str::<PairingRecord>(&content).map_err(|e| {
                Error::Pairing(format!("invalid pairing record {}: {e}", path.display()))
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(record) = &record {
            tracing::debug!(peer = %record.peer, "loaded pairing record");
        }

        Ok(Self {
            path: Some(path),
            record: Mutex::new(record),
        })
    }

    /// Unpersisted store
    #[must_use]
    pub const fn in_memory() -> Self {
        Self {
            path: None,
            record: Mutex::new(None),
        }
    }

    /// Identity of the paired controller
    #[must_use]
    pub fn paired_peer(&self) -> Option<String> {
        self.lock().as_ref().map(|r| r.peer.clone())
    }

    /// Whether `peer` may control the satellite
    #[must_use]
    pub fn is_permitted(&self, peer: &str) -> bool {
        self.lock().as_ref().is_none_or(|r| r.peer == peer)
    }

    /// Pair with `peer` if unpaired, otherwise check it is the paired peer
    ///
    /// A record that cannot be saved still pairs for this process.
    pub fn pair_or_verify(&self, peer: &str) -> PairingDecision {
        let mut record = self.lock();

        match record.as_ref() {
            Some(existing) if existing.peer == peer => PairingDecision::Matched,
            Some(_) => PairingDecision::Rejected,
            None => {
                let new = PairingRecord {
                    peer: peer.to_string(),
                    paired_at: Utc::now(),
                };
                if let Err(e) = self.persist(Some(&new)) {
                    tracing::warn!(error = %e, "failed to save pairing record");
                }
                tracing::info!(peer, "paired with controller");
                *record = Some(new);
                PairingDecision::Paired
            }
        }
    }

    /// Forget the paired controller
    ///
    /// Returns whether a record existed.
    ///
    /// # Errors
    ///
    /// Returns error if the persisted record cannot be removed
    pub fn clear(&self) -> Result<bool> {
        let mut record = self.lock();
        let existed = record.take().is_some();
        self.persist(None)?;
        Ok(existed)
    }

    fn persist(&self, record: Option<&PairingRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match record {
            Some(record) => std::fs::write(path, serde_json::to_vec_pretty(record)?)?,
            None => {
                if let Err(e) = std::fs::remove_file(path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PairingRecord>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_peer_pairs() {
        let store = PairingStore::in_memory();
        assert!(store.is_permitted("10.0.0.5"));

        assert_eq!(store.pair_or_verify("10.0.0.5"), PairingDecision::Paired);
        assert_eq!(store.pair_or_verify("10.0.0.5"), PairingDecision::Matched);
        assert_eq!(store.pair_or_verify("10.0.0.6"), PairingDecision::Rejected);

        assert!(!store.is_permitted("10.0.0.6"));
        assert_eq!(store.paired_peer().as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairing.json");

        let store = PairingStore::load(path.clone()).unwrap();
        assert_eq!(store.paired_peer(), None);
        store.pair_or_verify("192.168.1.20");

        let reloaded = PairingStore::load(path.clone()).unwrap();
        assert_eq!(reloaded.pair_or_verify("192.168.1.21"), PairingDecision::Rejected);

        assert!(reloaded.clear().unwrap());
        assert!(!path.exists());
        assert!(!reloaded.clear().unwrap());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairing.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(PairingStore::load(path), Err(Error::Pairing(_))));
    }
}

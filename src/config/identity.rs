//! Persistent device identity

use std::path::Path;

use crate::Result;

/// File holding the device id inside the data directory
pub const DEVICE_ID_FILE: &str = "device_id";

/// How this satellite names itself to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Short hex device id
    pub device_id: String,
    /// Display name, `"<prefix> <device_id>"`
    pub name: String,
    /// Software version
    pub version: String,
}

impl DeviceIdentity {
    /// Identity for a known device id
    #[must_use]
    pub fn new(device_id: impl Into<String>, name_prefix: &str) -> Self {
        let device_id = device_id.into();
        Self {
            name: format!("{name_prefix} {device_id}"),
            device_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load the device id from `data_dir`, generating and saving one if absent
    ///
    /// # Errors
    ///
    /// Returns error if a new id cannot be written
    pub fn load_or_create(data_dir: &Path, name_prefix: &str) -> Result<Self> {
        let path = data_dir.join(DEVICE_ID_FILE);

        if let Ok(existing) = std::fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(Self::new(existing, name_prefix));
            }
        }

        let mut device_id = uuid::Uuid::new_v4().simple().to_string();
        device_id.truncate(8);
        std::fs::write(&path, &device_id)?;
        tracing::info!(device_id, path = %path.display(), "generated device id");

        Ok(Self::new(device_id, name_prefix))
    }
}

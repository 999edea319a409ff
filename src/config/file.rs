//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-satellite/config.toml` as a persistent
//! config source. All fields are optional; the file is a partial overlay on
//! top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "BEACON_SATELLITE_CONFIG";

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SatelliteConfigFile {
    /// Listener and discovery configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Device naming and storage locations
    #[serde(default)]
    pub satellite: SatelliteFileConfig,

    /// Initial runtime settings
    #[serde(default)]
    pub settings: SettingsFileConfig,
}

/// Listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Bind address (e.g. "0.0.0.0")
    pub bind: Option<String>,

    /// TCP port
    pub port: Option<u16>,

    /// Advertise over mDNS
    pub discovery: Option<bool>,
}

/// Device configuration
#[derive(Debug, Default, Deserialize)]
pub struct SatelliteFileConfig {
    /// Display name prefix
    pub name: Option<String>,

    /// Data directory (pairing record, device id)
    pub data_dir: Option<String>,

    /// Directory holding the ONNX wake word models
    pub model_dir: Option<String>,

    /// Seconds between `custom-status` reports
    pub status_interval_secs: Option<u64>,
}

/// Initial runtime settings
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFileConfig {
    pub wake_word: Option<String>,
    pub wake_word_threshold: Option<f32>,
    pub wake_word_sound: Option<String>,
    pub mic_gain: Option<i32>,
    pub music_volume: Option<f32>,
    pub ducking_volume: Option<f32>,
    pub muted: Option<bool>,
}

/// Load the config file if present
///
/// Returns `SatelliteConfigFile::default()` if the file doesn't exist or
/// can't be parsed.
pub fn load_config_file() -> SatelliteConfigFile {
    let Some(path) = config_file_path() else {
        return SatelliteConfigFile::default();
    };

    if !path.exists() {
        return SatelliteConfigFile::default();
    }

    match parse_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            SatelliteConfigFile::default()
        }
    }
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn parse_config_file(path: &std::path::Path) -> Result<SatelliteConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `$BEACON_SATELLITE_CONFIG` or
/// `~/.config/omni/beacon-satellite/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }

    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-satellite")
            .join("config.toml")
    })
}

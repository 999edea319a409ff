//! Configuration management for the satellite
//!
//! Static configuration is resolved once at startup with the priority
//! CLI/env > TOML file > defaults. Runtime settings that the controller may
//! change live in [`SharedSettings`].

pub mod file;
mod identity;
mod settings;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

pub use identity::{DEVICE_ID_FILE, DeviceIdentity};
pub use settings::{SettingChange, Settings, SharedSettings};

use crate::wakeword::is_supported;
use crate::{Error, Result};

/// Default listener port
pub const DEFAULT_PORT: u16 = 10800;

/// Default display name prefix
pub const DEFAULT_NAME: &str = "VACA";

/// Default seconds between `custom-status` reports
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

/// Satellite configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the event server binds to
    pub bind_address: IpAddr,

    /// Event server port
    pub port: u16,

    /// Advertise the satellite over mDNS
    pub discovery: bool,

    /// Display name prefix
    pub name: String,

    /// Path to data directory (pairing record, device id)
    pub data_dir: PathBuf,

    /// Directory holding the wake word models
    pub model_dir: PathBuf,

    /// Seconds between `custom-status` reports (0 disables)
    pub status_interval_secs: u64,

    /// Initial runtime settings
    pub settings: Settings,
}

/// Overrides supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub wake_word: Option<String>,
    pub disable_discovery: bool,
}

impl Config {
    /// Load configuration from env, file and defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid or the data dir cannot be created
    pub fn load() -> Result<Self> {
        Self::load_with_options(&ConfigOptions::default())
    }

    /// Load configuration with command line overrides
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid or the data dir cannot be created
    pub fn load_with_options(options: &ConfigOptions) -> Result<Self> {
        // Load optional TOML config file (env > toml > default)
        let fc = file::load_config_file();

        let bind_address = match std::env::var("BEACON_SATELLITE_BIND").ok().or(fc.server.bind) {
            Some(bind) => bind
                .parse()
                .map_err(|e| Error::Config(format!("invalid bind address {bind:?}: {e}")))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = options
            .port
            .or_else(|| {
                std::env::var("BEACON_SATELLITE_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .or(fc.server.port)
            .unwrap_or(DEFAULT_PORT);

        let discovery = !options.disable_discovery
            && std::env::var("BEACON_SATELLITE_DISCOVERY")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.server.discovery)
                .unwrap_or(true);

        let name = std::env::var("BEACON_SATELLITE_NAME")
            .ok()
            .or(fc.satellite.name)
            .unwrap_or_else(|| DEFAULT_NAME.to_string());

        let data_dir = options
            .data_dir
            .clone()
            .or_else(|| std::env::var("BEACON_SATELLITE_DATA_DIR").ok().map(PathBuf::from))
            .or_else(|| fc.satellite.data_dir.map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let model_dir = options
            .model_dir
            .clone()
            .or_else(|| std::env::var("BEACON_SATELLITE_MODEL_DIR").ok().map(PathBuf::from))
            .or_else(|| fc.satellite.model_dir.map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("models"));

        let status_interval_secs = fc
            .satellite
            .status_interval_secs
            .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS);

        let defaults = Settings::default();
        let fs = fc.settings;
        let settings = Settings {
            wake_word: options
                .wake_word
                .clone()
                .or_else(|| std::env::var("BEACON_SATELLITE_WAKE_WORD").ok())
                .or(fs.wake_word)
                .unwrap_or(defaults.wake_word),
            wake_word_threshold: fs
                .wake_word_threshold
                .unwrap_or(defaults.wake_word_threshold),
            wake_word_sound: fs.wake_word_sound.unwrap_or(defaults.wake_word_sound),
            mic_gain: fs.mic_gain.unwrap_or(defaults.mic_gain),
            music_volume: fs.music_volume.unwrap_or(defaults.music_volume),
            ducking_volume: fs.ducking_volume.unwrap_or(defaults.ducking_volume),
            muted: fs.muted.unwrap_or(defaults.muted),
            ..defaults
        };

        let config = Self {
            bind_address,
            port,
            discovery,
            name,
            data_dir,
            model_dir,
            status_interval_secs,
            settings,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that would only fail later at runtime
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if !is_supported(&self.settings.wake_word) {
            return Err(Error::Config(format!(
                "unsupported wake word: {}",
                self.settings.wake_word
            )));
        }

        for (name, value) in [
            ("wake_word_threshold", self.settings.wake_word_threshold),
            ("music_volume", self.settings.music_volume),
            ("ducking_volume", self.settings.ducking_volume),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within 0..=1, got {value}")));
            }
        }

        Ok(())
    }

    /// Path of the persisted pairing record
    #[must_use]
    pub fn pairing_path(&self) -> PathBuf {
        self.data_dir.join("pairing.json")
    }

    /// Directory searched for named wake word sounds
    #[must_use]
    pub fn sounds_dir(&self) -> PathBuf {
        self.data_dir.join("sounds")
    }
}

/// Platform data directory, e.g. `~/.local/share/omni/beacon-satellite`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/beacon-satellite"),
        |d| d.data_dir().join("omni").join("beacon-satellite"),
    )
}

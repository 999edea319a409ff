//! Runtime settings shared across the satellite
//!
//! Settings change at runtime through `custom-settings` events. Consumers
//! subscribe to [`SettingChange`] notifications and react only to the
//! variants they care about.

use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::protocol::AudioFormat;
use crate::wakeword::is_supported;

const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// `wake_word_sound` value that disables the detection sound
pub const NO_SOUND: &str = "none";

/// Satellite runtime settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Active wake word model
    pub wake_word: String,
    /// Detection threshold in [0, 1]
    pub wake_word_threshold: f32,
    /// Sound played on detection; a name, file path or URL, or "none"
    pub wake_word_sound: String,
    /// Microphone auto-gain sensitivity
    pub mic_gain: i32,
    /// Media playback volume in [0, 1]
    pub music_volume: f32,
    /// Media volume while a voice interaction is active
    pub ducking_volume: f32,
    /// Drop all microphone audio
    pub muted: bool,
    /// Microphone sample rate
    pub sample_rate: u32,
    /// Microphone bytes per sample
    pub audio_width: u16,
    /// Microphone channels
    pub audio_channels: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wake_word: "hey_jarvis".to_string(),
            wake_word_threshold: 0.6,
            wake_word_sound: NO_SOUND.to_string(),
            mic_gain: 0,
            music_volume: 0.8,
            ducking_volume: 0.1,
            muted: false,
            sample_rate: AudioFormat::MICROPHONE.rate,
            audio_width: AudioFormat::MICROPHONE.width,
            audio_channels: AudioFormat::MICROPHONE.channels,
        }
    }
}

impl Settings {
    /// Microphone stream format
    #[must_use]
    pub const fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            rate: self.sample_rate,
            width: self.audio_width,
            channels: self.audio_channels,
        }
    }

    /// Sound to play on detection, if enabled
    #[must_use]
    pub fn detection_sound(&self) -> Option<&str> {
        let sound = self.wake_word_sound.trim();
        (!sound.is_empty() && !sound.eq_ignore_ascii_case(NO_SOUND)).then_some(sound)
    }
}

/// A single changed setting
#[derive(Debug, Clone, PartialEq)]
pub enum SettingChange {
    /// Wake word model name
    WakeWord(String),
    /// Detection threshold in [0, 1]
    WakeWordThreshold(f32),
    /// Detection sound, or "none"
    WakeWordSound(String),
    /// Auto-gain sensitivity
    MicGain(i32),
    /// Media volume in [0, 1]
    MusicVolume(f32),
    /// Ducked media volume in [0, 1]
    DuckingVolume(f32),
    /// Microphone mute
    Muted(bool),
}

/// Settings behind a lock with change notifications
#[derive(Debug)]
pub struct SharedSettings {
    inner: RwLock<Settings>,
    changes: broadcast::Sender<SettingChange>,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SharedSettings {
    /// Wrap initial settings
    #[must_use]
    pub fn new(initial: Settings) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(initial),
            changes,
        }
    }

    /// Copy of the current settings
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read a single value without cloning the whole struct
    pub fn read<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Subscribe to change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }

    /// Apply one change; notifies subscribers only if the value differs
    pub fn set(&self, change: SettingChange) -> bool {
        let changed = {
            let mut settings = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            match &change {
                SettingChange::WakeWord(v) => replace(&mut settings.wake_word, v.clone()),
                SettingChange::WakeWordThreshold(v) => {
                    replace(&mut settings.wake_word_threshold, *v)
                }
                SettingChange::WakeWordSound(v) => {
                    replace(&mut settings.wake_word_sound, v.clone())
                }
                SettingChange::MicGain(v) => replace(&mut settings.mic_gain, *v),
                SettingChange::MusicVolume(v) => replace(&mut settings.music_volume, *v),
                SettingChange::DuckingVolume(v) => replace(&mut settings.ducking_volume, *v),
                SettingChange::Muted(v) => replace(&mut settings.muted, *v),
            }
        };

        if changed {
            tracing::info!(?change, "setting changed");
            // No subscribers is fine
            let _ = self.changes.send(change);
        }
        changed
    }

    /// Apply a `custom-settings` object from the controller
    ///
    /// Percentages (threshold, volumes) arrive as 0-100. Unknown keys and
    /// invalid values are skipped. Returns the changes that took effect.
    pub fn apply_remote(&self, values: &Map<String, Value>) -> Vec<SettingChange> {
        let mut applied = Vec::new();

        for (key, value) in values {
            let Some(change) = parse_remote(key, value) else {
                tracing::debug!(key, %value, "ignoring setting");
                continue;
            };
            if self.set(change.clone()) {
                applied.push(change);
            }
        }

        applied
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[allow(clippy::cast_possible_truncation)]
fn percent(value: &Value) -> Option<f32> {
    number(value).map(|v| (v / 100.0).clamp(0.0, 1.0) as f32)
}

#[allow(clippy::cast_possible_truncation)]
fn parse_remote(key: &str, value: &Value) -> Option<SettingChange> {
    match key {
        "wake_word" => {
            let wake_word = value.as_str()?;
            if !is_supported(wake_word) {
                tracing::warn!(wake_word, "unsupported wake word requested");
                return None;
            }
            Some(SettingChange::WakeWord(wake_word.to_string()))
        }
        "wake_word_threshold" => percent(value).map(SettingChange::WakeWordThreshold),
        "wake_word_sound" => value
            .as_str()
            .map(|sound| SettingChange::WakeWordSound(sound.trim().to_string())),
        "music_volume" => percent(value).map(SettingChange::MusicVolume),
        "ducking_volume" => percent(value).map(SettingChange::DuckingVolume),
        "mic_gain" => number(value).map(|v| SettingChange::MicGain(v.round() as i32)),
        "mute" => value
            .as_bool()
            .or_else(|| value.as_str().map(|s| s.eq_ignore_ascii_case("true")))
            .map(SettingChange::Muted),
        _ => None,
    }
}

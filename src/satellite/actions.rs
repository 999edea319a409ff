//! `custom-action` commands from the controller

use serde_json::{Map, Value};

use crate::voice::MediaPlayer;

/// Device display surface
pub trait ScreenControl: Send + Sync {
    /// Show a short notification
    fn toast(&self, message: &str);
    /// Turn the screen on or off
    fn set_screen(&self, on: bool);
}

/// Screen control for headless devices: records requests in the log
#[derive(Debug, Default)]
pub struct LogScreen;

impl ScreenControl for LogScreen {
    fn toast(&self, message: &str) {
        tracing::info!(message, "toast");
    }

    fn set_screen(&self, on: bool) {
        tracing::info!(on, "screen power requested");
    }
}

/// A parsed `custom-action`
#[derive(Debug, Clone, PartialEq)]
pub enum CustomAction {
    /// Play a media URL, optionally at a volume in [0, 1]
    PlayMedia { url: String, volume: Option<f32> },
    /// Resume media
    Play,
    /// Pause media
    Pause,
    /// Stop media
    Stop,
    /// Set media volume in [0, 1]
    SetVolume(f32),
    /// Show a notification
    Toast(String),
    /// Screen power
    Screen(bool),
}

impl CustomAction {
    /// Parse event data `{action, payload}`
    ///
    /// `payload` may be an object or a JSON-encoded string. Volumes arrive
    /// as 0-100.
    #[must_use]
    pub fn parse(data: &Map<String, Value>) -> Option<Self> {
        let action = data.get("action").and_then(Value::as_str)?;
        let payload = payload(data);

        match action {
            "play-media" => Some(Self::PlayMedia {
                url: payload.get("url").and_then(Value::as_str)?.to_string(),
                volume: payload.get("volume").and_then(volume),
            }),
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "stop" => Some(Self::Stop),
            "set-volume" => payload.get("volume").and_then(volume).map(Self::SetVolume),
            "toast-message" => payload
                .get("message")
                .and_then(Value::as_str)
                .map(|m| Self::Toast(m.to_string())),
            "screen" => payload
                .get("action")
                .and_then(Value::as_str)
                .map(|a| Self::Screen(a == "on")),
            _ => None,
        }
    }

    /// Carry out the action
    pub fn apply(&self, media: &dyn MediaPlayer, screen: &dyn ScreenControl) {
        match self {
            Self::PlayMedia { url, volume } => {
                media.play(url);
                if let Some(volume) = volume {
                    media.set_volume(*volume);
                }
            }
            Self::Play => media.resume(),
            Self::Pause => media.pause(),
            Self::Stop => media.stop(),
            Self::SetVolume(volume) => media.set_volume(*volume),
            Self::Toast(message) => screen.toast(message),
            Self::Screen(on) => screen.set_screen(*on),
        }
    }
}

fn payload(data: &Map<String, Value>) -> Map<String, Value> {
    match data.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if !s.is_empty() => {
            serde_json::from_str(s).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "invalid custom-action payload");
                Map::new()
            })
        }
        _ => Map::new(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn volume(value: &Value) -> Option<f32> {
    value
        .as_f64()
        .map(|v| (v / 100.0).clamp(0.0, 1.0) as f32)
}

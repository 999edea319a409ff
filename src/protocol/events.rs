//! Event names and outbound event documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::Packet;
use crate::wakeword::{SUPPORTED_WAKE_WORDS, phrase};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const DESCRIBE: &str = "describe";
pub const INFO: &str = "info";
pub const RUN_SATELLITE: &str = "run-satellite";
pub const PAUSE_SATELLITE: &str = "pause-satellite";
pub const RUN_PIPELINE: &str = "run-pipeline";
pub const DETECTION: &str = "detection";
pub const TRANSCRIBE: &str = "transcribe";
pub const TRANSCRIPT: &str = "transcript";
pub const VOICE_STOPPED: &str = "voice-stopped";
pub const AUDIO_START: &str = "audio-start";
pub const AUDIO_CHUNK: &str = "audio-chunk";
pub const AUDIO_STOP: &str = "audio-stop";
pub const PLAYED: &str = "played";
pub const ERROR: &str = "error";
pub const CUSTOM_SETTINGS: &str = "custom-settings";
pub const CUSTOM_ACTION: &str = "custom-action";
pub const CUSTOM_STATUS: &str = "custom-status";

/// Device description sent with `info`
pub const SATELLITE_DESCRIPTION: &str = "View Assist Companion App";

/// Whether an event is too frequent to log above `trace`
#[must_use]
pub fn is_chatty(kind: &str) -> bool {
    matches!(kind, PING | PONG | AUDIO_CHUNK)
}

/// PCM stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second
    pub rate: u32,
    /// Bytes per sample
    pub width: u16,
    /// Interleaved channels
    pub channels: u16,
}

impl AudioFormat {
    /// Microphone format: 16 kHz, 16-bit, mono
    pub const MICROPHONE: Self = Self {
        rate: 16_000,
        width: 2,
        channels: 1,
    };

    /// Assumed format of TTS audio when `audio-start` omits it
    pub const SPEAKER_DEFAULT: Self = Self {
        rate: 22_050,
        width: 2,
        channels: 1,
    };

    /// Read `rate`/`width`/`channels` from event data, filling gaps from `default`
    #[must_use]
    pub fn from_data(data: &Map<String, Value>, default: Self) -> Self {
        let field = |key: &str| data.get(key).and_then(Value::as_u64);
        Self {
            rate: field("rate")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default.rate),
            width: field("width")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(default.width),
            channels: field("channels")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(default.channels),
        }
    }

    /// As a JSON object
    #[must_use]
    pub fn to_json(self) -> Value {
        json!({ "rate": self.rate, "width": self.width, "channels": self.channels })
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// `ping` heartbeat
#[must_use]
pub fn ping() -> Packet {
    Packet::with_data(PING, object(json!({ "text": "" })))
}

/// `pong` reply
#[must_use]
pub fn pong() -> Packet {
    Packet::with_data(PONG, object(json!({ "text": "" })))
}

/// `played` acknowledgement after TTS playback
#[must_use]
pub fn played() -> Packet {
    Packet::new(PLAYED)
}

/// `info` capability document
#[must_use]
pub fn info(satellite_name: &str, version: &str, active_wake_word: &str) -> Packet {
    let attribution = json!({ "name": "", "url": "" });
    let models: Vec<Value> = SUPPORTED_WAKE_WORDS
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "attribution": attribution,
                "installed": true,
                "languages": ["en"],
                "phrase": phrase(name),
            })
        })
        .collect();

    Packet::with_data(
        INFO,
        object(json!({
            "version": version,
            "asr": [],
            "tts": [],
            "handle": [],
            "intent": [],
            "stt": [],
            "wake": [{
                "name": "available_wake_words",
                "attribution": attribution,
                "installed": true,
                "models": models,
            }],
            "satellite": {
                "name": satellite_name,
                "attribution": attribution,
                "installed": true,
                "description": SATELLITE_DESCRIPTION,
                "version": version,
                "area": "",
                "has_vad": false,
                "snd_format": AudioFormat::MICROPHONE.to_json(),
                "active_wake_words": [active_wake_word],
                "max_active_wake_words": 1,
            },
        })),
    )
}

/// `detection` for a fired wake word
#[must_use]
pub fn detection(wake_word: &str, timestamp: DateTime<Utc>) -> Packet {
    Packet::with_data(
        DETECTION,
        object(json!({
            "name": wake_word,
            "timestamp": timestamp.to_rfc3339(),
            "speaker": "",
        })),
    )
}

/// `run-pipeline` asking the peer to start ASR through TTS
#[must_use]
pub fn run_pipeline(satellite_name: &str, format: AudioFormat) -> Packet {
    Packet::with_data(
        RUN_PIPELINE,
        object(json!({
            "name": satellite_name,
            "start_stage": "asr",
            "end_stage": "tts",
            "restart_on_end": false,
            "snd_format": format.to_json(),
        })),
    )
}

/// `audio-chunk` carrying microphone PCM
#[must_use]
pub fn audio_chunk(format: AudioFormat, pcm: Vec<u8>) -> Packet {
    Packet::with_data(AUDIO_CHUNK, object(format.to_json())).with_payload(pcm)
}

/// `custom-status` snapshot
#[must_use]
pub fn custom_status(timestamp: DateTime<Utc>, sensors: Map<String, Value>) -> Packet {
    Packet::with_data(
        CUSTOM_STATUS,
        object(json!({
            "timestamp": timestamp.to_rfc3339(),
            "sensors": sensors,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_document() {
        let packet = info("VACA 1234abcd", "0.3.3", "hey_jarvis");
        assert_eq!(packet.kind, INFO);

        let satellite = &packet.data["satellite"];
        assert_eq!(satellite["name"], json!("VACA 1234abcd"));
        assert_eq!(satellite["snd_format"], json!({"rate": 16000, "width": 2, "channels": 1}));
        assert_eq!(satellite["active_wake_words"], json!(["hey_jarvis"]));

        let models = packet.data["wake"][0]["models"].as_array().unwrap();
        assert_eq!(models.len(), SUPPORTED_WAKE_WORDS.len());
        assert!(models.iter().any(|m| m["phrase"] == json!("Hey Jarvis")));
    }

    #[test]
    fn test_run_pipeline_document() {
        let packet = run_pipeline("VACA x", AudioFormat::MICROPHONE);
        assert_eq!(packet.data["start_stage"], json!("asr"));
        assert_eq!(packet.data["end_stage"], json!("tts"));
        assert_eq!(packet.data["restart_on_end"], json!(false));
        assert_eq!(packet.data["snd_format"]["rate"], json!(16000));
    }

    #[test]
    fn test_audio_format_from_data() {
        let data = object(json!({"rate": 24000, "channels": 2}));
        let format = AudioFormat::from_data(&data, AudioFormat::SPEAKER_DEFAULT);
        assert_eq!(
            format,
            AudioFormat {
                rate: 24_000,
                width: 2,
                channels: 2
            }
        );
    }

    #[test]
    fn test_chatty_events() {
        assert!(is_chatty(PING));
        assert!(is_chatty(AUDIO_CHUNK));
        assert!(!is_chatty(RUN_SATELLITE));
    }
}

//! Satellite server integration tests
//!
//! Drives the server over real localhost sockets with recording
//! playback collaborators

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};

use beacon_satellite::config::SettingChange;
use beacon_satellite::protocol::{AudioFormat, Packet, events};
use beacon_satellite::satellite::{PairingStore, PipelineState, SatelliteEvent};
use beacon_satellite::voice::PcmSink;
use beacon_satellite::wakeword::Detection;

mod common;

use common::{Client, TestRig, next_event, wait_until};

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn detection() -> Detection {
    Detection {
        wake_word: "hey_jarvis".to_string(),
        probability: 0.9,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let rig = TestRig::new();
    let (_server, _events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::PING).await;

    let pong = client.recv().await;
    assert_eq!(pong.kind, events::PONG);
    assert_eq!(pong.data, object(json!({"text": ""})));
}

#[tokio::test]
async fn test_heartbeat_ping() {
    let rig = TestRig::new();
    let (_server, _events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    let packet = tokio::time::timeout(Duration::from_secs(5), async {
        let mut reader = tokio::io::BufReader::new(tokio::net::TcpStream::connect(addr).await.unwrap());
        loop {
            if let Ok(Some(packet)) = Packet::read_from(&mut reader).await {
                return packet;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(packet.kind, events::PING);

    // The first connection is still served
    client.send_kind(events::PING).await;
    assert_eq!(client.recv().await.kind, events::PONG);
}

#[tokio::test]
async fn test_describe_returns_info() {
    let rig = TestRig::new();
    let (_server, _events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::DESCRIBE).await;

    let info = client.recv().await;
    assert_eq!(info.kind, events::INFO);
    assert_eq!(info.data["satellite"]["name"], json!("VACA a1b2c3d4"));
    assert_eq!(
        info.data["satellite"]["active_wake_words"],
        json!(["hey_jarvis"])
    );
}

#[tokio::test]
async fn test_describe_ignored_for_unpaired_peer() {
    let pairing = PairingStore::in_memory();
    pairing.pair_or_verify("10.9.9.9");
    let rig = TestRig::with_pairing(pairing);
    let (_server, _events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::DESCRIBE).await;
    client.send_kind(events::PING).await;

    // Only the pong comes back
    assert_eq!(client.recv().await.kind, events::PONG);
}

#[tokio::test]
async fn test_run_satellite_pairs_and_starts() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;

    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    assert_eq!(rig.pairing.paired_peer().as_deref(), Some("127.0.0.1"));
    assert!(server.has_active_pipeline());
    assert_eq!(server.pipeline_state(), Some(PipelineState::Inactive));
}

#[tokio::test]
async fn test_unpaired_peer_is_rejected() {
    let pairing = PairingStore::in_memory();
    pairing.pair_or_verify("10.9.9.9");
    let rig = TestRig::with_pairing(pairing);
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    client.expect_closed().await;

    assert!(!server.has_active_pipeline());
    assert!(events.try_recv().is_err());
    assert_eq!(rig.pairing.paired_peer().as_deref(), Some("10.9.9.9"));
}

#[tokio::test]
async fn test_events_ignored_before_run_satellite() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::TRANSCRIBE).await;
    client.send_kind(events::AUDIO_STOP).await;
    client.send_kind(events::PING).await;

    assert_eq!(client.recv().await.kind, events::PONG);
    assert!(!server.has_active_pipeline());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_response_audio_plays_once() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    client
        .send(Packet::with_data(
            events::AUDIO_START,
            object(json!({"rate": 22050, "width": 2, "channels": 1})),
        ))
        .await;
    for _ in 0..3 {
        client
            .send(
                Packet::with_data(
                    events::AUDIO_CHUNK,
                    object(json!({"rate": 22050, "width": 2, "channels": 1})),
                )
                .with_payload(vec![0; 480]),
            )
            .await;
    }
    client.send_kind(events::AUDIO_STOP).await;

    assert_eq!(client.recv_kind(events::PLAYED).await.kind, events::PLAYED);
    assert_eq!(server.pipeline_state(), Some(PipelineState::Inactive));

    assert_eq!(
        *rig.speaker.formats.lock().unwrap(),
        vec![AudioFormat {
            rate: 22050,
            width: 2,
            channels: 1
        }]
    );
    assert_eq!(rig.speaker.bytes.load(Ordering::SeqCst), 1440);
    assert_eq!(rig.speaker.stops.load(Ordering::SeqCst), 1);
    assert!(rig.media.calls().contains(&"unduck".to_string()));

    // No second played
    client.send_kind(events::PING).await;
    assert_eq!(client.recv().await.kind, events::PONG);
}

#[tokio::test]
async fn test_transcribe_requests_and_releases_input() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    client.send_kind(events::TRANSCRIBE).await;
    assert_eq!(
        next_event(&mut events).await,
        SatelliteEvent::RequestInputStream
    );
    assert_eq!(server.pipeline_state(), Some(PipelineState::Listening));

    client
        .send(Packet::with_data(
            events::TRANSCRIPT,
            object(json!({"text": "turn on the lights"})),
        ))
        .await;
    assert_eq!(
        next_event(&mut events).await,
        SatelliteEvent::ReleaseInputStream
    );
    assert_eq!(server.pipeline_state(), Some(PipelineState::Inactive));

    // Media volume comes back after the unduck delay
    let media = &rig.media;
    wait_until(|| media.calls().contains(&"unduck".to_string())).await;
}

#[tokio::test]
async fn test_audio_start_cancels_pending_unduck() {
    let rig = TestRig::new();
    let (_server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    client.send_kind(events::TRANSCRIBE).await;
    client.send_kind(events::VOICE_STOPPED).await;
    client.send_kind(events::AUDIO_START).await;
    client.send_kind(events::PING).await;
    assert_eq!(client.recv().await.kind, events::PONG);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!rig.media.calls().contains(&"unduck".to_string()));
}

#[tokio::test]
async fn test_takeover_transfers_without_restart() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut first = Client::connect(addr).await;
    first.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    let first_connection = server.active_connection().unwrap();

    let mut second = Client::connect(addr).await;
    second.send_kind(events::RUN_SATELLITE).await;
    first.expect_closed().await;

    let active = server.active_connection().unwrap();
    assert_ne!(active, first_connection);
    assert!(events.try_recv().is_err());

    // The new holder owns the session and ends it exactly once
    drop(second);
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Stopped);
    wait_until(|| server.connection_count() == 0).await;
    assert!(!server.has_active_pipeline());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_takeover_while_listening_releases_input() {
    let rig = TestRig::new();
    let (_server, mut events, addr) = rig.serve().await;

    let mut first = Client::connect(addr).await;
    first.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    first.send_kind(events::TRANSCRIBE).await;
    assert_eq!(
        next_event(&mut events).await,
        SatelliteEvent::RequestInputStream
    );

    let mut second = Client::connect(addr).await;
    second.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(
        next_event(&mut events).await,
        SatelliteEvent::ReleaseInputStream
    );
    first.expect_closed().await;
}

#[tokio::test]
async fn test_takeover_while_streaming_stops_playback() {
    let rig = TestRig::new();
    let (_server, mut events, addr) = rig.serve().await;

    let mut first = Client::connect(addr).await;
    first.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    first.send_kind(events::AUDIO_START).await;
    let speaker = &rig.speaker;
    wait_until(|| speaker.is_playing()).await;

    let mut second = Client::connect(addr).await;
    second.send_kind(events::RUN_SATELLITE).await;
    first.expect_closed().await;

    assert_eq!(rig.speaker.stops.load(Ordering::SeqCst), 1);
    assert!(!rig.speaker.is_playing());
}

#[tokio::test]
async fn test_slow_playback_start_does_not_block_other_connections() {
    let rig = TestRig::new();
    let (_server, mut events, addr) = rig.serve().await;
    rig.speaker.start_delay_ms.store(500, Ordering::SeqCst);

    let mut first = Client::connect(addr).await;
    first.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    first.send_kind(events::AUDIO_START).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = Client::connect(addr).await;
    second.send_kind(events::PING).await;
    let pong =
        tokio::time::timeout(Duration::from_millis(300), second.recv_kind(events::PONG)).await;
    assert!(pong.is_ok(), "ping stalled behind the playback start");

    let speaker = &rig.speaker;
    wait_until(|| speaker.is_playing()).await;
}

#[tokio::test]
async fn test_detection_plays_wake_sound_before_ducking() {
    let rig = TestRig::new();
    rig.settings
        .set(SettingChange::WakeWordSound("chime".to_string()));
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    server.wake_word_detected(&detection());
    let packet = client.recv_kind(events::DETECTION).await;
    assert_eq!(packet.data["name"], "hey_jarvis");
    client.recv_kind(events::RUN_PIPELINE).await;

    let calls = rig.media.calls();
    let sound = calls.iter().position(|c| c == "sound chime").unwrap();
    let duck = calls.iter().position(|c| c == "duck").unwrap();
    assert!(sound < duck);
}

#[tokio::test]
async fn test_detection_without_wake_sound() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    server.wake_word_detected(&detection());
    client.recv_kind(events::RUN_PIPELINE).await;

    let calls = rig.media.calls();
    assert!(calls.contains(&"duck".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("sound")));
}

#[tokio::test]
async fn test_pause_satellite_stops_and_closes() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    client.send_kind(events::PAUSE_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Stopped);
    client.expect_closed().await;

    wait_until(|| server.connection_count() == 0).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_stops_once() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);
    assert_eq!(server.connection_count(), 1);

    drop(client);
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Stopped);
    wait_until(|| server.connection_count() == 0).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_custom_settings_applied() {
    let rig = TestRig::new();
    let (_server, _events, addr) = rig.serve().await;
    let mut changes = rig.settings.subscribe();

    let mut client = Client::connect(addr).await;
    client
        .send(Packet::with_data(
            events::CUSTOM_SETTINGS,
            object(json!({"settings": {
                "wake_word": "ok_nabu",
                "wake_word_threshold": 80,
                "mute": true,
                "unknown": 1,
            }})),
        ))
        .await;

    let settings = &rig.settings;
    wait_until(|| {
        settings.read(|s| {
            s.muted && s.wake_word == "ok_nabu" && (s.wake_word_threshold - 0.8).abs() < 1e-6
        })
    })
    .await;
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
    }
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_custom_action_controls_media() {
    let rig = TestRig::new();
    let (_server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    client
        .send(Packet::with_data(
            events::CUSTOM_ACTION,
            object(json!({
                "action": "play-media",
                "payload": "{\"url\": \"http://ha.local/song.mp3\", \"volume\": 40}",
            })),
        ))
        .await;
    client
        .send(Packet::with_data(
            events::CUSTOM_ACTION,
            object(json!({"action": "toast-message", "payload": {"message": "hello"}})),
        ))
        .await;

    let media = &rig.media;
    wait_until(|| media.calls().len() == 2).await;
    assert_eq!(
        rig.media.calls(),
        vec!["play http://ha.local/song.mp3", "volume 0.4"]
    );

    let screen = &rig.screen;
    wait_until(|| !screen.calls.lock().unwrap().is_empty()).await;
    assert_eq!(*rig.screen.calls.lock().unwrap(), vec!["toast hello"]);
}

#[tokio::test]
async fn test_status_forwarded_to_active_connection() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    let sensors = beacon_satellite::daemon::status_sensors(&server, &rig.settings);
    server.forward_status(sensors);

    let status = client.recv_kind(events::CUSTOM_STATUS).await;
    assert_eq!(status.data["sensors"]["connections"], json!(1));
    assert_eq!(status.data["sensors"]["pipeline"], json!("inactive"));
    assert_eq!(status.data["sensors"]["wake_word"], json!("hey_jarvis"));
    assert!(status.data["timestamp"].is_string());
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let rig = TestRig::new();
    let (server, mut events, addr) = rig.serve().await;

    let mut client = Client::connect(addr).await;
    client.send_kind(events::RUN_SATELLITE).await;
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Started);

    server.shutdown();
    assert_eq!(next_event(&mut events).await, SatelliteEvent::Stopped);
    client.expect_closed().await;
}

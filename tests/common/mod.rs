//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::{ArrayD, IxDyn};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use beacon_satellite::config::{DeviceIdentity, SharedSettings};
use beacon_satellite::protocol::{AudioFormat, PROTOCOL_VERSION, Packet, events};
use beacon_satellite::satellite::{
    PairingStore, SatelliteContext, SatelliteEvent, SatelliteServer, ScreenControl,
};
use beacon_satellite::voice::{ChunkCallback, MediaPlayer, PcmSink, Recorder};
use beacon_satellite::wakeword::{
    EMBEDDING_DIM, EMBEDDING_STEP, EMBEDDING_WINDOW, InferenceEngine, MEL_BINS,
    MEL_CONTEXT_SAMPLES, ModelKind,
};
use beacon_satellite::{Error, Result};

/// How long to wait for anything asynchronous in tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Mel model hop in samples
const HOP: usize = 160;

/// Shape-correct engine whose classifier always returns `probability`
pub struct ConstantEngine {
    pub probability: f32,
}

impl ConstantEngine {
    pub fn new(probability: f32) -> Arc<Self> {
        Arc::new(Self { probability })
    }
}

impl InferenceEngine for ConstantEngine {
    fn run(&self, model: ModelKind, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let (out_shape, value) = match model {
            ModelKind::Melspectrogram => (
                vec![1, 1, shape[1].saturating_sub(MEL_CONTEXT_SAMPLES) / HOP, MEL_BINS],
                0.0,
            ),
            ModelKind::Embedding => (vec![shape[0], 1, 1, EMBEDDING_DIM], 0.5),
            ModelKind::Classifier => (vec![1, 1], self.probability),
        };
        Ok(ArrayD::from_elem(IxDyn(&out_shape), value))
    }
}

/// Engine that scores the loudness of the newest audio
///
/// Each mel frame carries the mean absolute level of its hop, each
/// embedding the level of the newest chunk in its window, and the
/// classifier returns the newest embedding's level clamped to [0, 1].
pub struct LevelEngine;

impl InferenceEngine for LevelEngine {
    fn run(&self, model: ModelKind, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        match model {
            ModelKind::Melspectrogram => {
                let samples: Vec<f32> = input.iter().copied().collect();
                let audio = samples.get(MEL_CONTEXT_SAMPLES..).unwrap_or_default();
                let mut data = Vec::new();
                for hop in audio.chunks_exact(HOP) {
                    #[allow(clippy::cast_precision_loss)]
                    let level = hop.iter().map(|s| s.abs()).sum::<f32>() / HOP as f32;
                    // Undo the x / 10 + 2 scaling the pipeline applies
                    data.extend(std::iter::repeat_n((level - 2.0) * 10.0, MEL_BINS));
                }
                let frames = data.len() / MEL_BINS;
                ArrayD::from_shape_vec(IxDyn(&[1, 1, frames, MEL_BINS]), data)
                    .map_err(|e| Error::Inference(e.to_string()))
            }
            ModelKind::Embedding => {
                let batch = shape[0];
                let newest = EMBEDDING_WINDOW - EMBEDDING_STEP;
                let mut data = Vec::with_capacity(batch * EMBEDDING_DIM);
                for b in 0..batch {
                    let mut sum = 0.0;
                    for frame in newest..EMBEDDING_WINDOW {
                        for bin in 0..MEL_BINS {
                            sum += input[[b, frame, bin, 0]];
                        }
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let level = sum / (EMBEDDING_STEP * MEL_BINS) as f32;
                    data.extend(std::iter::repeat_n(level, EMBEDDING_DIM));
                }
                ArrayD::from_shape_vec(IxDyn(&[batch, 1, 1, EMBEDDING_DIM]), data)
                    .map_err(|e| Error::Inference(e.to_string()))
            }
            ModelKind::Classifier => {
                let newest = input[[0, shape[1] - 1, 0]];
                Ok(ArrayD::from_elem(IxDyn(&[1, 1]), newest.clamp(0.0, 1.0)))
            }
        }
    }
}

/// Engine that fails every call
pub struct FailingEngine;

impl InferenceEngine for FailingEngine {
    fn run(&self, model: ModelKind, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Err(Error::Inference(format!("{} unavailable", model.name())))
    }
}

/// Media player that records calls
#[derive(Default)]
pub struct RecordingMedia {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingMedia {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl MediaPlayer for RecordingMedia {
    fn play(&self, url: &str) {
        self.record(format!("play {url}"));
    }
    fn pause(&self) {
        self.record("pause");
    }
    fn resume(&self) {
        self.record("resume");
    }
    fn stop(&self) {
        self.record("stop");
    }
    fn set_volume(&self, volume: f32) {
        self.record(format!("volume {volume}"));
    }
    fn set_ducking_volume(&self, volume: f32) {
        self.record(format!("ducking {volume}"));
    }
    fn duck(&self) {
        self.record("duck");
    }
    fn unduck(&self) {
        self.record("unduck");
    }
    fn play_sound(&self, sound: &str) {
        self.record(format!("sound {sound}"));
    }
}

/// PCM sink that counts what it is given
#[derive(Default)]
pub struct RecordingSink {
    pub formats: Mutex<Vec<AudioFormat>>,
    pub bytes: AtomicUsize,
    pub stops: AtomicUsize,
    /// Time `start` spends opening the "device"
    pub start_delay_ms: AtomicU64,
    playing: AtomicBool,
}

impl PcmSink for RecordingSink {
    fn start(&self, format: AudioFormat) -> Result<()> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.formats.lock().unwrap().push(format);
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn write(&self, pcm: &[u8]) {
        self.bytes.fetch_add(pcm.len(), Ordering::SeqCst);
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Screen that records requests
#[derive(Default)]
pub struct RecordingScreen {
    pub calls: Mutex<Vec<String>>,
}

impl ScreenControl for RecordingScreen {
    fn toast(&self, message: &str) {
        self.calls.lock().unwrap().push(format!("toast {message}"));
    }
    fn set_screen(&self, on: bool) {
        self.calls.lock().unwrap().push(format!("screen {on}"));
    }
}

/// Recorder driven by the test instead of hardware
#[derive(Default)]
pub struct ManualRecorder {
    handle: RecorderHandle,
    fail: bool,
}

/// Test side of a [`ManualRecorder`]
#[derive(Clone, Default)]
pub struct RecorderHandle {
    callback: Arc<Mutex<Option<ChunkCallback>>>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

impl RecorderHandle {
    /// Deliver a chunk as if captured; false when not recording
    pub fn push(&self, chunk: &[i16]) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(callback) => {
                callback(chunk);
                true
            }
            None => false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

impl ManualRecorder {
    pub fn new() -> (Self, RecorderHandle) {
        let recorder = Self::default();
        let handle = recorder.handle.clone();
        (recorder, handle)
    }

    /// Recorder whose start always fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl Recorder for ManualRecorder {
    fn start(&mut self, on_chunk: ChunkCallback) -> Result<()> {
        if self.fail {
            return Err(Error::Audio("no input device available".to_string()));
        }
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        *self.handle.callback.lock().unwrap() = Some(on_chunk);
        Ok(())
    }

    fn stop(&mut self) {
        if self.handle.callback.lock().unwrap().take().is_some() {
            self.handle.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_recording(&self) -> bool {
        self.handle.is_recording()
    }
}

/// Context plus handles on its recording collaborators
pub struct TestRig {
    pub context: Arc<SatelliteContext>,
    pub settings: Arc<SharedSettings>,
    pub pairing: Arc<PairingStore>,
    pub media: Arc<RecordingMedia>,
    pub speaker: Arc<RecordingSink>,
    pub screen: Arc<RecordingScreen>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_pairing(PairingStore::in_memory())
    }

    pub fn with_pairing(pairing: PairingStore) -> Self {
        let settings = Arc::new(SharedSettings::default());
        let pairing = Arc::new(pairing);
        let media = Arc::new(RecordingMedia::default());
        let speaker = Arc::new(RecordingSink::default());
        let screen = Arc::new(RecordingScreen::default());

        let context = Arc::new(SatelliteContext {
            identity: DeviceIdentity::new("a1b2c3d4", "VACA"),
            settings: Arc::clone(&settings),
            pairing: Arc::clone(&pairing),
            media: media.clone(),
            speaker: speaker.clone(),
            screen: screen.clone(),
        });

        Self {
            context,
            settings,
            pairing,
            media,
            speaker,
            screen,
        }
    }

    /// Start a server on an ephemeral localhost port
    pub async fn serve(
        &self,
    ) -> (
        Arc<SatelliteServer>,
        mpsc::UnboundedReceiver<SatelliteEvent>,
        SocketAddr,
    ) {
        let (server, events) = SatelliteServer::new(Arc::clone(&self.context));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, events, addr)
    }
}

/// Controller side of a satellite connection
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        packet
            .write_to(&mut self.writer, PROTOCOL_VERSION)
            .await
            .unwrap();
    }

    pub async fn send_kind(&mut self, kind: &str) {
        self.send(Packet::new(kind)).await;
    }

    /// Next packet that is not a heartbeat ping
    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(WAIT, async {
            loop {
                match Packet::read_from(&mut self.reader).await {
                    Ok(Some(packet)) if packet.kind == events::PING => {}
                    Ok(Some(packet)) => return packet,
                    Ok(None) => {}
                    Err(e) => panic!("connection failed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Skip packets until one of `kind` arrives
    pub async fn recv_kind(&mut self, kind: &str) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet.kind == kind {
                return packet;
            }
        }
    }

    /// Wait for the satellite to close the connection
    pub async fn expect_closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            loop {
                match Packet::read_from(&mut self.reader).await {
                    Err(Error::ConnectionClosed | Error::Io(_)) => return,
                    Err(e) => panic!("unexpected error: {e}"),
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("connection stayed open");
    }
}

/// Wait for the next satellite lifecycle event
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SatelliteEvent>) -> SatelliteEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a satellite event")
        .expect("event channel closed")
}

/// Poll `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// One chunk of a sine tone as i16 samples
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn tone_chunk(len: usize, amplitude: i16) -> Vec<i16> {
    (0..len)
        .map(|i| {
            let t = i as f32 / 16000.0;
            (f32::from(amplitude) * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
        })
        .collect()
}

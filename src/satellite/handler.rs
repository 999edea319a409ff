//! Per-connection state machine
//!
//! Each accepted socket gets a [`ClientHandler`] task plus helpers:
//! a reader task that frames packets (framing is not cancel-safe, so it
//! never sits inside `select!`), a writer task draining the outbound queue,
//! a heartbeat, and an optional delayed unduck. Events from the peer are
//! handled strictly in arrival order.

use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::actions::CustomAction;
use super::pairing::PairingDecision;
use super::server::{ActivePipeline, ConnectionId, SatelliteServer};
use super::{PipelineState, SatelliteContext, SatelliteState};
use crate::protocol::{AudioFormat, PROTOCOL_VERSION, Packet, events};
use crate::wakeword::Detection;
use crate::{Error, Result};

/// Interval between heartbeat pings
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before restoring media volume when no response audio follows
pub const UNDUCK_DELAY: Duration = Duration::from_secs(1);

/// Time allowed to flush queued packets after the handler stops
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const OUTBOX_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 16;

/// Messages to a handler from outside its socket
#[derive(Debug)]
pub(crate) enum Control {
    /// The router detected the wake word
    WakeWordDetected(Detection),
    /// Another connection took over the session
    Displaced,
}

/// Run a connection to completion
pub(crate) async fn serve_connection(
    server: Arc<SatelliteServer>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let connection = server.register_connection();
    let span = tracing::info_span!("connection", id = connection, peer = %peer.ip());

    async move {
        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write_half, outbox_rx).in_current_span());

        let handler = ClientHandler {
            connection,
            peer: peer.ip(),
            context: Arc::clone(server.context()),
            server,
            outbox,
            control_tx,
            satellite: SatelliteState::Stopped,
            pipeline: PipelineState::Inactive,
            heartbeat: None,
            unduck: None,
            stopped: false,
        };
        handler.run(read_half, control_rx, writer).await;
    }
    .instrument(span)
    .await;
}

async fn read_loop(read_half: OwnedReadHalf, inbound: mpsc::Sender<Packet>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match Packet::read_from(&mut reader).await {
            Ok(Some(packet)) => {
                if inbound.send(packet).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(Error::ConnectionClosed) => {
                tracing::debug!("peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "read failed");
                break;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<Packet>) -> Result<()> {
    while let Some(packet) = outbox.recv().await {
        if events::is_chatty(&packet.kind) {
            tracing::trace!(event = %packet.kind, "sending event");
        } else {
            tracing::debug!(event = %packet.kind, "sending event");
        }
        packet.write_to(&mut writer, PROTOCOL_VERSION).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// State machine for one controller connection
struct ClientHandler {
    connection: ConnectionId,
    peer: IpAddr,
    server: Arc<SatelliteServer>,
    context: Arc<SatelliteContext>,
    outbox: mpsc::Sender<Packet>,
    control_tx: mpsc::UnboundedSender<Control>,
    satellite: SatelliteState,
    pipeline: PipelineState,
    heartbeat: Option<JoinHandle<()>>,
    unduck: Option<JoinHandle<()>>,
    stopped: bool,
}

impl ClientHandler {
    async fn run(
        mut self,
        read_half: OwnedReadHalf,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut writer: JoinHandle<Result<()>>,
    ) {
        let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader = tokio::spawn(read_loop(read_half, inbound_tx).in_current_span());
        let mut shutdown = self.server.shutdown_signal();
        let mut writer_done = false;

        self.start_heartbeat();

        loop {
            let flow = tokio::select! {
                packet = inbound.recv() => match packet {
                    Some(packet) => self.handle_packet(packet).await,
                    None => ControlFlow::Break(()),
                },
                Some(control) = control_rx.recv() => self.handle_control(control).await,
                result = &mut writer => {
                    writer_done = true;
                    match result {
                        Ok(Err(e)) => tracing::warn!(error = %e, "write failed"),
                        Err(e) => tracing::error!(error = %e, "writer task failed"),
                        Ok(Ok(())) => {}
                    }
                    ControlFlow::Break(())
                }
                () = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {
                    tracing::debug!("server shutting down");
                    ControlFlow::Break(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        self.stop();
        reader.abort();
        drop(self);

        // Dropping the handler closed the outbox; let the writer flush
        if !writer_done && tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    async fn send(&self, packet: Packet) -> ControlFlow<()> {
        if self.outbox.send(packet).await.is_err() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> ControlFlow<()> {
        if events::is_chatty(&packet.kind) {
            tracing::trace!(event = %packet.kind, "received event");
        } else {
            tracing::debug!(event = %packet.kind, data = ?packet.data, "received event");
        }

        match packet.kind.as_str() {
            events::PING => self.send(events::pong()).await,
            events::DESCRIBE => {
                if self.context.pairing.is_permitted(&self.peer.to_string()) {
                    self.send_info().await
                } else {
                    tracing::debug!("ignoring describe from unpaired peer");
                    ControlFlow::Continue(())
                }
            }
            events::CUSTOM_SETTINGS => {
                self.apply_settings(&packet.data);
                ControlFlow::Continue(())
            }
            events::RUN_SATELLITE => self.start_satellite().await,
            _ if self.satellite == SatelliteState::Running => self.handle_running(packet).await,
            kind => {
                tracing::debug!(event = kind, "ignoring event while satellite is stopped");
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_running(&mut self, packet: Packet) -> ControlFlow<()> {
        match packet.kind.as_str() {
            events::PAUSE_SATELLITE => {
                self.stop_satellite();
                return ControlFlow::Break(());
            }
            events::AUDIO_START => {
                self.cancel_unduck();
                self.set_pipeline(PipelineState::Streaming);
                let format = AudioFormat::from_data(&packet.data, AudioFormat::SPEAKER_DEFAULT);
                // Opening the output device blocks until it is ready
                let speaker = Arc::clone(&self.context.speaker);
                match tokio::task::spawn_blocking(move || speaker.start(format)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, ?format, "failed to start response playback");
                    }
                    Err(e) => tracing::error!(error = %e, "playback start task failed"),
                }
            }
            events::AUDIO_CHUNK => {
                if self.context.speaker.is_playing() {
                    self.context.speaker.write(&packet.payload);
                }
            }
            events::AUDIO_STOP => {
                if self.context.speaker.is_playing() {
                    self.context.speaker.stop();
                }
                self.set_pipeline(PipelineState::Inactive);
                let flow = self.send(events::played()).await;
                self.context.media.unduck();
                return flow;
            }
            events::TRANSCRIBE => {
                self.set_pipeline(PipelineState::Listening);
                self.server.request_input_stream(self.connection);
            }
            events::TRANSCRIPT | events::VOICE_STOPPED => {
                self.release_input_stream();
                self.schedule_unduck();
            }
            events::ERROR => {
                tracing::info!(data = ?packet.data, "pipeline error from controller");
                self.release_input_stream();
                self.context.media.unduck();
            }
            events::CUSTOM_ACTION => match CustomAction::parse(&packet.data) {
                Some(action) => {
                    tracing::debug!(?action, "custom action");
                    action.apply(self.context.media.as_ref(), self.context.screen.as_ref());
                }
                None => tracing::warn!(data = ?packet.data, "unrecognised custom action"),
            },
            kind => tracing::debug!(event = kind, "unhandled event"),
        }

        ControlFlow::Continue(())
    }

    async fn handle_control(&mut self, control: Control) -> ControlFlow<()> {
        match control {
            Control::WakeWordDetected(detection) => {
                if self.satellite != SatelliteState::Running {
                    return ControlFlow::Continue(());
                }
                let sound = self
                    .context
                    .settings
                    .read(|s| s.detection_sound().map(str::to_string));
                if let Some(sound) = sound {
                    self.context.media.play_sound(&sound);
                }
                self.context.media.duck();
                if self
                    .send(events::detection(&detection.wake_word, detection.timestamp))
                    .await
                    .is_break()
                {
                    return ControlFlow::Break(());
                }
                let format = self.context.settings.read(crate::config::Settings::audio_format);
                self.send(events::run_pipeline(&self.context.identity.name, format))
                    .await
            }
            Control::Displaced => {
                tracing::info!("session taken over by another connection");
                if self.pipeline == PipelineState::Streaming && self.context.speaker.is_playing() {
                    self.context.speaker.stop();
                }
                self.satellite = SatelliteState::Stopped;
                self.pipeline = PipelineState::Inactive;
                ControlFlow::Break(())
            }
        }
    }

    async fn send_info(&self) -> ControlFlow<()> {
        let wake_word = self.context.settings.read(|s| s.wake_word.clone());
        let identity = &self.context.identity;
        self.send(events::info(&identity.name, &identity.version, &wake_word))
            .await
    }

    fn apply_settings(&self, data: &Map<String, Value>) {
        let settings = match data.get("settings") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(encoded)) => match serde_json::from_str(encoded) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(error = %e, "invalid custom-settings payload");
                    return;
                }
            },
            _ => {
                tracing::warn!("custom-settings without settings");
                return;
            }
        };

        let applied = self.context.settings.apply_remote(&settings);
        tracing::debug!(applied = applied.len(), "applied remote settings");
    }

    async fn start_satellite(&mut self) -> ControlFlow<()> {
        let peer = self.peer.to_string();
        // First pairing writes the record to disk
        let pairing = Arc::clone(&self.context.pairing);
        let verify = tokio::task::spawn_blocking(move || pairing.pair_or_verify(&peer));
        let decision = match verify.await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "pairing task failed");
                return ControlFlow::Break(());
            }
        };

        match decision {
            PairingDecision::Rejected => {
                tracing::warn!(
                    paired = ?self.context.pairing.paired_peer(),
                    "rejecting satellite start from unpaired peer"
                );
                return ControlFlow::Break(());
            }
            PairingDecision::Paired | PairingDecision::Matched => {}
        }

        let claim = self.server.claim(ActivePipeline {
            connection: self.connection,
            peer: self.peer,
            outbox: self.outbox.clone(),
            control: self.control_tx.clone(),
            pipeline: self.pipeline,
        });
        self.satellite = SatelliteState::Running;
        tracing::info!(?claim, "satellite running");

        ControlFlow::Continue(())
    }

    fn set_pipeline(&mut self, state: PipelineState) {
        self.pipeline = state;
        self.server.set_pipeline_state(self.connection, state);
    }

    fn release_input_stream(&mut self) {
        self.set_pipeline(PipelineState::Inactive);
        self.server.release_input_stream(self.connection);
    }

    fn start_heartbeat(&mut self) {
        let outbox = self.outbox.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if outbox.send(events::ping()).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn schedule_unduck(&mut self) {
        self.cancel_unduck();
        let media = Arc::clone(&self.context.media);
        self.unduck = Some(tokio::spawn(async move {
            tokio::time::sleep(UNDUCK_DELAY).await;
            media.unduck();
        }));
    }

    fn cancel_unduck(&mut self) {
        if let Some(task) = self.unduck.take() {
            task.abort();
        }
    }

    /// End the satellite session held by this connection
    fn stop_satellite(&mut self) {
        if self.server.is_active(self.connection) {
            if self.pipeline == PipelineState::Listening {
                self.server.release_input_stream(self.connection);
            }
            if self.pipeline == PipelineState::Streaming && self.context.speaker.is_playing() {
                self.context.speaker.stop();
            }
            self.set_pipeline(PipelineState::Inactive);
            self.satellite = SatelliteState::Stopped;
            self.server.release(self.connection);
            tracing::info!("satellite stopped");
        } else {
            self.pipeline = PipelineState::Inactive;
            self.satellite = SatelliteState::Stopped;
            tracing::info!("closing orphaned satellite connection");
        }
    }

    /// Tear down the connection's tasks and session; idempotent
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.cancel_unduck();

        if self.satellite == SatelliteState::Running {
            self.stop_satellite();
        }

        self.server.unregister_connection(self.connection);
    }
}

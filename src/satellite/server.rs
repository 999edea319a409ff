//! Accept loop and active pipeline registry

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use super::handler::{self, Control};
use super::{PipelineState, SatelliteContext, SatelliteEvent};
use crate::Result;
use crate::protocol::{Packet, events};
use crate::wakeword::Detection;

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// The connection currently driving the satellite
pub(crate) struct ActivePipeline {
    pub connection: ConnectionId,
    pub peer: IpAddr,
    pub outbox: mpsc::Sender<Packet>,
    pub control: mpsc::UnboundedSender<Control>,
    pub pipeline: PipelineState,
}

/// Result of a connection claiming the active pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// No session was live; one starts now
    Started,
    /// The connection already held the pipeline
    Renewed,
    /// The pipeline moved from another connection
    Transferred(ConnectionId),
}

/// Satellite event server
pub struct SatelliteServer {
    context: Arc<SatelliteContext>,
    active: Mutex<Option<ActivePipeline>>,
    events: mpsc::UnboundedSender<SatelliteEvent>,
    connections: AtomicUsize,
    next_connection: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl SatelliteServer {
    /// Create a server and the receiver for its lifecycle events
    #[must_use]
    pub fn new(
        context: Arc<SatelliteContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SatelliteEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let server = Arc::new(Self {
            context,
            active: Mutex::new(None),
            events,
            connections: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
            shutdown,
        });
        (server, events_rx)
    }

    /// Shared collaborators
    #[must_use]
    pub const fn context(&self) -> &Arc<SatelliteContext> {
        &self.context
    }

    /// Accept connections until [`shutdown`](Self::shutdown)
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(address = %local, "satellite server listening");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(handler::serve_connection(Arc::clone(&self), stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                () = async {
                    // A dropped sender also means stop
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => break,
            }
        }

        tracing::info!("satellite server stopped");
        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Whether a satellite session is live
    #[must_use]
    pub fn has_active_pipeline(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Connection holding the active pipeline
    #[must_use]
    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.lock_active().as_ref().map(|a| a.connection)
    }

    /// Peer holding the active pipeline
    #[must_use]
    pub fn active_peer(&self) -> Option<IpAddr> {
        self.lock_active().as_ref().map(|a| a.peer)
    }

    /// Pipeline state of the active connection
    #[must_use]
    pub fn pipeline_state(&self) -> Option<PipelineState> {
        self.lock_active().as_ref().map(|a| a.pipeline)
    }

    /// Send microphone PCM to the active connection
    ///
    /// Audio is dropped rather than queued without bound when the
    /// connection falls behind.
    pub fn forward_audio(&self, pcm: Vec<u8>) {
        let active = self.lock_active();
        let Some(active) = active.as_ref() else {
            return;
        };

        let format = self.context.settings.read(crate::config::Settings::audio_format);
        if let Err(mpsc::error::TrySendError::Full(_)) =
            active.outbox.try_send(events::audio_chunk(format, pcm))
        {
            tracing::trace!(connection = active.connection, "outbound queue full, dropping audio");
        }
    }

    /// Send a `custom-status` report to the active connection
    pub fn forward_status(&self, sensors: Map<String, Value>) {
        let active = self.lock_active();
        if let Some(active) = active.as_ref() {
            let _ = active.outbox.try_send(events::custom_status(Utc::now(), sensors));
        }
    }

    /// Hand a detection to the active connection
    pub fn wake_word_detected(&self, detection: &Detection) {
        let active = self.lock_active();
        match active.as_ref() {
            Some(active) => {
                let _ = active
                    .control
                    .send(Control::WakeWordDetected(detection.clone()));
            }
            None => tracing::debug!("wake word detected without an active satellite"),
        }
    }

    /// Ask the router to stream microphone audio for `connection`
    pub fn request_input_stream(&self, connection: ConnectionId) {
        if self.is_active(connection) {
            self.emit(SatelliteEvent::RequestInputStream);
        }
    }

    /// Tell the router `connection` no longer wants microphone audio
    pub fn release_input_stream(&self, connection: ConnectionId) {
        if self.is_active(connection) {
            self.emit(SatelliteEvent::ReleaseInputStream);
        }
    }

    pub(crate) fn register_connection(&self) -> ConnectionId {
        let count = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        tracing::info!(connection, connections = count, "client connected");
        connection
    }

    pub(crate) fn unregister_connection(&self, connection: ConnectionId) {
        let count = self.connections.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        tracing::info!(connection, connections = count, "client disconnected");
    }

    /// Make `pipeline` the active connection
    ///
    /// A displaced holder is told it lost the session. The router is only
    /// started when no session was live, so a takeover never restarts the
    /// audio hardware.
    pub(crate) fn claim(&self, pipeline: ActivePipeline) -> Claim {
        let connection = pipeline.connection;
        let previous = self.lock_active().replace(pipeline);

        let claim = match previous {
            None => {
                self.emit(SatelliteEvent::Started);
                Claim::Started
            }
            Some(previous) if previous.connection == connection => Claim::Renewed,
            Some(previous) => {
                if previous.pipeline == PipelineState::Listening {
                    self.emit(SatelliteEvent::ReleaseInputStream);
                }
                let _ = previous.control.send(Control::Displaced);
                Claim::Transferred(previous.connection)
            }
        };

        tracing::debug!(connection, ?claim, "active pipeline claimed");
        claim
    }

    /// Release the active pipeline if `connection` holds it
    pub(crate) fn release(&self, connection: ConnectionId) -> bool {
        let released = {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|a| a.connection == connection) {
                active.take().is_some()
            } else {
                false
            }
        };

        if released {
            self.emit(SatelliteEvent::Stopped);
        }
        released
    }

    pub(crate) fn is_active(&self, connection: ConnectionId) -> bool {
        self.active_connection() == Some(connection)
    }

    pub(crate) fn set_pipeline_state(&self, connection: ConnectionId, state: PipelineState) {
        if let Some(active) = self
            .lock_active()
            .as_mut()
            .filter(|a| a.connection == connection)
        {
            active.pipeline = state;
        }
    }

    fn emit(&self, event: SatelliteEvent) {
        tracing::debug!(?event, "satellite event");
        let _ = self.events.send(event);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActivePipeline>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

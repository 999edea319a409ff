//! Daemon - the main satellite service
//!
//! Wires configuration, audio hardware, the event server, the audio router,
//! and service discovery together, then runs until interrupted

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::{DeviceIdentity, SettingChange, SharedSettings};
use crate::discovery::MdnsAdvertiser;
use crate::satellite::{LogScreen, PairingStore, SatelliteContext, SatelliteServer};
use crate::voice::{AudioRouter, CpalMediaPlayer, CpalPcmSink, CpalRecorder, MediaPlayer};
use crate::{Config, Result, wakeword};

/// Time allowed for connections to run their stop sequence on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// The satellite daemon
pub struct Daemon {
    config: Config,
    identity: DeviceIdentity,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the device id
    /// cannot be persisted
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let identity = DeviceIdentity::load_or_create(&config.data_dir, &config.name)?;

        Ok(Self { config, identity })
    }

    /// How this satellite names itself
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the pairing record is unreadable or the listener
    /// cannot be bound
    pub async fn run(self) -> Result<()> {
        let settings = Arc::new(SharedSettings::new(self.config.settings.clone()));
        let pairing = Arc::new(PairingStore::load(self.config.pairing_path())?);
        let media: Arc<dyn MediaPlayer> = Arc::new(
            CpalMediaPlayer::new(
                self.config.settings.music_volume,
                self.config.settings.ducking_volume,
            )
            .with_sounds_dir(self.config.sounds_dir()),
        );

        if let Some(peer) = pairing.paired_peer() {
            tracing::info!(peer = %peer, "paired controller");
        }

        let context = Arc::new(SatelliteContext {
            identity: self.identity.clone(),
            settings: Arc::clone(&settings),
            pairing,
            media: Arc::clone(&media),
            speaker: Arc::new(CpalPcmSink::new()),
            screen: Arc::new(LogScreen),
        });

        let (server, events) = SatelliteServer::new(context);

        let router = AudioRouter::new(
            Box::new(CpalRecorder::new()),
            wakeword::default_provider(self.config.model_dir.clone()),
            Arc::clone(&settings),
            Arc::clone(&server),
        );
        let router_task = tokio::spawn(Arc::clone(&router).run(events, settings.subscribe()));

        tokio::spawn(apply_media_settings(settings.subscribe(), Arc::clone(&media)));

        let status_task = (self.config.status_interval_secs > 0).then(|| {
            tokio::spawn(report_status(
                Arc::clone(&server),
                Arc::clone(&settings),
                Duration::from_secs(self.config.status_interval_secs),
            ))
        });

        let listener = TcpListener::bind((self.config.bind_address, self.config.port)).await?;
        let port = listener.local_addr()?.port();

        let advertiser = if self.config.discovery {
            advertise(&self.identity, port).await
        } else {
            tracing::info!("service discovery disabled");
            None
        };

        tracing::info!(
            name = %self.identity.name,
            device_id = %self.identity.device_id,
            port,
            wake_word = %settings.read(|s| s.wake_word.clone()),
            "satellite running"
        );

        let mut server_task = tokio::spawn(Arc::clone(&server).serve(listener));
        let mut server_done = false;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown requested");
            }
            result = &mut server_task => {
                server_done = true;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "satellite server failed"),
                    Err(e) => tracing::error!(error = %e, "satellite server task failed"),
                }
            }
        }

        server.shutdown();
        if let Some(advertiser) = advertiser {
            advertiser.unregister().await;
        }
        if !server_done {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut server_task).await;
        }
        // Let connections run their stop sequence
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        if let Some(status_task) = status_task {
            status_task.abort();
        }
        router_task.abort();
        let _ = tokio::task::spawn_blocking(move || router.shutdown()).await;
        media.stop();

        tracing::info!("daemon stopped");
        Ok(())
    }
}

async fn advertise(identity: &DeviceIdentity, port: u16) -> Option<MdnsAdvertiser> {
    let advertiser = match MdnsAdvertiser::new(&identity.device_id, &identity.version) {
        Ok(advertiser) => advertiser,
        Err(e) => {
            tracing::warn!(error = %e, "mDNS unavailable, continuing without discovery");
            return None;
        }
    };

    if let Err(e) = advertiser.register(port).await {
        tracing::warn!(error = %e, "failed to advertise satellite");
        return None;
    }
    Some(advertiser)
}

/// Keep media volumes in step with remote settings
async fn apply_media_settings(
    mut changes: broadcast::Receiver<SettingChange>,
    media: Arc<dyn MediaPlayer>,
) {
    loop {
        match changes.recv().await {
            Ok(SettingChange::MusicVolume(volume)) => media.set_volume(volume),
            Ok(SettingChange::DuckingVolume(volume)) => media.set_ducking_volume(volume),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "media missed setting changes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Send a `custom-status` report on every tick while a session is live
async fn report_status(
    server: Arc<SatelliteServer>,
    settings: Arc<SharedSettings>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    // Skip the first immediate tick
    interval.tick().await;

    loop {
        interval.tick().await;
        if server.has_active_pipeline() {
            server.forward_status(status_sensors(&server, &settings));
        }
    }
}

/// Sensor readings for a `custom-status` report
#[must_use]
pub fn status_sensors(server: &SatelliteServer, settings: &SharedSettings) -> Map<String, Value> {
    let (muted, wake_word) = settings.read(|s| (s.muted, s.wake_word.clone()));
    let pipeline = server
        .pipeline_state()
        .map_or("inactive", |state| state.as_str());

    let mut sensors = Map::new();
    sensors.insert("connections".to_string(), json!(server.connection_count()));
    sensors.insert("muted".to_string(), json!(muted));
    sensors.insert("wake_word".to_string(), json!(wake_word));
    sensors.insert("pipeline".to_string(), json!(pipeline));
    sensors
}

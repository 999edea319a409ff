//! Microphone audio routing
//!
//! The router owns the recorder and decides where each captured chunk goes:
//! nowhere, into the wake word detector, or out to the active connection.
//! Satellite lifecycle events move it between those routes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{broadcast, mpsc};

use super::capture::Recorder;
use super::dsp;
use crate::config::{SettingChange, SharedSettings};
use crate::satellite::{SatelliteEvent, SatelliteServer};
use crate::wakeword::{ModelProvider, WakeWordDetector};
use crate::{Error, Result};

/// Where microphone chunks go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRoute {
    /// Discarded
    None,
    /// Fed to the wake word detector
    Detect,
    /// Forwarded to the active connection
    Stream,
}

/// Routes microphone audio between detection and streaming
pub struct AudioRouter {
    route: Mutex<AudioRoute>,
    detector: Mutex<Option<WakeWordDetector>>,
    recorder: Mutex<Box<dyn Recorder>>,
    models: Arc<dyn ModelProvider>,
    settings: Arc<SharedSettings>,
    server: Arc<SatelliteServer>,
}

impl AudioRouter {
    /// Create an idle router
    #[must_use]
    pub fn new(
        recorder: Box<dyn Recorder>,
        models: Arc<dyn ModelProvider>,
        settings: Arc<SharedSettings>,
        server: Arc<SatelliteServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            route: Mutex::new(AudioRoute::None),
            detector: Mutex::new(None),
            recorder: Mutex::new(recorder),
            models,
            settings,
            server,
        })
    }

    /// Current route
    #[must_use]
    pub fn route(&self) -> AudioRoute {
        *lock(&self.route)
    }

    /// Whether a wake word detector is loaded
    #[must_use]
    pub fn has_detector(&self) -> bool {
        lock(&self.detector).is_some()
    }

    /// Whether the recorder is capturing
    #[must_use]
    pub fn is_recording(&self) -> bool {
        lock(&self.recorder).is_recording()
    }

    /// Drive the router from satellite events and setting changes
    ///
    /// Handling blocks on model loading and audio hardware, so each event
    /// runs on the blocking pool; events are still handled one at a time.
    /// Returns when the event channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SatelliteEvent>,
        mut changes: broadcast::Receiver<SettingChange>,
    ) {
        let mut settings_open = true;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let router = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || router.handle_event(event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, ?event, "audio routing failed"),
                        Err(e) => tracing::error!(error = %e, "audio routing task failed"),
                    }
                }
                change = changes.recv(), if settings_open => match change {
                    Ok(change) => {
                        let router = Arc::clone(&self);
                        if let Err(e) =
                            tokio::task::spawn_blocking(move || router.handle_setting(&change)).await
                        {
                            tracing::error!(error = %e, "settings task failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed setting changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => settings_open = false,
                },
            }
        }

        let router = Arc::clone(&self);
        let _ = tokio::task::spawn_blocking(move || router.shutdown()).await;
    }

    /// Apply a satellite lifecycle event
    ///
    /// # Errors
    ///
    /// Returns error if the recorder fails to start; the route is left at
    /// [`AudioRoute::None`]
    pub fn handle_event(self: &Arc<Self>, event: SatelliteEvent) -> Result<()> {
        match event {
            SatelliteEvent::Started => self.start(),
            SatelliteEvent::Stopped => {
                self.stop();
                Ok(())
            }
            SatelliteEvent::RequestInputStream => {
                let mut route = lock(&self.route);
                if *route == AudioRoute::Detect {
                    *route = AudioRoute::Stream;
                    drop(route);
                    lock(&self.detector).take();
                    tracing::debug!("streaming microphone audio");
                }
                Ok(())
            }
            SatelliteEvent::ReleaseInputStream => {
                if self.route() == AudioRoute::Stream {
                    self.load_detector();
                    *lock(&self.route) = AudioRoute::Detect;
                    tracing::debug!("listening for wake word");
                }
                Ok(())
            }
        }
    }

    /// React to a runtime setting change
    pub fn handle_setting(&self, change: &SettingChange) {
        if let SettingChange::WakeWord(wake_word) = change
            && self.route() == AudioRoute::Detect
        {
            tracing::info!(wake_word = %wake_word, "switching wake word");
            self.load_detector();
        }
    }

    /// Route one captured chunk
    pub fn process_chunk(&self, samples: &[i16]) {
        let (muted, sensitivity, threshold) = self
            .settings
            .read(|s| (s.muted, s.mic_gain, s.wake_word_threshold));
        if muted {
            return;
        }

        let route = self.route();
        if route == AudioRoute::None {
            return;
        }

        let samples = dsp::pre_process(samples, sensitivity);
        match route {
            AudioRoute::None => {}
            AudioRoute::Detect => {
                let detection = lock(&self.detector)
                    .as_mut()
                    .and_then(|detector| detector.process(&dsp::normalise(&samples), threshold));
                if let Some(detection) = detection {
                    self.server.wake_word_detected(&detection);
                }
            }
            AudioRoute::Stream => self.server.forward_audio(dsp::to_le_bytes(&samples)),
        }
    }

    /// Stop recording and unload the detector
    pub fn shutdown(&self) {
        self.stop();
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        if self.route() != AudioRoute::None {
            return Ok(());
        }

        self.load_detector();

        let router: Weak<Self> = Arc::downgrade(self);
        let started = lock(&self.recorder).start(Box::new(move |chunk| {
            if let Some(router) = router.upgrade() {
                router.process_chunk(chunk);
            }
        }));

        if let Err(e) = started {
            lock(&self.detector).take();
            return Err(Error::Audio(format!("failed to start recording: {e}")));
        }

        *lock(&self.route) = AudioRoute::Detect;
        tracing::info!("audio router listening for wake word");
        Ok(())
    }

    fn stop(&self) {
        *lock(&self.route) = AudioRoute::None;
        lock(&self.recorder).stop();
        lock(&self.detector).take();
        tracing::debug!("audio router idle");
    }

    /// Load the detector for the current wake word, logging failures
    fn load_detector(&self) {
        let wake_word = self.settings.read(|s| s.wake_word.clone());
        let detector = match WakeWordDetector::load(self.models.as_ref(), &wake_word) {
            Ok(detector) => Some(detector),
            Err(e) => {
                tracing::error!(error = %e, wake_word = %wake_word, "failed to load wake word model");
                None
            }
        };
        *lock(&self.detector) = detector;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

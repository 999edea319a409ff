//! Audio output: media playback and streamed TTS audio
//!
//! Both outputs run their cpal stream on a dedicated thread so the callers
//! (connection tasks) never block on audio hardware.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::dsp::from_le_bytes;
use crate::protocol::AudioFormat;
use crate::{Error, Result};

const WORKER_POLL: Duration = Duration::from_millis(20);

/// Plays media URLs and manages their volume
pub trait MediaPlayer: Send + Sync {
    /// Start playing a URL, replacing anything already playing
    fn play(&self, url: &str);
    /// Pause playback
    fn pause(&self);
    /// Resume paused playback
    fn resume(&self);
    /// Stop playback
    fn stop(&self);
    /// Set the volume in [0, 1]
    fn set_volume(&self, volume: f32);
    /// Set the volume used while ducked
    fn set_ducking_volume(&self, volume: f32);
    /// Lower the volume for a voice interaction
    fn duck(&self);
    /// Restore the volume after a voice interaction
    fn unduck(&self);
    /// Play a short sound over whatever is playing
    ///
    /// `sound` is a name resolved against the sounds directory, a file path
    /// or a URL; see [`resolve_sound`].
    fn play_sound(&self, sound: &str);
}

/// Where a sound's MP3 data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundSource {
    /// Fetched over HTTP
    Url(String),
    /// Read from disk
    File(PathBuf),
}

/// Resolve a sound setting
///
/// URLs are used as given, values with a path separator or an `.mp3`
/// extension are file paths, and anything else names `<sounds_dir>/<name>.mp3`.
#[must_use]
pub fn resolve_sound(sound: &str, sounds_dir: &Path) -> SoundSource {
    if sound.starts_with("http://") || sound.starts_with("https://") {
        return SoundSource::Url(sound.to_string());
    }

    let is_path = sound.contains(['/', '\\'])
        || Path::new(sound)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"));
    if is_path {
        SoundSource::File(PathBuf::from(sound))
    } else {
        SoundSource::File(sounds_dir.join(format!("{sound}.mp3")))
    }
}

/// Streams raw PCM (TTS responses) to the speaker
pub trait PcmSink: Send + Sync {
    /// Open the output for a stream format
    ///
    /// # Errors
    ///
    /// Returns error if the format is unsupported or the device fails
    fn start(&self, format: AudioFormat) -> Result<()>;
    /// Queue PCM bytes in the started format
    fn write(&self, pcm: &[u8]);
    /// Finish playing queued audio and close the output
    fn stop(&self);
    /// Whether a stream is open
    fn is_playing(&self) -> bool;
}

/// Volume with ducking
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume {
    /// Normal volume
    pub level: f32,
    /// Volume while ducked
    pub ducking_level: f32,
    /// Whether a voice interaction is lowering the volume
    pub ducked: bool,
}

impl Volume {
    /// Volume at `level`, not ducked
    #[must_use]
    pub const fn new(level: f32, ducking_level: f32) -> Self {
        Self {
            level,
            ducking_level,
            ducked: false,
        }
    }

    /// Volume to apply to output samples
    ///
    /// Ducking never raises the volume.
    #[must_use]
    pub fn effective(&self) -> f32 {
        if self.ducked && self.ducking_level < self.level {
            self.ducking_level
        } else {
            self.level
        }
    }
}

/// Decoded mono audio
struct Track {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// A background output thread and its stop flag
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn signal(self) {
        self.stop.store(true, Ordering::SeqCst);
        // Detach; the thread exits on its next poll
        drop(self.handle);
    }
}

/// Media player on the default output device
pub struct CpalMediaPlayer {
    volume: Mutex<Volume>,
    effective: Arc<AtomicU32>,
    paused: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    sounds_dir: PathBuf,
}

impl CpalMediaPlayer {
    /// Create a player with initial volumes
    #[must_use]
    pub fn new(volume: f32, ducking_volume: f32) -> Self {
        let volume = Volume::new(volume, ducking_volume);
        Self {
            effective: Arc::new(AtomicU32::new(volume.effective().to_bits())),
            volume: Mutex::new(volume),
            paused: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            sounds_dir: PathBuf::from("sounds"),
        }
    }

    /// Resolve sound names against `dir`
    #[must_use]
    pub fn with_sounds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sounds_dir = dir.into();
        self
    }

    /// Current volume state
    #[must_use]
    pub fn volume(&self) -> Volume {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_volume(&self, f: impl FnOnce(&mut Volume)) {
        let mut volume = self.volume.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut volume);
        self.effective
            .store(volume.effective().to_bits(), Ordering::SeqCst);
        tracing::debug!(volume = volume.effective(), ducked = volume.ducked, "media volume");
    }
}

impl MediaPlayer for CpalMediaPlayer {
    fn play(&self, url: &str) {
        self.stop();
        self.paused.store(false, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let url = url.to_string();
        let thread_stop = Arc::clone(&stop);
        let effective = Arc::clone(&self.effective);
        let paused = Arc::clone(&self.paused);

        let spawned = std::thread::Builder::new()
            .name("media-player".to_string())
            .spawn(move || {
                let result = fetch_track(&url)
                    .and_then(|track| play_track(&track, &effective, &paused, &thread_stop));
                match result {
                    Ok(()) => tracing::debug!(url, "media playback finished"),
                    Err(e) => tracing::warn!(url, error = %e, "media playback failed"),
                }
            });

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Worker { stop, handle });
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn media player thread"),
        }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.signal();
        }
    }

    fn set_volume(&self, volume: f32) {
        self.update_volume(|v| v.level = volume.clamp(0.0, 1.0));
    }

    fn set_ducking_volume(&self, volume: f32) {
        self.update_volume(|v| v.ducking_level = volume.clamp(0.0, 1.0));
    }

    fn duck(&self) {
        self.update_volume(|v| v.ducked = true);
    }

    fn unduck(&self) {
        self.update_volume(|v| v.ducked = false);
    }

    fn play_sound(&self, sound: &str) {
        let source = resolve_sound(sound, &self.sounds_dir);
        // Sounds ignore ducking and pausing
        let level = Arc::new(AtomicU32::new(self.volume().level.to_bits()));
        let paused = Arc::new(AtomicBool::new(false));
        let done = AtomicBool::new(false);

        let spawned = std::thread::Builder::new()
            .name("sound-player".to_string())
            .spawn(move || {
                let result = load_sound(&source)
                    .and_then(|track| play_track(&track, &level, &paused, &done));
                if let Err(e) = result {
                    tracing::warn!(?source, error = %e, "failed to play sound");
                }
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn sound thread");
        }
    }
}

impl Drop for CpalMediaPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fetch_track(url: &str) -> Result<Track> {
    let bytes = reqwest::blocking::get(url)?.error_for_status()?.bytes()?;
    decode_mp3(&bytes)
}

fn load_sound(source: &SoundSource) -> Result<Track> {
    match source {
        SoundSource::Url(url) => fetch_track(url),
        SoundSource::File(path) => decode_mp3(&std::fs::read(path)?),
    }
}

fn play_track(
    track: &Track,
    effective: &Arc<AtomicU32>,
    paused: &Arc<AtomicBool>,
    stop: &AtomicBool,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;
    let config = output_config(&device, track.sample_rate)?;
    let channels = usize::from(config.channels);

    let samples: Arc<[f32]> = track.samples.clone().into();
    let position = Arc::new(AtomicUsize::new(0));

    let callback_samples = Arc::clone(&samples);
    let callback_position = Arc::clone(&position);
    let callback_volume = Arc::clone(effective);
    let callback_paused = Arc::clone(paused);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let volume = f32::from_bits(callback_volume.load(Ordering::Relaxed));
                let paused = callback_paused.load(Ordering::Relaxed);
                let mut pos = callback_position.load(Ordering::Relaxed);

                for frame in data.chunks_mut(channels) {
                    let sample = if paused {
                        0.0
                    } else {
                        let s = callback_samples.get(pos).copied().unwrap_or(0.0);
                        pos = (pos + 1).min(callback_samples.len());
                        s * volume
                    };
                    frame.fill(sample);
                }

                callback_position.store(pos, Ordering::Relaxed);
            },
            |err| {
                tracing::error!(error = %err, "media playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!(
        samples = samples.len(),
        sample_rate = track.sample_rate,
        "media playback started"
    );

    while !stop.load(Ordering::SeqCst) && position.load(Ordering::Relaxed) < samples.len() {
        std::thread::sleep(WORKER_POLL);
    }

    drop(stream);
    Ok(())
}

/// Find an output config at `sample_rate`, preferring mono
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
    };

    supports(1)
        .or_else(|| supports(2))
        .map(|c| c.with_sample_rate(SampleRate(sample_rate)).config())
        .ok_or_else(|| Error::Audio(format!("no output config for {sample_rate} Hz")))
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Track> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                let channels = frame.channels.max(1);
                #[allow(clippy::cast_precision_loss)]
                samples.extend(frame.data.chunks(channels).map(|group| {
                    group.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>()
                        / group.len() as f32
                }));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Playback("no MP3 frames found".to_string()));
    }

    Ok(Track {
        samples,
        sample_rate,
    })
}

/// Streamed PCM output on the default output device
#[derive(Default)]
pub struct CpalPcmSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    playing: AtomicBool,
    channels: AtomicUsize,
    worker: Mutex<Option<Worker>>,
}

impl CpalPcmSink {
    /// Create an idle sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PcmSink for CpalPcmSink {
    fn start(&self, format: AudioFormat) -> Result<()> {
        if format.width != 2 {
            return Err(Error::Playback(format!(
                "unsupported sample width {}",
                format.width
            )));
        }

        self.stop();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.channels
            .store(usize::from(format.channels.max(1)), Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let queue = Arc::clone(&self.queue);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = std::thread::Builder::new()
            .name("pcm-output".to_string())
            .spawn(move || {
                let stream = match open_pcm_stream(format.rate, Arc::clone(&queue)) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Drain queued audio once stopped
                loop {
                    let drained = queue.lock().map_or(true, |q| q.is_empty());
                    if thread_stop.load(Ordering::SeqCst) && drained {
                        break;
                    }
                    std::thread::sleep(WORKER_POLL);
                }
                drop(stream);
                tracing::debug!("pcm output closed");
            })
            .map_err(|e| Error::Playback(format!("failed to spawn pcm thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Playback("pcm thread exited during startup".to_string()))??;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker { stop, handle });
        self.playing.store(true, Ordering::SeqCst);
        tracing::debug!(?format, "pcm output started");
        Ok(())
    }

    fn write(&self, pcm: &[u8]) {
        if !self.playing.load(Ordering::SeqCst) {
            return;
        }

        let channels = self.channels.load(Ordering::SeqCst).max(1);
        let samples = from_le_bytes(pcm);
        #[allow(clippy::cast_precision_loss)]
        let mono = samples.chunks(channels).map(|frame| {
            frame.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / frame.len() as f32
        });

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(mono);
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.signal();
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

fn open_pcm_stream(sample_rate: u32, queue: Arc<Mutex<VecDeque<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;
    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    frame.fill(queue.pop_front().unwrap_or(0.0));
                }
            },
            |err| {
                tracing::error!(error = %err, "pcm playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ducking_lowers_volume() {
        let mut volume = Volume::new(0.8, 0.1);
        assert!((volume.effective() - 0.8).abs() < f32::EPSILON);

        volume.ducked = true;
        assert!((volume.effective() - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_ducking_never_raises_volume() {
        let mut volume = Volume::new(0.05, 0.1);
        volume.ducked = true;
        assert!((volume.effective() - 0.05).abs() < f32::EPSILON);
    }

    #[test]
    fn test_player_volume_state() {
        let player = CpalMediaPlayer::new(0.8, 0.1);
        player.duck();
        player.set_volume(0.5);
        assert!((player.volume().effective() - 0.1).abs() < f32::EPSILON);

        player.unduck();
        assert!((player.volume().effective() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pcm_sink_ignores_writes_when_idle() {
        let sink = CpalPcmSink::new();
        sink.write(&[0, 1, 2, 3]);
        assert!(!sink.is_playing());
        assert!(sink.queue.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pcm_sink_rejects_8_bit() {
        let sink = CpalPcmSink::new();
        let format = AudioFormat {
            rate: 22_050,
            width: 1,
            channels: 1,
        };
        assert!(matches!(sink.start(format), Err(Error::Playback(_))));
    }

    #[test]
    fn test_resolve_sound() {
        let dir = Path::new("/var/lib/satellite/sounds");
        assert_eq!(
            resolve_sound("chime", dir),
            SoundSource::File(dir.join("chime.mp3"))
        );
        assert_eq!(
            resolve_sound("/opt/ding.mp3", dir),
            SoundSource::File(PathBuf::from("/opt/ding.mp3"))
        );
        assert_eq!(
            resolve_sound("ding.MP3", dir),
            SoundSource::File(PathBuf::from("ding.MP3"))
        );
        assert_eq!(
            resolve_sound("https://example.com/ding.mp3", dir),
            SoundSource::Url("https://example.com/ding.mp3".to_string())
        );
    }

    #[test]
    fn test_missing_sound_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = resolve_sound("chime", dir.path());
        assert!(load_sound(&source).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_mp3(&[0u8; 64]).is_err());
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_satellite::config::ConfigOptions;
use beacon_satellite::satellite::PairingStore;
use beacon_satellite::voice::{CpalRecorder, Recorder, SAMPLE_RATE, dsp, samples_to_wav};
use beacon_satellite::wakeword::{SUPPORTED_WAKE_WORDS, phrase};
use beacon_satellite::{Config, Daemon};

/// Beacon Satellite - Voice satellite endpoint for home automation controllers
#[derive(Parser)]
#[command(name = "beacon-satellite", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "BEACON_SATELLITE_PORT")]
    port: Option<u16>,

    /// Directory for the device id and pairing record
    #[arg(long, env = "BEACON_SATELLITE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory holding the wake word models
    #[arg(long, env = "BEACON_SATELLITE_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Initial wake word model (see `wake-words`)
    #[arg(short, long, env = "BEACON_SATELLITE_WAKE_WORD")]
    wake_word: Option<String>,

    /// Do not advertise the satellite over mDNS
    #[arg(long)]
    no_discovery: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Record microphone input to a WAV file
    Record {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Output file
        #[arg(short, long, default_value = "recording.wav")]
        output: PathBuf,
    },
    /// Forget the paired controller
    Unpair,
    /// List supported wake words
    WakeWords,
}

impl Cli {
    fn options(&self) -> ConfigOptions {
        ConfigOptions {
            port: self.port,
            data_dir: self.data_dir.clone(),
            model_dir: self.model_dir.clone(),
            wake_word: self.wake_word.clone(),
            disable_discovery: self.no_discovery,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_satellite=info",
        1 => "info,beacon_satellite=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = cli.options();

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::Record { duration, output } => record(duration, &output).await,
            Command::Unpair => unpair(&options),
            Command::WakeWords => {
                list_wake_words();
                Ok(())
            }
        };
    }

    let config = Config::load_with_options(&options)?;
    tracing::debug!(?config, "loaded configuration");

    let daemon = Daemon::new(config)?;
    tracing::info!(
        name = %daemon.identity().name,
        "beacon satellite ready"
    );

    // Run until interrupted
    daemon.run().await?;

    Ok(())
}

/// Start the default recorder, collecting every chunk into a shared buffer
fn start_collecting() -> anyhow::Result<(CpalRecorder, Arc<Mutex<Vec<i16>>>)> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);

    let mut recorder = CpalRecorder::new();
    recorder.start(Box::new(move |chunk| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }))?;

    Ok((recorder, buffer))
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (mut recorder, buffer) = start_collecting()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples: Vec<i16> =
            std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
        let normalised = dsp::normalise(&samples);
        let energy = calculate_rms(&normalised);
        let peak = normalised.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        let gain = dsp::auto_gain(&samples, 0);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | Gain: {:.2} | [{}]",
            i + 1,
            energy,
            peak,
            gain,
            meter
        );
    }

    recorder.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Record microphone input to a WAV file
async fn record(duration: u64, output: &std::path::Path) -> anyhow::Result<()> {
    println!("Recording {duration} seconds to {}...", output.display());

    let (mut recorder, buffer) = start_collecting()?;
    tokio::time::sleep(Duration::from_secs(duration)).await;
    recorder.stop();

    let samples = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
    let wav = samples_to_wav(&samples, SAMPLE_RATE)?;
    std::fs::write(output, wav)?;

    println!("Wrote {} samples", samples.len());
    Ok(())
}

/// Forget the paired controller
fn unpair(options: &ConfigOptions) -> anyhow::Result<()> {
    let config = Config::load_with_options(options)?;
    let store = PairingStore::load(config.pairing_path())?;

    match store.paired_peer() {
        Some(peer) => {
            store.clear()?;
            println!("Unpaired controller {peer}");
        }
        None => println!("No controller is paired"),
    }

    Ok(())
}

/// List supported wake words
fn list_wake_words() {
    for wake_word in SUPPORTED_WAKE_WORDS {
        println!("{wake_word:<14} \"{}\"", phrase(wake_word));
    }
}

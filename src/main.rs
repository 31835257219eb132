//! pancake-play: play one file through the engine and print telemetry
//!
//! Usage:
//!   pancake-play song.flac
//!   pancake-play song.flac --eq 3,2,0,0,0,0,0,0,-1,-2 --normalize --target-lufs -16
//!   pancake-play song.flac --null --seconds 5      (no audio hardware)

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pancake_engine::{
    AudioBackend, AudioPlayer, CpalBackend, EngineEvent, EngineSettings, NullBackend,
};

const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pancake-play", about = "Pancake engine command-line player")]
struct Cli {
    /// Audio file to play
    file: PathBuf,

    /// Directory holding engine.json
    #[arg(long)]
    settings_dir: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Output bit depth (16, 24 or 32)
    #[arg(long)]
    bit_depth: Option<u32>,

    /// Output channel count (1 or 2)
    #[arg(long)]
    channels: Option<u16>,

    /// Volume, 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Ten comma-separated EQ gains in dB, 31 Hz to 16 kHz
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    eq: Option<Vec<f32>>,

    /// Enable loudness normalization
    #[arg(long)]
    normalize: bool,

    /// Normalization target
    #[arg(long, allow_hyphen_values = true)]
    target_lufs: Option<f32>,

    /// Tune for headphones
    #[arg(long)]
    headphones: bool,

    /// Tune for low latency
    #[arg(long)]
    high_performance: bool,

    /// Start position in milliseconds
    #[arg(long)]
    seek: Option<i64>,

    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<u64>,

    /// Render against the clock instead of a sound card
    #[arg(long)]
    null: bool,

    /// Write the resulting settings back to --settings-dir
    #[arg(long)]
    save: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = match &cli.settings_dir {
        Some(dir) => EngineSettings::load(dir)?,
        None => EngineSettings::default(),
    };

    let backend: Arc<dyn AudioBackend> = if cli.null {
        Arc::new(NullBackend::new())
    } else {
        Arc::new(CpalBackend::new())
    };
    let player =
        AudioPlayer::new(backend, settings, None).context("Failed to start the audio engine")?;

    configure(&player, &cli)?;

    player
        .load(&cli.file)
        .with_context(|| format!("Failed to load {:?}", cli.file))?;
    if let Some(info) = player.track_info() {
        println!(
            "{}: {} Hz, {} ch, {} bit, {:.1} s",
            cli.file.display(),
            info.sample_rate,
            info.channels,
            info.bit_depth.map_or("?".to_string(), |b| b.to_string()),
            info.duration_ms() as f64 / 1000.0
        );
    }
    if let Some(format) = player.output_format() {
        println!("Output: {} Hz, {} ch", format.sample_rate, format.channels);
    }

    if let Some(ms) = cli.seek {
        player.seek_ms(ms)?;
    }
    player.play()?;

    let limit = cli.seconds.map(Duration::from_secs);
    let started = Instant::now();
    loop {
        thread::sleep(REPORT_INTERVAL);

        for event in player.poll_events() {
            match event {
                EngineEvent::Completed => {
                    println!("Finished");
                    return finish(&player, &cli);
                }
                EngineEvent::Error(e) => bail!("Playback failed: {}", e),
                EngineEvent::StateChanged(state) => tracing::debug!("State: {}", state.as_str()),
            }
        }

        report(&player);

        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            player.stop();
            return finish(&player, &cli);
        }
    }
}

fn configure(player: &AudioPlayer, cli: &Cli) -> Result<()> {
    if cli.headphones || cli.high_performance {
        player.optimize_for_device(cli.headphones, cli.high_performance);
    }
    if let Some(rate) = cli.sample_rate {
        player.set_sample_rate(rate)?;
    }
    if let Some(bits) = cli.bit_depth {
        player.set_bit_depth(bits)?;
    }
    if let Some(channels) = cli.channels {
        player.set_channels(channels)?;
    }
    if let Some(volume) = cli.volume {
        player.set_volume(volume);
    }
    if let Some(gains) = &cli.eq {
        if gains.len() != 10 {
            bail!("--eq takes 10 gains, got {}", gains.len());
        }
        for (band, gain) in gains.iter().enumerate() {
            player.set_eq_band(band, *gain);
        }
        player.enable_eq(true);
    }
    if let Some(lufs) = cli.target_lufs {
        player.set_target_lufs(lufs);
    }
    if cli.normalize {
        player.enable_volume_normalization(true);
    }
    Ok(())
}

fn report(player: &AudioPlayer) {
    let bars: String = player
        .visualization_data()
        .iter()
        .map(|v| match (v * 4.0) as u32 {
            0 => ' ',
            1 => '.',
            2 => ':',
            3 => '|',
            _ => '#',
        })
        .collect();
    println!(
        "{:>7.1}s / {:.1}s  buffered {:>4} ms  underruns {:>3}  [{}]",
        player.position_ms() as f64 / 1000.0,
        player.duration_ms() as f64 / 1000.0,
        player.buffered_ms(),
        player.underrun_count(),
        bars
    );
}

fn finish(player: &AudioPlayer, cli: &Cli) -> Result<()> {
    if cli.save {
        let Some(dir) = &cli.settings_dir else {
            bail!("--save needs --settings-dir");
        };
        player.settings().save(dir)?;
    }
    Ok(())
}

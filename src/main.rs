//! sfx-noise - Interactive noise generator
//!
//! Streams white or brown noise to the default audio output device while a
//! command loop on stdin adjusts volume, pauses, resumes, or rebuilds the
//! audio pipeline.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

mod audio;
mod commands;
mod pipeline;
mod settings;

use audio::{CpalBackend, NoiseColor};
use commands::{print_block, Flow};
use pipeline::Pipeline;
use settings::NoiseConfig;

/// Startup flags; each one overrides the settings file
#[derive(Parser, Debug)]
#[command(name = "sfx-noise", version, about = "Interactive white/brown noise generator")]
struct Args {
    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Noise color
    #[arg(long, value_enum)]
    color: Option<NoiseColor>,

    /// Seconds to play; negative plays until killed
    #[arg(long, allow_negative_numbers = true)]
    duration: Option<i64>,

    /// Inverse gain multiplier (> 0)
    #[arg(long)]
    speed: Option<f64>,

    /// Output volume between 0 and 1
    #[arg(long)]
    volume: Option<f32>,

    /// Fixed RNG seed
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn settings_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(settings::settings_path)
    }

    /// Layer the flags over `config`
    fn apply(&self, config: &mut NoiseConfig) {
        if let Some(sample_rate) = self.sample_rate {
            config.sample_rate = sample_rate;
        }
        if let Some(color) = self.color {
            config.color = color;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(speed) = self.speed {
            config.speed = speed;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    log::info!("Starting sfx-noise");

    let args = Args::parse();
    let settings_path = args.settings_path();
    let mut config = NoiseConfig::load(&settings_path);
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {}", e);
        eprintln!("[!] Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    println!("\n== SFX NoiseGenerator ==\n\n[ Configuration ]\n{}\n", config);

    let pipeline = Pipeline::new(config, Arc::new(CpalBackend));
    let registry = commands::builtin(&pipeline, settings_path);

    let mut stdout = io::stdout();
    if let Err(e) = pipeline.validate() {
        log::error!("Failed to open the audio pipeline: {}", e);
        print_block(
            &mut stdout,
            &format!("{}\nRetry with \"sfx_validate\"", e),
        );
    }

    println!("[!] Type \"help\" for a list of commands.");

    match registry.run(io::stdin().lock(), &mut stdout) {
        Flow::Exit => {
            pipeline.kill();
            ExitCode::SUCCESS
        }
        Flow::Continue => {
            log::info!("Input closed, waiting for playback to finish");
            pipeline.wait();
            log::info!("Playback ended in state {}", pipeline.state().name());
            ExitCode::SUCCESS
        }
    }
}

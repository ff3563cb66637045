//! CLI tool for inspecting the delay pattern of a MusicGen checkpoint
//!
//! Prints which frame each codebook emits at every step, the number of
//! decoder steps and audio samples for a duration, and optionally replays a
//! full session with a synthetic forward pass to check the reorder.
//!
//! Usage:
//!     cargo run --features cli --bin delay_schedule -- --duration 10
//!     cargo run --features cli --bin delay_schedule -- --config musicgen-small/config.json --frames 6 --simulate
//!     cargo run --features cli --bin delay_schedule -- --codebooks 8 --frames 4 --json

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use musicgen_delay::{
    CancelToken, DelayPattern, ForwardPass, GenerationOutcome, GenerationSession, LayerCaches,
    MusicGenConfig,
};

/// Inspect the delayed codebook schedule for a model config
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the model's config.json (defaults to musicgen-small values)
    #[arg(short, long)]
    config: Option<String>,

    /// Audio duration in seconds
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,

    /// Frames per codebook (overrides --duration)
    #[arg(short, long)]
    frames: Option<usize>,

    /// Override the number of codebooks
    #[arg(long)]
    codebooks: Option<usize>,

    /// Maximum number of steps to print in the table
    #[arg(long, default_value_t = 16)]
    max_rows: usize,

    /// Replay a session with a synthetic forward pass and verify alignment
    #[arg(long)]
    simulate: bool,

    /// Print a JSON summary instead of the table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ScheduleSummary {
    num_codebooks: usize,
    pad_token_id: u32,
    num_layers: usize,
    target_length: usize,
    total_steps: usize,
    num_samples: usize,
    sample_rate: u32,
    frame_rate: u32,
    simulated: Option<bool>,
}

/// Emits `frame * 10 + codebook` for live codebooks, so the reordered output
/// is predictable.
struct SyntheticForward {
    pattern: DelayPattern,
    step: usize,
}

impl ForwardPass for SyntheticForward {
    fn predict(
        &mut self,
        tokens: &[u32],
        _caches: &mut LayerCaches,
        _conditioning: &Tensor,
    ) -> Result<Vec<u32>> {
        let predicted = self
            .pattern
            .live_indices(self.step)
            .iter()
            .enumerate()
            .map(|(codebook, position)| match position {
                Some(frame) => (frame * 10 + codebook) as u32,
                None => self.pattern.pad_token_id(),
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(predicted.len(), tokens.len());
        self.step += 1;
        Ok(predicted)
    }
}

fn load_config(args: &Args) -> Result<MusicGenConfig> {
    let mut config = match &args.config {
        Some(path) => MusicGenConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {path}"))?,
        None => MusicGenConfig::default(),
    };
    if let Some(codebooks) = args.codebooks {
        config.decoder.num_codebooks = codebooks;
    }
    config.validate()?;
    Ok(config)
}

fn print_table(pattern: &DelayPattern, target_length: usize, max_rows: usize) {
    let header: Vec<String> = (0..pattern.num_codebooks())
        .map(|c| format!("cb{c:<4}"))
        .collect();
    println!("step   {}", header.join(" "));

    let total = pattern.total_steps(target_length);
    for step in 0..total.min(max_rows) {
        let cells: Vec<String> = pattern
            .live_indices(step)
            .iter()
            .map(|position| match position {
                Some(frame) if *frame < target_length => format!("{frame:<6}"),
                _ => format!("{:<6}", "P"),
            })
            .collect();
        println!("{step:<6} {}", cells.join(" "));
    }
    if total > max_rows {
        println!("... ({} more steps)", total - max_rows);
    }
}

fn simulate(pattern: DelayPattern, target_length: usize) -> Result<bool> {
    let mut caches = LayerCaches::new(0);
    let mut forward = SyntheticForward { pattern, step: 0 };
    let conditioning = Tensor::zeros((1, 1, 1), candle_core::DType::F32, &Device::Cpu)?;
    let mut session =
        GenerationSession::start(pattern, &mut caches, &mut forward, conditioning, target_length)?
            .with_cancel_token(CancelToken::new());

    let codes = match session.run(|progress| tracing::trace!("progress {:.3}", progress))? {
        GenerationOutcome::Completed(codes) => codes,
        GenerationOutcome::Cancelled => anyhow::bail!("simulation was cancelled"),
    };
    let aligned = codes.iter().enumerate().all(|(codebook, tokens)| {
        tokens.len() == target_length
            && tokens
                .iter()
                .enumerate()
                .all(|(frame, &token)| token == (frame * 10 + codebook) as u32)
    });
    Ok(aligned)
}

fn main() -> Result<()> {
    // Use chrome tracing when `profiling` feature is active, otherwise plain fmt.
    let _profiling_guard = musicgen_delay::profiling::init();
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let args = Args::parse();
    let config = load_config(&args)?;
    let pattern = config.delay_pattern()?;
    let target_length = match args.frames {
        Some(0) => anyhow::bail!("--frames must be at least 1"),
        Some(frames) => frames,
        None => config.target_length_for_duration(args.duration)?,
    };

    let simulated = if args.simulate {
        Some(simulate(pattern, target_length)?)
    } else {
        None
    };

    let summary = ScheduleSummary {
        num_codebooks: pattern.num_codebooks(),
        pad_token_id: pattern.pad_token_id(),
        num_layers: config.decoder.num_hidden_layers,
        target_length,
        total_steps: pattern.total_steps(target_length),
        num_samples: config.num_samples(target_length),
        sample_rate: config.audio_encoder.sampling_rate,
        frame_rate: config.audio_encoder.frame_rate(),
        simulated,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("=== Delay Schedule ===");
    println!("Codebooks: {}", summary.num_codebooks);
    println!("Pad token: {}", summary.pad_token_id);
    println!("Decoder layers: {}", summary.num_layers);
    println!(
        "Frames: {} ({:.2}s at {} frames/s)",
        summary.target_length,
        summary.target_length as f64 / summary.frame_rate as f64,
        summary.frame_rate
    );
    println!("Decoder steps: {}", summary.total_steps);
    println!(
        "Audio samples: {} @ {} Hz",
        summary.num_samples, summary.sample_rate
    );
    println!();
    print_table(&pattern, target_length, args.max_rows);

    if let Some(ok) = summary.simulated {
        println!();
        if ok {
            println!("Simulation: reordered codes are time-aligned");
        } else {
            anyhow::bail!("Simulation: reordered codes are NOT time-aligned");
        }
    }
    Ok(())
}

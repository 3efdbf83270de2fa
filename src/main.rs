// scst-dialogue binary
//
// Commands:
//   scst-dialogue crossent --data <genre> -n <name>             teacher-forced pre-training
//   scst-dialogue scst --data <genre> -n <name> -l <checkpoint>  self-critical fine-tuning
//
// GPU: --cuda selects CUDA device 0 when compiled with --features cuda.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scst_dialogue::config::Config;
use scst_dialogue::pipeline::{run_crossent, run_scst, RunPaths};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Seq2seq dialogue training on the Cornell movie-dialogs corpus.
#[derive(Parser)]
#[command(name = "scst-dialogue", version, about)]
struct Cli {
    /// Directory holding the Cornell corpus files.
    #[arg(long, global = true, default_value = "data/cornell")]
    corpus: PathBuf,

    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for checkpoints.
    #[arg(long, global = true, default_value = "saves")]
    saves_dir: PathBuf,

    /// Root directory for metric streams.
    #[arg(long, global = true, default_value = "runs")]
    runs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Self-critical sequence training from a pretrained checkpoint.
    Scst {
        /// Genre to train on. Empty string trains on the full corpus.
        #[arg(long)]
        data: String,

        /// Enable CUDA.
        #[arg(long)]
        cuda: bool,

        /// Name of the run.
        #[arg(short, long)]
        name: String,

        /// Checkpoint to continue from in RL mode.
        #[arg(short, long)]
        load: PathBuf,

        /// Sampled decodes per example.
        #[arg(long)]
        samples: Option<usize>,

        /// Keep examples whose greedy decode already scores above the threshold.
        #[arg(long)]
        disable_skip: bool,
    },

    /// Cross-entropy pre-training with teacher forcing.
    Crossent {
        /// Genre to train on. Empty string trains on the full corpus.
        #[arg(long)]
        data: String,

        /// Enable CUDA.
        #[arg(long)]
        cuda: bool,

        /// Name of the run.
        #[arg(short, long)]
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Device selection
// ---------------------------------------------------------------------------

fn select_device(cuda: bool) -> Device {
    if !cuda {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(dev) => {
                info!("using CUDA device 0");
                return dev;
            }
            Err(e) => warn!(error = %e, "CUDA init failed, falling back to CPU"),
        }
    }

    #[cfg(not(feature = "cuda"))]
    warn!("built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");

    Device::Cpu
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let best = match cli.command {
        Commands::Scst {
            data,
            cuda,
            name,
            load,
            samples,
            disable_skip,
        } => {
            if let Some(samples) = samples {
                config.scst.samples = samples;
            }
            if disable_skip {
                config.scst.skip_enabled = false;
            }
            config.validate()?;
            let paths = RunPaths::new(&cli.saves_dir, &cli.runs_dir, &name);
            run_scst(&config, &cli.corpus, &data, &paths, &load, &select_device(cuda))?
        }
        Commands::Crossent { data, cuda, name } => {
            let paths = RunPaths::new(&cli.saves_dir, &cli.runs_dir, &name);
            run_crossent(&config, &cli.corpus, &data, &paths, &select_device(cuda))?
        }
    };

    match best {
        Some(score) => info!(best_bleu_test = score, "training finished"),
        None => info!("training finished without an evaluation"),
    }
    Ok(())
}

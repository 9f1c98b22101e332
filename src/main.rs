//! Command-line interface for inspecting model geometry and checkpoints.

use aewave::config::load_config;
use aewave::perf;
use aewave::{AutoEncoder, MfccInverter};
use anyhow::{Context, Result};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

type CpuBackend = NdArray<f32>;

/// Which assembler to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum ModelChoice {
    /// MFCC encoder, bottleneck and WaveNet decoder.
    Autoencoder,
    /// WaveNet conditioned directly on MFCCs.
    MfccInverter,
}

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "aewave")]
#[command(about = "WaveNet autoencoder geometry and checkpoint tools", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Model to build.
    #[arg(long, value_enum, default_value_t = ModelChoice::Autoencoder, global = true)]
    model: ModelChoice,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print the geometry chain and resolved trims for a config.
    Geometry {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Override the dataset's window size.
        #[arg(long)]
        window: Option<usize>,
    },
    /// Build a freshly initialized model and write it as a checkpoint.
    Init {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Output safetensors path.
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the parameter digest of a checkpoint.
    Checksum {
        /// Checkpoint written by `init`.
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn geometry(model: ModelChoice, config: PathBuf, window: Option<usize>) -> Result<()> {
    let config = load_config(&config)?;
    let mut dataset = config.dataset.clone();
    if let Some(window) = window {
        dataset.window_batch_size = window;
    }
    let device = NdArrayDevice::default();
    let report = match model {
        ModelChoice::Autoencoder => {
            let mut model = AutoEncoder::<CpuBackend>::new(&config, &dataset, &device)?;
            model.post_init(&dataset)?;
            model.print_geometry()?
        }
        ModelChoice::MfccInverter => {
            let mut model = MfccInverter::<CpuBackend>::new(&config, &dataset, &device)?;
            model.post_init(&dataset)?;
            model.print_geometry()?
        }
    };
    print!("{report}");
    Ok(())
}

fn init(model: ModelChoice, config: PathBuf, out: PathBuf) -> Result<()> {
    let config = load_config(&config)?;
    let device = NdArrayDevice::default();
    let checksum = match model {
        ModelChoice::Autoencoder => {
            let model = AutoEncoder::<CpuBackend>::new(&config, &config.dataset, &device)?;
            model
                .save_checkpoint(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            model.checksum()
        }
        ModelChoice::MfccInverter => {
            let model = MfccInverter::<CpuBackend>::new(&config, &config.dataset, &device)?;
            model
                .save_checkpoint(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            model.checksum()
        }
    };
    println!("{checksum}  {}", out.display());
    Ok(())
}

fn checksum(model: ModelChoice, checkpoint: PathBuf) -> Result<()> {
    let device = NdArrayDevice::default();
    let digest = match model {
        ModelChoice::Autoencoder => AutoEncoder::<CpuBackend>::load_checkpoint(&checkpoint, &device)
            .with_context(|| format!("loading {}", checkpoint.display()))?
            .checksum(),
        ModelChoice::MfccInverter => {
            MfccInverter::<CpuBackend>::load_checkpoint(&checkpoint, &device)
                .with_context(|| format!("loading {}", checkpoint.display()))?
                .checksum()
        }
    };
    println!("{digest}  {}", checkpoint.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let verbose = cli.verbose;
    let model = cli.model;

    match cli.command {
        Commands::Geometry { config, window } => geometry(model, config, window)?,
        Commands::Init { config, out } => init(model, config, out)?,
        Commands::Checksum { checkpoint } => checksum(model, checkpoint)?,
    }

    if verbose {
        eprintln!("{}", perf::report());
    }
    Ok(())
}

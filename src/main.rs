use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rreg::cli::{self, PredictArgs, TrainArgs};

#[derive(Parser)]
#[command(name = "rreg")]
#[command(about = "RustRegressionLab - scalar regression heads on pretrained causal language models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a regression head (and LoRA adapter) on a decoder backbone
    Train(TrainArgs),

    /// Score texts with a trained checkpoint
    Predict(PredictArgs),

    /// Show which compute devices are available
    Devices,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rreg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => cli::train(args)?,
        Commands::Predict(args) => cli::predict(args)?,
        Commands::Devices => cli::devices()?,
    }

    Ok(())
}

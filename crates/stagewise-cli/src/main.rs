mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stagewise",
    version,
    about = "Incremental staging, merge and quality-gate runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline for one window
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Window start: RFC 3339 timestamp or YYYY-MM-DD (default: yesterday, UTC)
        #[arg(long)]
        window_start: Option<String>,
        /// Window end, exclusive (default: one day after the start)
        #[arg(long, requires = "window_start")]
        window_end: Option<String>,
    },
    /// Validate pipeline configuration, target store and state database
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Show recent runs of a pipeline
    History {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            window_start,
            window_end,
        } => {
            commands::run::execute(&pipeline, window_start.as_deref(), window_end.as_deref()).await
        }
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::History { pipeline, limit } => commands::history::execute(&pipeline, limit),
    }
}

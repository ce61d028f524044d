mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codelab-cli")]
#[command(about = "codelab CLI - Grade lesson submissions locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a source file against an exercise's test cases
    Run {
        /// Learner source file
        #[arg(short, long)]
        file: PathBuf,

        /// Exercise JSON (id, title, test_cases, optional config overrides)
        #[arg(short, long)]
        exercise: PathBuf,

        /// Grader config JSON (defaults to config/grader.json when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the verdict as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run only the static pattern checker on a source file
    Check {
        /// Learner source file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            exercise,
            config,
            json,
        } => {
            if !commands::run_exercise(&file, &exercise, config.as_deref(), json).await? {
                std::process::exit(1);
            }
        }
        Commands::Check { file } => {
            if !commands::check_file(&file)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

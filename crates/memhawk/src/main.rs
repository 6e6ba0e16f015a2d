mod adapter;
mod catalog;
mod cmd;
mod config;
mod error;
mod fallback;
mod tool;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "memhawk", version, about = "Run memory forensics inside a resource-bounded sandbox")]
struct Cli {
    /// YAML config file (defaults apply when omitted)
    #[arg(long, short, global = true, env = "MEMHAWK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether a memory image is acceptable for analysis
    Validate(cmd::ValidateArgs),
    /// List the analysis operations in the catalog
    Operations,
    /// Run analysis operations against a memory image
    Run(cmd::RunArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries JSON results, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match config::load_or_default(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Validate(args) => cmd::run_validate(&config, args).await,
        Command::Operations => cmd::run_operations(&config).await.map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_analysis(&config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use sandbox::{Cleanup, Sandbox};
use sandbox_process::ProcessSandbox;
use tracing::{info, warn};

use crate::adapter::{OutputMode, ToolAdapter};
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::fallback::DemoData;
use crate::tool;

#[derive(Args)]
pub struct RunArgs {
    /// Memory image to analyze
    pub image: PathBuf,
    /// Operations to run, in order (see `memhawk operations`)
    #[arg(required = true)]
    pub operations: Vec<String>,
    /// Output format requested from the tool, overriding the config file
    #[arg(long, value_enum, env = "MEMHAWK_OUTPUT")]
    pub output: Option<OutputMode>,
}

/// Open a session, validate the image, run each operation in turn and print
/// one JSON record per operation. The session is closed on every path.
pub async fn run_analysis(config: &AppConfig, args: RunArgs) -> AppResult<ExitCode> {
    let sandbox_config = config.sandbox_config()?;
    let catalog = Catalog::load_or_builtin(config.catalog.as_deref()).await?;
    let demo = DemoData::load_or_builtin(config.demo_data.as_deref()).await?;
    let tool = tool::discover(config.tool.command.as_deref());
    let output = args.output.unwrap_or(config.tool.output);
    let adapter = ToolAdapter::new(Arc::new(catalog), Arc::new(demo), tool, output);

    let session = ProcessSandbox::open(sandbox_config).await?;
    let outcome = analyze(&session, &adapter, &args).await;
    if let Cleanup::Failed(reason) = session.close().await {
        warn!(workspace = %session.workspace().display(), reason = %reason, "workspace not removed");
    }
    outcome
}

async fn analyze(session: &ProcessSandbox, adapter: &ToolAdapter, args: &RunArgs) -> AppResult<ExitCode> {
    let validation = session.validate(&args.image).await;
    if !validation.valid {
        warn!(path = %args.image.display(), "image rejected, nothing run");
        super::print_json(&validation)?;
        return Ok(ExitCode::FAILURE);
    }
    for warning in &validation.warnings {
        warn!(path = %args.image.display(), "{warning}");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut all_ok = true;
    for (done, operation) in args.operations.iter().enumerate() {
        let run = adapter.run_operation(session, &args.image, operation);
        tokio::pin!(run);
        let (record, interrupted) = tokio::select! {
            record = &mut run => (record, false),
            _ = &mut ctrl_c => {
                warn!(operation = %operation, "interrupted, cancelling in-flight operation");
                // Closing cancels the run; the run finishes before the workspace goes.
                let (record, _) = tokio::join!(&mut run, session.close());
                (record, true)
            }
        };
        all_ok &= record.success;
        super::print_json(&record)?;
        if interrupted {
            let skipped = args.operations.len().saturating_sub(done + 1);
            info!(skipped, "remaining operations not run");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

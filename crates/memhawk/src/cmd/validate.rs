use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use tracing::info;

use crate::config::AppConfig;
use crate::error::AppResult;

#[derive(Args)]
pub struct ValidateArgs {
    /// Memory image to check
    pub image: PathBuf,
}

/// Print the validation verdict for an image. Fails when it is rejected.
pub async fn run_validate(config: &AppConfig, args: ValidateArgs) -> AppResult<ExitCode> {
    let policy = config.sandbox_config()?.files;
    let result = sandbox::validate_file(&args.image, &policy).await;
    info!(
        path = %args.image.display(),
        valid = result.valid,
        risk = ?result.risk,
        "image validated"
    );
    super::print_json(&result)?;
    Ok(if result.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

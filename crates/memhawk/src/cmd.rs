mod operations;
mod run;
mod validate;

pub use operations::run_operations;
pub use run::{RunArgs, run_analysis};
pub use validate::{ValidateArgs, run_validate};

use serde::Serialize;

use crate::error::{AppError, AppResult};

/// Print one JSON document per line on stdout.
fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| AppError::Internal(format!("serialize result: {e}")))?;
    println!("{line}");
    Ok(())
}

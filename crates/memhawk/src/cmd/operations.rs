use std::io::Write as _;

use crate::catalog::{Catalog, Operation};
use crate::config::AppConfig;
use crate::error::AppResult;

/// List the catalog as an aligned table on stdout.
pub async fn run_operations(config: &AppConfig) -> AppResult<()> {
    let catalog = Catalog::load_or_builtin(config.catalog.as_deref()).await?;
    let mut stdout = std::io::stdout().lock();
    for line in render(catalog.operations()) {
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}

fn render(operations: &[Operation]) -> Vec<String> {
    let id_width = operations.iter().map(|o| o.id.len()).max().unwrap_or(0);
    let category_width = operations.iter().map(|o| o.category.len()).max().unwrap_or(0);
    operations
        .iter()
        .map(|op| {
            let mut line = format!(
                "{:id_width$}  {:category_width$}  {}",
                op.id, op.category, op.description
            );
            if let Some(requires) = &op.requires {
                line.push_str(&format!(" (requires {requires})"));
            }
            line
        })
        .collect()
}

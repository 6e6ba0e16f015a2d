//! Placeholder payloads returned in place of real tool output.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Value, json};

use crate::error::{AppError, AppResult};

const BUILTIN: &str = include_str!("../data/demo.json");

/// Supplies the output shown when an operation could not run for real.
pub trait FallbackProvider: Send + Sync {
    fn placeholder(&self, operation: &str) -> Value;
}

/// Canned per-operation sample records keyed by operation id.
#[derive(Debug, Clone, Default)]
pub struct DemoData {
    entries: HashMap<String, Value>,
}

impl DemoData {
    pub fn builtin() -> AppResult<Self> {
        Self::from_json(BUILTIN, "built-in demo data")
    }

    pub async fn load(path: &Path) -> AppResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Built-in payloads unless `path` names a replacement.
    pub async fn load_or_builtin(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Self::builtin(),
        }
    }

    pub fn from_json(content: &str, source: &str) -> AppResult<Self> {
        let entries = serde_json::from_str(content)
            .map_err(|e| AppError::Config(format!("parse {source}: {e}")))?;
        Ok(Self { entries })
    }
}

impl FallbackProvider for DemoData {
    fn placeholder(&self, operation: &str) -> Value {
        match self.entries.get(operation) {
            Some(value) => value.clone(),
            None => json!([{
                "message": format!("Demo data for {operation}"),
                "note": "This is sample data - install Volatility 3 for real analysis",
            }]),
        }
    }
}

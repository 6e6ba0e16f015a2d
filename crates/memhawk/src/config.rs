use std::path::{Path, PathBuf};

use sandbox::{FilePolicy, ResourceLimits, SandboxConfig, duration_from_secs};
use serde::Deserialize;

use crate::adapter::OutputMode;
use crate::error::{AppError, AppResult};

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxSection,
    pub tool: ToolSection,
    /// YAML operation catalog replacing the built-in one.
    pub catalog: Option<PathBuf>,
    /// JSON placeholder payloads replacing the built-in ones.
    pub demo_data: Option<PathBuf>,
}

/// Session ceilings. Durations are in (fractional) seconds.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub max_execution_time: f64,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
    pub sample_interval: f64,
    pub kill_grace: f64,
    pub max_output_bytes: usize,
    pub workspace_root: Option<PathBuf>,
    pub run_as: Option<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let defaults = SandboxConfig::default();
        Self {
            max_execution_time: defaults.resources.max_execution_time.as_secs_f64(),
            max_memory_mb: defaults.resources.max_memory_mb,
            max_cpu_percent: defaults.resources.max_cpu_percent,
            allowed_extensions: defaults.files.allowed_extensions,
            max_file_size: defaults.files.max_file_size,
            sample_interval: defaults.sample_interval.as_secs_f64(),
            kill_grace: defaults.kill_grace.as_secs_f64(),
            max_output_bytes: defaults.max_output_bytes,
            workspace_root: None,
            run_as: None,
        }
    }
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolSection {
    /// Program plus leading arguments, e.g. `[python3, /opt/volatility3/vol.py]`.
    /// Discovered on `PATH` when unset.
    pub command: Option<Vec<String>>,
    pub output: OutputMode,
}

/// Load a config from a YAML file. An empty file yields the defaults.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> AppResult<AppConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content).map_err(|e| match e {
        AppError::Config(msg) => AppError::Config(format!("parse {}: {msg}", path.display())),
        other => other,
    })?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    // Fail at load time rather than at first session open.
    config.sandbox_config()?;
    Ok(config)
}

/// Config file when one is given, defaults otherwise.
pub async fn load_or_default(path: Option<&Path>) -> AppResult<AppConfig> {
    match path {
        Some(path) => load(path).await,
        None => Ok(AppConfig::default()),
    }
}

fn parse(content: &str) -> AppResult<AppConfig> {
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml_ng::from_str(content).map_err(|e| AppError::Config(e.to_string()))
}

impl AppConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        for path in [
            self.catalog.as_mut(),
            self.demo_data.as_mut(),
            self.sandbox.workspace_root.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
    }

    /// Convert the sandbox section into validated session settings.
    pub fn sandbox_config(&self) -> AppResult<SandboxConfig> {
        let s = &self.sandbox;
        let config = SandboxConfig {
            resources: ResourceLimits {
                max_execution_time: duration_from_secs("max_execution_time", s.max_execution_time)?,
                max_memory_mb: s.max_memory_mb,
                max_cpu_percent: s.max_cpu_percent,
            },
            files: FilePolicy::new(&s.allowed_extensions, s.max_file_size),
            sample_interval: duration_from_secs("sample_interval", s.sample_interval)?,
            kill_grace: duration_from_secs("kill_grace", s.kill_grace)?,
            max_output_bytes: s.max_output_bytes,
            workspace_root: s.workspace_root.clone(),
            run_as: s.run_as.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

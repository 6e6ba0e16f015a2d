use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};

pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_MEMORY_MB: u64 = 2048;
/// One core is 100 %, so the default allows two fully busy cores.
pub const DEFAULT_MAX_CPU_PERCENT: f64 = 200.0;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 32 * 1024 * 1024 * 1024;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] =
    &["raw", "mem", "dmp", "vmem", "lime", "img", "bin", "core", "elf"];

/// Ceilings enforced on every execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_execution_time: Duration,
    pub max_memory_mb: u64,
    /// Normalized to a single core's 100 % baseline.
    pub max_cpu_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_cpu_percent: DEFAULT_MAX_CPU_PERCENT,
        }
    }
}

/// Which input files a session accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePolicy {
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
}

impl FilePolicy {
    pub fn new<I, S>(extensions: I, max_file_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            max_file_size,
        }
    }

    pub fn allows(&self, extension: &str) -> bool {
        let extension = normalize_extension(extension);
        self.allowed_extensions.iter().any(|e| *e == extension)
    }
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_EXTENSIONS.iter(), DEFAULT_MAX_FILE_SIZE)
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Settings for one sandbox session. Never mutated once the session exists.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub resources: ResourceLimits,
    pub files: FilePolicy,
    /// How often the resource monitor samples a running child.
    pub sample_interval: Duration,
    /// How long to wait for a killed subtree to disappear.
    pub kill_grace: Duration,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
    /// Parent directory for session workspaces. `None` means the system temp dir.
    pub workspace_root: Option<PathBuf>,
    /// Unprivileged user the child runs as. Only honored when the host runs as root.
    pub run_as: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            resources: ResourceLimits::default(),
            files: FilePolicy::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            workspace_root: None,
            run_as: None,
        }
    }
}

impl SandboxConfig {
    /// Reject settings no session can honor.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.resources;
        if limits.max_execution_time.is_zero() {
            return Err(invalid("max execution time must be greater than zero"));
        }
        if limits.max_memory_mb == 0 {
            return Err(invalid("max memory must be greater than zero"));
        }
        if !limits.max_cpu_percent.is_finite() || limits.max_cpu_percent <= 0.0 {
            return Err(invalid(format!(
                "max cpu percent must be a positive number, got {}",
                limits.max_cpu_percent
            )));
        }
        if self.sample_interval.is_zero() {
            return Err(invalid("sample interval must be greater than zero"));
        }
        if self.files.allowed_extensions.is_empty() {
            return Err(invalid("at least one file extension must be allowed"));
        }
        if self.files.max_file_size == 0 {
            return Err(invalid("max file size must be greater than zero"));
        }
        if self.max_output_bytes == 0 {
            return Err(invalid("max output bytes must be greater than zero"));
        }
        if let Some(user) = &self.run_as
            && user.trim().is_empty()
        {
            return Err(invalid("run_as must name a user"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SandboxError {
    SandboxError::InvalidConfig(msg.into())
}

/// Convert a seconds value from configuration into a `Duration`, rejecting
/// negative, zero and non-finite input.
pub fn duration_from_secs(label: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid(format!("{label} must be a positive number of seconds, got {secs}")));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(format!("{label}: {e}")))
}

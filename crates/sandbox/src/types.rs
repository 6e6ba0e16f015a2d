use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// A command to run inside a session's workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ExecRequest {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line for logs and result records.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.to_string_lossy());
        parts.extend(self.args.iter().map(|a| a.to_string_lossy()));
        parts.join(" ")
    }
}

/// Point-in-time resource usage of a tracked process subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub elapsed_secs: f64,
}

impl ResourceSnapshot {
    /// Component-wise maximum, used to keep the peak of a run.
    pub fn max(self, other: Self) -> Self {
        Self {
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            elapsed_secs: self.elapsed_secs.max(other.elapsed_secs),
        }
    }
}

/// Why a sandboxed execution did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecFailure {
    #[error("wall-clock ceiling exceeded: ran longer than {limit_secs:.1}s")]
    Timeout { limit_secs: f64 },

    #[error("memory ceiling exceeded: {observed_mb:.1} MB > {limit_mb} MB")]
    MemoryCeiling { limit_mb: u64, observed_mb: f64 },

    #[error("cpu ceiling exceeded: {observed_percent:.1}% > {limit_percent:.1}%")]
    CpuCeiling {
        limit_percent: f64,
        observed_percent: f64,
    },

    #[error("process exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("process terminated by signal {signal}")]
    Signaled { signal: i32 },

    #[error("tool not found: {program}")]
    ToolMissing { program: String },

    #[error("failed to launch process: {detail}")]
    LaunchFailed { detail: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("sandbox session is closed")]
    SessionClosed,

    #[error("IO error while supervising process: {detail}")]
    Io { detail: String },
}

/// The three ceilings a run is held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    WallClock,
    Memory,
    Cpu,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WallClock => f.write_str("wall-clock"),
            Self::Memory => f.write_str("memory"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl ExecFailure {
    /// The ceiling this failure reports, if it is a ceiling breach.
    pub fn ceiling(&self) -> Option<Ceiling> {
        match self {
            Self::Timeout { .. } => Some(Ceiling::WallClock),
            Self::MemoryCeiling { .. } => Some(Ceiling::Memory),
            Self::CpuCeiling { .. } => Some(Ceiling::Cpu),
            _ => None,
        }
    }
}

/// Outcome of one sandboxed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    /// `None` when the process never started or died from a signal.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
    pub peak: ResourceSnapshot,
    pub error: Option<ExecFailure>,
}

impl ExecutionResult {
    /// A run that failed before (or instead of) spawning a process.
    pub fn not_started(error: ExecFailure) -> Self {
        Self {
            success: false,
            exit_code: None,
            pid: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::ZERO,
            peak: ResourceSnapshot::default(),
            error: Some(error),
        }
    }
}

/// Whether results were produced under resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Sandboxed,
    Unsandboxed,
}

/// Result of tearing down a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    Removed,
    AlreadyGone,
    Failed(String),
}

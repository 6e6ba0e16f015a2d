use std::ffi::OsString;
use std::path::PathBuf;

use tracing::{debug, info, warn};

/// Executable names Volatility installs under, in preference order.
pub const CANDIDATES: &[&str] = &["vol", "volatility3", "vol3", "vol.py"];

/// How to invoke the forensics tool: a program plus leading arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    /// From a configured `[program, args...]` list. `None` if it is empty.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.into(),
            args: args.iter().map(OsString::from).collect(),
        })
    }

    fn from_path(path: PathBuf) -> Self {
        Self {
            program: path.into_os_string(),
            args: Vec::new(),
        }
    }
}

/// The configured command when there is one, else the first candidate found
/// on `PATH`.
pub fn discover(configured: Option<&[String]>) -> Option<ToolCommand> {
    if let Some(parts) = configured {
        match ToolCommand::from_parts(parts) {
            Some(tool) => return Some(tool),
            None => warn!("configured tool command is empty, searching PATH instead"),
        }
    }
    find_on_path(CANDIDATES)
}

fn find_on_path(candidates: &[&str]) -> Option<ToolCommand> {
    for name in candidates {
        match which::which(name) {
            Ok(path) => {
                info!(path = %path.display(), "found forensics tool");
                return Some(ToolCommand::from_path(path));
            }
            Err(e) => debug!(candidate = *name, error = %e, "tool candidate not found"),
        }
    }
    warn!("no forensics tool found on PATH");
    None
}

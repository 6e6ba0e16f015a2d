//! Native-process sandbox backend.
//!
//! A [`ProcessSandbox`] owns a private workspace directory and runs each
//! command as a child process group held to wall-clock, memory and CPU
//! ceilings by a sampling [`ResourceMonitor`].

mod command;
mod executor;
mod monitor;
mod process;
mod sandbox;
mod workspace;

pub use monitor::ResourceMonitor;
pub use sandbox::ProcessSandbox;
pub use workspace::{WORKSPACE_PREFIX, Workspace};

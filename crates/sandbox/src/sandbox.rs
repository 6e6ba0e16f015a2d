use std::path::Path;

use async_trait::async_trait;

use crate::types::{Cleanup, ExecRequest, ExecutionResult, SecurityMode};
use crate::validate::ValidationResult;

/// One isolated session: a private workspace plus the ceilings every run in
/// it is held to.
///
/// Runtime problems never surface as `Err`; they are carried in the returned
/// values. `close()` must be called on every exit path and is idempotent.
#[async_trait]
pub trait Sandbox: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;
    /// Working directory of every child spawned by this session.
    fn workspace(&self) -> &Path;
    fn security_mode(&self) -> SecurityMode {
        SecurityMode::Sandboxed
    }

    // -- operations --
    async fn validate(&self, path: &Path) -> ValidationResult;
    async fn run(&self, request: &ExecRequest) -> ExecutionResult;

    // -- lifecycle --
    /// Terminate any in-flight run, then remove the workspace.
    async fn close(&self) -> Cleanup;
}

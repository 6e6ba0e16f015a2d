use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use sandbox::{
    Cleanup, ExecFailure, ExecRequest, ExecutionResult, Sandbox, SandboxConfig, ValidationResult,
    validate_file,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::executor::{self, RunContext};
use crate::monitor;
use crate::process::{Identity, resolve_identity};
use crate::workspace::Workspace;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 2, "invalid SessionState: {v}");
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Sandbox session backed by native child processes.
///
/// Every run gets the session workspace as its working directory and is held
/// to the session's ceilings. Runs take a shared lock and `close` takes it
/// exclusively, so the workspace is only removed once no child is running.
pub struct ProcessSandbox {
    id: String,
    config: SandboxConfig,
    workspace: Workspace,
    identity: Option<Identity>,
    state: AtomicU8,
    /// Fired by `close` to stop in-flight runs.
    cancel: CancellationToken,
    runs: RwLock<()>,
}

impl ProcessSandbox {
    /// Validate `config` and create the session workspace.
    pub async fn open(config: SandboxConfig) -> sandbox::Result<Self> {
        config.validate()?;
        let identity = config.run_as.as_deref().map(resolve_identity).transpose()?;

        let id = uuid::Uuid::new_v4().to_string();
        let workspace = Workspace::open(config.workspace_root.as_deref(), &id).await?;
        if let Some(identity) = &identity {
            workspace.chown(identity)?;
        }

        info!(
            id = %id,
            workspace = %workspace.path().display(),
            run_as = identity.as_ref().map(|i| i.name.as_str()),
            timeout_secs = config.resources.max_execution_time.as_secs_f64(),
            max_memory_mb = config.resources.max_memory_mb,
            max_cpu_percent = config.resources.max_cpu_percent,
            "sandbox session opened"
        );
        Ok(Self {
            id,
            config,
            workspace,
            identity,
            state: AtomicU8::new(SessionState::Open as u8),
            cancel: CancellationToken::new(),
            runs: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn current_state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    async fn validate(&self, path: &Path) -> ValidationResult {
        validate_file(path, &self.config.files).await
    }

    async fn run(&self, request: &ExecRequest) -> ExecutionResult {
        let _running = self.runs.read().await;
        let state = self.current_state();
        if state != SessionState::Open {
            info!(id = %self.id, %state, "run rejected");
            return ExecutionResult::not_started(ExecFailure::SessionClosed);
        }
        let ctx = RunContext {
            workspace: self.workspace.path(),
            config: &self.config,
            identity: self.identity.as_ref(),
            cancel: &self.cancel,
        };
        executor::execute(request, &ctx).await
    }

    async fn close(&self) -> Cleanup {
        if self.transition(SessionState::Open, SessionState::Closing) {
            info!(id = %self.id, "closing sandbox session");
            self.cancel.cancel();
        }
        // Waits for any in-flight run to finish terminating its child.
        let _exclusive = self.runs.write().await;
        monitor::evict_workspace_residents(self.workspace.path(), self.config.kill_grace).await;
        let cleanup = self.workspace.close().await;
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        info!(id = %self.id, cleanup = ?cleanup, "sandbox session closed");
        cleanup
    }
}

//! Supervised execution of one command under wall-clock, memory and CPU
//! ceilings.

use std::io;
use std::os::unix::process::ExitStatusExt as _;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sandbox::{
    ExecFailure, ExecRequest, ExecutionResult, ResourceLimits, ResourceSnapshot, SandboxConfig,
};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command;
use crate::monitor::{self, ResourceMonitor};
use crate::process::{Identity, kill_process_group};

/// Delay between liveness checks while confirming a kill.
const CONFIRM_POLL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 64 * 1024;

/// Everything a run needs from its session.
pub(crate) struct RunContext<'a> {
    pub workspace: &'a Path,
    pub config: &'a SandboxConfig,
    pub identity: Option<&'a Identity>,
    pub cancel: &'a CancellationToken,
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Stopped(ExecFailure),
}

/// Run `request` to completion or until a ceiling is breached.
///
/// Never returns with a member of the child's subtree still known to be
/// alive, unless it survived SIGKILL for the whole kill grace (logged).
pub(crate) async fn execute(request: &ExecRequest, ctx: &RunContext<'_>) -> ExecutionResult {
    if ctx.cancel.is_cancelled() {
        return ExecutionResult::not_started(ExecFailure::Cancelled);
    }
    let config = ctx.config;
    let limits = &config.resources;
    let command_line = request.display();

    let started = Instant::now();
    let mut child = match command::build(request, ctx.workspace, ctx.identity).spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(command = %command_line, "tool not found");
            return ExecutionResult::not_started(ExecFailure::ToolMissing {
                program: request.program.to_string_lossy().into_owned(),
            });
        }
        Err(e) => {
            warn!(command = %command_line, error = %e, "failed to launch process");
            return ExecutionResult::not_started(ExecFailure::LaunchFailed {
                detail: e.to_string(),
            });
        }
    };
    let Some(pid) = child.id() else {
        return ExecutionResult::not_started(ExecFailure::LaunchFailed {
            detail: "process exited before its pid could be read".into(),
        });
    };
    info!(pid, command = %command_line, "process spawned");

    let monitor = Arc::new(Mutex::new(ResourceMonitor::new(pid)));
    let mut guard = SubtreeGuard {
        pgid: pid,
        monitor: Arc::clone(&monitor),
        armed: true,
    };
    let (stdout, stdout_task) = capture(child.stdout.take(), config.max_output_bytes);
    let (stderr, stderr_task) = capture(child.stderr.take(), config.max_output_bytes);

    let stop_sampling = CancellationToken::new();
    let (mut snapshots, sampler) = monitor::spawn_sampler(
        Arc::clone(&monitor),
        config.sample_interval,
        stop_sampling.clone(),
    );

    let mut peak = ResourceSnapshot::default();
    let mut sampling = true;
    let deadline = tokio::time::sleep(limits.max_execution_time);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            status = child.wait() => break Outcome::Exited(status),
            () = &mut deadline => {
                break Outcome::Stopped(ExecFailure::Timeout {
                    limit_secs: limits.max_execution_time.as_secs_f64(),
                });
            }
            () = ctx.cancel.cancelled() => break Outcome::Stopped(ExecFailure::Cancelled),
            changed = snapshots.changed(), if sampling => {
                if changed.is_err() {
                    // Sampler gone; the wall-clock ceiling still applies.
                    sampling = false;
                    continue;
                }
                let snapshot = *snapshots.borrow_and_update();
                peak = peak.max(snapshot);
                if let Some(failure) = check_ceilings(limits, &snapshot) {
                    break Outcome::Stopped(failure);
                }
            }
        }
    };

    let (success, exit_code, error) = match outcome {
        Outcome::Stopped(failure) => {
            warn!(pid, reason = %failure, "stopping process subtree");
            terminate(&mut child, pid, &monitor, config.kill_grace).await;
            (false, None, Some(failure))
        }
        Outcome::Exited(Err(e)) => {
            warn!(pid, error = %e, "failed to wait for process");
            terminate(&mut child, pid, &monitor, config.kill_grace).await;
            let detail = e.to_string();
            (false, None, Some(ExecFailure::Io { detail }))
        }
        Outcome::Exited(Ok(status)) => {
            reap_strays(pid, &monitor).await;
            (status.success(), status.code(), exit_failure(status))
        }
    };
    monitor::evict_workspace_residents(ctx.workspace, config.kill_grace).await;
    guard.armed = false;

    stop_sampling.cancel();
    let _ = sampler.await;
    peak = peak.max(monitor::lock(&monitor).latest());

    join_readers([stdout_task, stderr_task], config.kill_grace).await;
    let (stdout, stdout_truncated) = stdout.take();
    let (stderr, stderr_truncated) = stderr.take();

    let elapsed = started.elapsed();
    peak.elapsed_secs = elapsed.as_secs_f64();
    info!(
        pid,
        success,
        exit_code = ?exit_code,
        elapsed_ms = elapsed.as_millis() as u64,
        peak_memory_mb = peak.memory_mb,
        "process finished"
    );
    ExecutionResult {
        success,
        exit_code,
        pid: Some(pid),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed,
        peak,
        error,
    }
}

/// First ceiling the snapshot breaches, memory before CPU.
fn check_ceilings(limits: &ResourceLimits, snapshot: &ResourceSnapshot) -> Option<ExecFailure> {
    if snapshot.memory_mb > limits.max_memory_mb as f64 {
        return Some(ExecFailure::MemoryCeiling {
            limit_mb: limits.max_memory_mb,
            observed_mb: snapshot.memory_mb,
        });
    }
    if snapshot.cpu_percent > limits.max_cpu_percent {
        return Some(ExecFailure::CpuCeiling {
            limit_percent: limits.max_cpu_percent,
            observed_percent: snapshot.cpu_percent,
        });
    }
    None
}

fn exit_failure(status: ExitStatus) -> Option<ExecFailure> {
    if status.success() {
        return None;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(ExecFailure::NonZeroExit { code }),
        (None, Some(signal)) => Some(ExecFailure::Signaled { signal }),
        (None, None) => Some(ExecFailure::Io {
            detail: format!("unrecognized exit status {status}"),
        }),
    }
}

/// SIGKILL the process group and every tracked descendant, reap the child,
/// then wait (bounded by `grace`) until no member is left.
async fn terminate(
    child: &mut tokio::process::Child,
    pgid: u32,
    monitor: &Arc<Mutex<ResourceMonitor>>,
    grace: Duration,
) {
    let give_up = Instant::now() + grace;
    kill_process_group(pgid);
    let killed = with_monitor(monitor, ResourceMonitor::kill_tracked).await.unwrap_or(0);
    debug!(pgid, killed, "sent SIGKILL to subtree");

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = pgid, "child not reaped within kill grace");
    }
    loop {
        if !with_monitor(monitor, ResourceMonitor::any_alive).await.unwrap_or(false) {
            debug!(pgid, "subtree terminated");
            return;
        }
        if Instant::now() >= give_up {
            warn!(pgid, "processes still alive after kill grace");
            return;
        }
        kill_process_group(pgid);
        tokio::time::sleep(CONFIRM_POLL).await;
    }
}

/// The root exited on its own; anything it left running goes too.
async fn reap_strays(pgid: u32, monitor: &Arc<Mutex<ResourceMonitor>>) {
    kill_process_group(pgid);
    let killed = with_monitor(monitor, ResourceMonitor::kill_tracked).await.unwrap_or(0);
    if killed > 0 {
        debug!(pgid, killed, "killed leftover processes");
    }
}

async fn with_monitor<T, F>(monitor: &Arc<Mutex<ResourceMonitor>>, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&mut ResourceMonitor) -> T + Send + 'static,
{
    let monitor = Arc::clone(monitor);
    tokio::task::spawn_blocking(move || f(&mut *monitor::lock(&monitor)))
        .await
        .ok()
}

/// Kills the subtree if a run is abandoned mid-flight (its future dropped).
struct SubtreeGuard {
    pgid: u32,
    monitor: Arc<Mutex<ResourceMonitor>>,
    armed: bool,
}

impl Drop for SubtreeGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(pgid = self.pgid, "run abandoned, killing process subtree");
            kill_process_group(self.pgid);
            monitor::lock(&self.monitor).kill_tracked();
        }
    }
}

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

#[derive(Clone, Default)]
struct SharedCapture(Arc<Mutex<Capture>>);

impl SharedCapture {
    fn push(&self, chunk: &[u8], limit: usize) {
        let mut capture = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let room = limit.saturating_sub(capture.bytes.len());
        let take = room.min(chunk.len());
        capture.bytes.extend_from_slice(chunk.get(..take).unwrap_or_default());
        if take < chunk.len() {
            capture.truncated = true;
        }
    }

    fn take(&self) -> (String, bool) {
        let mut capture = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let capture = std::mem::take(&mut *capture);
        (String::from_utf8_lossy(&capture.bytes).into_owned(), capture.truncated)
    }
}

/// Drain `reader` to EOF, keeping at most `limit` bytes. Reading continues
/// past the limit so the child never blocks on a full pipe.
fn capture<R>(reader: Option<R>, limit: usize) -> (SharedCapture, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let shared = SharedCapture::default();
    let Some(mut reader) = reader else {
        return (shared, None);
    };
    let sink = shared.clone();
    let handle = tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.push(chunk.get(..n).unwrap_or_default(), limit),
                Err(e) => {
                    debug!(error = %e, "output stream read failed");
                    break;
                }
            }
        }
    });
    (shared, Some(handle))
}

/// Wait for the output readers. A stream held open by a process that
/// survived the kill would block forever, so give up after `grace`.
async fn join_readers(tasks: [Option<JoinHandle<()>>; 2], grace: Duration) {
    for task in tasks.into_iter().flatten() {
        let abort = task.abort_handle();
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!("output stream still open after kill grace, abandoning it");
            abort.abort();
        }
    }
}

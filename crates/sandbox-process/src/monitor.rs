//! Memory and CPU accounting for a child process and its descendants.
//!
//! The platform has no single call returning usage for a whole process tree,
//! so the monitor keeps an explicit set of tracked processes: the spawned
//! root plus every descendant discovered through parent links. Members are
//! remembered by `(pid, start time)` so that a grandchild reparented to init
//! stays tracked and a recycled pid is never mistaken for a member.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sandbox::ResourceSnapshot;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Set in every child's environment to the session workspace path.
pub(crate) const WORKSPACE_ENV: &str = "MEMHAWK_WORKSPACE";

/// Delay between workspace sweeps while confirming a kill.
const RESIDENT_POLL: Duration = Duration::from_millis(50);

pub struct ResourceMonitor {
    system: System,
    root: Pid,
    started: Instant,
    /// pid -> start time (seconds since epoch)
    tracked: HashMap<Pid, u64>,
    /// pid -> accumulated CPU milliseconds at the previous sample
    cpu_times: HashMap<Pid, u64>,
    last_sample_at: Option<Instant>,
    latest: ResourceSnapshot,
    exited: bool,
}

impl ResourceMonitor {
    /// Start tracking `pid`. Elapsed time is measured from this call.
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(pid),
            started: Instant::now(),
            tracked: HashMap::new(),
            cpu_times: HashMap::new(),
            last_sample_at: None,
            latest: ResourceSnapshot::default(),
            exited: false,
        }
    }

    /// Take a fresh measurement of the tracked subtree.
    ///
    /// Once the root has exited this returns the last known snapshot instead
    /// of failing. The first sample reports 0 % CPU.
    pub fn sample(&mut self) -> ResourceSnapshot {
        if self.exited {
            return self.latest;
        }
        self.refresh();
        if !self.root_alive() {
            self.exited = true;
            debug!(pid = %self.root, "tracked process exited, keeping last snapshot");
            return self.latest;
        }
        self.discover();

        let now = Instant::now();
        let processes = self.system.processes();
        let mut rss_bytes: u64 = 0;
        let mut cpu_delta_ms: u64 = 0;
        let mut cpu_times = HashMap::with_capacity(self.tracked.len());
        for pid in self.tracked.keys() {
            let Some(process) = processes.get(pid) else {
                continue;
            };
            rss_bytes = rss_bytes.saturating_add(process.memory());
            let total = process.accumulated_cpu_time();
            let previous = self.cpu_times.get(pid).copied().unwrap_or(0);
            cpu_delta_ms = cpu_delta_ms.saturating_add(total.saturating_sub(previous));
            cpu_times.insert(*pid, total);
        }

        let cpu_percent = match self.last_sample_at {
            Some(previous) => cpu_percent(cpu_delta_ms, now.duration_since(previous)),
            None => 0.0,
        };
        self.cpu_times = cpu_times;
        self.last_sample_at = Some(now);
        self.latest = ResourceSnapshot {
            memory_mb: rss_bytes as f64 / BYTES_PER_MB,
            cpu_percent,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        };
        self.latest
    }

    /// Most recent snapshot without touching `/proc`.
    pub fn latest(&self) -> ResourceSnapshot {
        self.latest
    }

    /// Pids currently believed to belong to the subtree, root first.
    pub fn tracked_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.tracked.keys().map(|p| p.as_u32()).collect();
        pids.sort_unstable_by_key(|p| (*p != self.root.as_u32(), *p));
        pids
    }

    /// SIGKILL every live member of the subtree. Returns how many were signalled.
    pub fn kill_tracked(&mut self) -> usize {
        self.refresh();
        self.seed_root();
        self.discover();
        let mut killed = 0;
        for pid in self.tracked_pids() {
            if crate::process::kill_pid(pid) {
                killed += 1;
            }
        }
        killed
    }

    /// Whether any tracked member is still running. Zombies count as gone.
    pub fn any_alive(&mut self) -> bool {
        self.refresh();
        let processes = self.system.processes();
        self.tracked.iter().any(|(pid, start)| {
            processes
                .get(pid)
                .is_some_and(|p| p.start_time() == *start && is_running(p))
        })
    }

    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_memory()
                .with_cpu()
                .without_tasks(),
        );
    }

    fn root_alive(&mut self) -> bool {
        let Some(process) = self.system.process(self.root) else {
            return false;
        };
        if !is_running(process) {
            return false;
        }
        let start = process.start_time();
        *self.tracked.entry(self.root).or_insert(start) == start
    }

    /// Track the root even if no sample was taken yet, so a breach that
    /// fires before the first sample still reaches the whole subtree.
    fn seed_root(&mut self) {
        if let Some(process) = self.system.process(self.root) {
            self.tracked.entry(self.root).or_insert(process.start_time());
        }
    }

    /// Forget members that vanished or were recycled, then adopt every
    /// process whose parent is already tracked until nothing changes.
    fn discover(&mut self) {
        let processes = self.system.processes();
        self.tracked
            .retain(|pid, start| processes.get(pid).is_some_and(|p| p.start_time() == *start));
        loop {
            let mut adopted = false;
            for (pid, process) in processes {
                if self.tracked.contains_key(pid) || is_thread(process) || !is_running(process) {
                    continue;
                }
                if process
                    .parent()
                    .is_some_and(|parent| self.tracked.contains_key(&parent))
                {
                    self.tracked.insert(*pid, process.start_time());
                    adopted = true;
                }
            }
            if !adopted {
                break;
            }
        }
    }
}

fn is_running(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Linux threads show up as entries whose parent is the owning process. Their
/// memory and CPU time are already part of that process.
fn is_thread(process: &Process) -> bool {
    process.thread_kind().is_some()
}

/// CPU time spent over wall time elapsed, where one busy core is 100 %.
fn cpu_percent(cpu_ms: u64, wall: Duration) -> f64 {
    let wall_ms = wall.as_secs_f64() * 1000.0;
    if wall_ms <= 0.0 {
        return 0.0;
    }
    cpu_ms as f64 / wall_ms * 100.0
}

/// SIGKILL every live process that still belongs to `workspace`: its cwd is
/// inside the directory, or it carries the workspace marker in its
/// environment. Catches descendants that left the process group and were
/// orphaned before the monitor saw them. Returns how many were signalled.
pub(crate) fn kill_workspace_residents(workspace: &Path) -> usize {
    let canonical = std::fs::canonicalize(workspace).ok();
    let marker = workspace_marker(workspace);
    let own = std::process::id();

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_cwd(UpdateKind::Always)
            .with_environ(UpdateKind::Always)
            .without_tasks(),
    );
    let mut killed = 0;
    for (pid, process) in system.processes() {
        if pid.as_u32() == own || is_thread(process) || !is_running(process) {
            continue;
        }
        let inside = process.cwd().is_some_and(|cwd| {
            cwd.starts_with(workspace) || canonical.as_deref().is_some_and(|c| cwd.starts_with(c))
        });
        let marked = process.environ().iter().any(|entry| *entry == marker);
        if (inside || marked) && crate::process::kill_pid(pid.as_u32()) {
            debug!(pid = %pid, "killed process left in workspace");
            killed += 1;
        }
    }
    killed
}

/// `MEMHAWK_WORKSPACE=<path>` as it appears in a child's environment.
pub(crate) fn workspace_marker(workspace: &Path) -> OsString {
    let mut marker = OsString::from(format!("{WORKSPACE_ENV}="));
    marker.push(workspace.as_os_str());
    marker
}

/// Sweep `workspace` until no resident is left or `grace` runs out.
pub(crate) async fn evict_workspace_residents(workspace: &Path, grace: Duration) {
    let give_up = Instant::now() + grace;
    loop {
        let path = workspace.to_path_buf();
        let killed = tokio::task::spawn_blocking(move || kill_workspace_residents(&path))
            .await
            .unwrap_or(0);
        if killed == 0 {
            return;
        }
        warn!(workspace = %workspace.display(), killed, "killed processes that escaped the process group");
        if Instant::now() >= give_up {
            warn!(workspace = %workspace.display(), "workspace residents still alive after kill grace");
            return;
        }
        tokio::time::sleep(RESIDENT_POLL).await;
    }
}

pub(crate) fn lock(monitor: &Mutex<ResourceMonitor>) -> MutexGuard<'_, ResourceMonitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sample `monitor` every `interval` on an independent task, publishing each
/// snapshot on the returned channel until `stop` fires or the receiver goes
/// away. The first sample is taken immediately.
pub(crate) fn spawn_sampler(
    monitor: Arc<Mutex<ResourceMonitor>>,
    interval: Duration,
    stop: CancellationToken,
) -> (watch::Receiver<ResourceSnapshot>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ResourceSnapshot::default());
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let monitor = Arc::clone(&monitor);
            let snapshot = match tokio::task::spawn_blocking(move || lock(&monitor).sample()).await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "resource sampling task failed");
                    break;
                }
            };
            if tx.send(snapshot).is_err() {
                break;
            }
        }
    });
    (rx, handle)
}

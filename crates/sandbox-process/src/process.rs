use nix::sys::signal::{self, Signal};
use nix::unistd::{Gid, Pid, Uid, User};
use sandbox::SandboxError;

/// Unprivileged account a child is started as.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

/// Look up `name` for privilege dropping. Only meaningful when we are root;
/// anyone else cannot switch users, so asking for it is a configuration error.
pub(crate) fn resolve_identity(name: &str) -> sandbox::Result<Identity> {
    if !nix::unistd::geteuid().is_root() {
        return Err(SandboxError::InvalidConfig(format!(
            "run_as {name:?} requires the sandbox host to run as root"
        )));
    }
    let user = User::from_name(name)
        .map_err(|e| SandboxError::InvalidConfig(format!("lookup user {name:?}: {e}")))?
        .ok_or_else(|| SandboxError::InvalidConfig(format!("no such user {name:?}")))?;
    Ok(Identity {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
    })
}

/// Kill the entire process group led by `pgid` via `killpg(SIGKILL)`.
///
/// Requires the leader to have been spawned with `process_group(0)` so that
/// its PGID equals its PID. No-op if the group is already gone or the id
/// cannot be represented as `i32`.
pub(crate) fn kill_process_group(pgid: u32) {
    if let Ok(pgid) = i32::try_from(pgid) {
        let _ = signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    }
}

/// Send SIGKILL to a single process. Returns `false` if it no longer exists.
pub(crate) fn kill_pid(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok()
}

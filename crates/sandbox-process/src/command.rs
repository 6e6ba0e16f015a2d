use std::path::Path;
use std::process::Stdio;

use sandbox::ExecRequest;
use tokio::process::Command;

use crate::monitor::WORKSPACE_ENV;
use crate::process::Identity;

/// Host variables a child may see. Everything else is scrubbed.
const ENV_PASSTHROUGH: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ"];

/// Build the child command for `request`.
///
/// The child runs in `workspace`, in its own process group (so the whole
/// subtree can be signalled at once), with a scrubbed environment, no stdin,
/// and piped stdout/stderr. With an `identity` it drops to that uid/gid.
/// [`WORKSPACE_ENV`] lets a later sweep find descendants that left the group.
pub(crate) fn build(request: &ExecRequest, workspace: &Path, identity: Option<&Identity>) -> Command {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(workspace)
        .env_clear()
        .env("HOME", workspace)
        .env("TMPDIR", workspace)
        .env(WORKSPACE_ENV, workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    for key in ENV_PASSTHROUGH {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }

    if let Some(identity) = identity {
        cmd.uid(identity.uid.as_raw()).gid(identity.gid.as_raw());
    }
    cmd
}

//! The install subroutine (spec.md §4.4 "Install"): a one-shot ssh session that uploads the
//! agent binary to a versioned path on the remote, generalizing `slarti_ssh::deploy_agent`'s
//! rsync-then-scp-fallback shape from `.local/share/slarti/agent/<version>/` to
//! `.local/share/waveshell/agent/<version>/`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command as TokioCommand;
use tracing::debug;

use crate::error::ProcError;
use crate::remote::Remote;

const AGENT_BIN_NAME: &str = "waveshell-agent";

async fn ssh_run_capture(
    target: &str,
    script: &str,
    dur: Duration,
) -> Result<(std::process::ExitStatus, String, String), ProcError> {
    let connect_timeout = format!("ConnectTimeout={}", dur.as_secs());
    let out = TokioCommand::new("ssh")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg("-o")
        .arg(&connect_timeout)
        .arg("-T")
        .arg(target)
        .arg("--")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    Ok((out.status, stdout, stderr))
}

/// Result of an install attempt (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub remote_path: String,
    pub used_rsync: bool,
}

/// Determine whether the ssh user on `target` is root, used to pick the install directory.
async fn remote_user_is_root(target: &str, dur: Duration) -> bool {
    ssh_run_capture(target, "id -u", dur)
        .await
        .map(|(_, stdout, _)| stdout.trim() == "0")
        .unwrap_or(false)
}

/// Install `local_artifact` (the core's own `waveshell-agent` binary) onto the remote
/// described by `remote`, at a path keyed by `version`. Local remotes are installed by a
/// plain filesystem copy instead of ssh/rsync.
pub async fn install_agent(
    remote: &Remote,
    local_artifact: &Path,
    version: &str,
    timeout: Duration,
) -> Result<InstallResult, ProcError> {
    match remote.ssh_target() {
        None => install_local(local_artifact, version).await,
        Some(target) => install_remote(&target, local_artifact, version, timeout).await,
    }
}

async fn install_local(local_artifact: &Path, version: &str) -> Result<InstallResult, ProcError> {
    let base = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base
        .join(".local/share/waveshell/agent")
        .join(version);
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(AGENT_BIN_NAME);
    tokio::fs::copy(local_artifact, &dest).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&dest).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&dest, perms).await?;
    }
    Ok(InstallResult {
        remote_path: dest.to_string_lossy().into_owned(),
        used_rsync: false,
    })
}

async fn install_remote(
    target: &str,
    local_artifact: &Path,
    version: &str,
    timeout: Duration,
) -> Result<InstallResult, ProcError> {
    let is_root = remote_user_is_root(target, timeout).await;
    let (remote_dir_abs, remote_dir_rsync_dst, remote_path) = if is_root {
        let dir = format!("/usr/local/lib/waveshell/agent/{version}");
        (dir.clone(), dir.clone(), format!("{dir}/{AGENT_BIN_NAME}"))
    } else {
        let rel = format!(".local/share/waveshell/agent/{version}");
        (
            format!("$HOME/{rel}"),
            rel.clone(),
            format!("$HOME/{rel}/{AGENT_BIN_NAME}"),
        )
    };

    debug!(target: "waveshell_proc", "install: target={target} dir={remote_dir_abs}");

    let mkdir_script = format!("mkdir -p {remote_dir_abs}");
    let (status, _out, err) = ssh_run_capture(target, &mkdir_script, timeout).await?;
    if !status.success() {
        return Err(ProcError::InstallFailed(format!(
            "remote mkdir failed on {target}: {err}"
        )));
    }

    let rsync_dst = format!("{target}:{remote_dir_rsync_dst}");
    let rsync_status = TokioCommand::new("rsync")
        .arg("-az")
        .arg("--chmod=755")
        .arg(local_artifact.as_os_str())
        .arg(&rsync_dst)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    let mut used_rsync = false;
    let mut uploaded = false;
    if let Ok(status) = rsync_status {
        if status.success() {
            used_rsync = true;
            uploaded = true;
        }
    }

    if !uploaded {
        let scp_dst = format!("{target}:{remote_dir_rsync_dst}/{AGENT_BIN_NAME}");
        let scp_status = TokioCommand::new("scp")
            .arg(local_artifact.as_os_str())
            .arg(&scp_dst)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        uploaded = scp_status.success();
    }

    if !uploaded {
        return Err(ProcError::InstallFailed(format!(
            "failed to upload agent (rsync/scp) to {target}"
        )));
    }

    if !used_rsync {
        let chmod_script = format!("chmod 755 -- {remote_path}");
        let (status, _out, err) = ssh_run_capture(target, &chmod_script, timeout).await?;
        if !status.success() {
            return Err(ProcError::InstallFailed(format!(
                "remote chmod failed on {target}: {err}"
            )));
        }
    }

    Ok(InstallResult {
        remote_path,
        used_rsync,
    })
}

/// The remote-side bootstrap one-liner (spec.md §4.1/§4.4/§6): check for `waveshell-agent`
/// at `remote_path`, exec it as `--server` if present, else print an `init{notfound:true}`
/// packet for the core's handshake loop to parse.
pub fn bootstrap_probe_script(remote_path: &str) -> String {
    format!(
        "if [ -x {remote_path} ]; then exec {remote_path} --server; \
         else echo '##N{{\"type\":\"init\",\"notfound\":true}}'; fi"
    )
}

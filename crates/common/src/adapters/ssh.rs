//! Drives `autossh`-based point-to-point tunnel connections.
//!
//! Unlike IPsec/WireGuard, an SSH connection has no kernel control plane of
//! its own: the tunnel device is created by `sshd`/`ssh` as a side effect of
//! the `-w local:remote` tunnel option, so this adapter's job is purely
//! process supervision plus the remote-side bootstrap command the original
//! pastes over the same SSH session.

use std::path::PathBuf;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::model::SshConfig;

fn socket_dir() -> PathBuf {
    PathBuf::from("/run/vpncd/ssh")
}

pub struct SshTunnel {
    pub connection_name: String,
    child: Child,
}

/// Starts (or restarts) the `autossh` master for one SSH connection.
/// `ni_id`/`conn_id` name the tunnel device and the control socket so
/// repeat calls for the same connection are idempotent from the caller's
/// point of view (the caller is responsible for calling [`stop`] on the
/// previous tunnel first if its config changed).
pub async fn start(netns: &str, ni_id: &str, conn_id: u8, cfg: &SshConfig) -> Result<SshTunnel> {
    std::fs::create_dir_all(socket_dir())?;
    let connection_name = format!("{ni_id}-{conn_id}");
    let socket_path = socket_dir().join(format!("{connection_name}.sock"));

    let Some(remote_addr) = cfg.remote_addresses.first() else {
        return Err(Error::InvalidArgument(format!(
            "ssh connection {connection_name} has no remote address"
        )));
    };

    let child = Command::new("ip")
        .args(["netns", "exec", netns, "autossh"])
        .args(["-f", "-M", "0"])
        .arg("-o")
        .arg("ControlMaster=yes")
        .arg("-o")
        .arg(format!("ControlPath={}", socket_path.display()))
        .arg("-o")
        .arg("Tunnel=point-to-point")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-o")
        .arg("ConnectTimeout=10")
        .arg("-o")
        .arg("ServerAliveInterval=5")
        .arg("-o")
        .arg("ServerAliveCountMax=5")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg("-w")
        .arg(format!("{}:{}", cfg.local_tunnel_id, cfg.remote_tunnel_id))
        .arg(format!("{}@{remote_addr}", cfg.username))
        .env("AUTOSSH_PIDFILE", socket_dir().join(format!("{connection_name}-master.pid")))
        .env("AUTOSSH_POLL", "60")
        .env("AUTOSSH_GATETIME", "0")
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| Error::Command {
            cmd: "autossh".to_string(),
            detail: e.to_string(),
        })?;

    Ok(SshTunnel {
        connection_name,
        child,
    })
}

pub async fn stop(mut tunnel: SshTunnel) -> Result<()> {
    let _ = tunnel.child.start_kill();
    let _ = tunnel.child.wait().await;
    let _ = std::fs::remove_file(socket_dir().join(format!("{}.sock", tunnel.connection_name)));
    Ok(())
}

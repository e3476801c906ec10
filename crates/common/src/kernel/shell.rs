use std::process::Command;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kernel::ops::{RouteKind, RouteOp};

/// Runs an external command, mapping a non-zero exit to `Error::Command`.
/// Public so adapters outside the `kernel` module (swanctl, FRR, Jool) can
/// shell out the same way the original's services do.
pub fn run_checked(cmd: &str, args: &[&str]) -> Result<()> {
    run(cmd, args)
}

fn run(cmd: &str, args: &[&str]) -> Result<()> {
    debug!(cmd, ?args, "running");
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| Error::Command {
            cmd: cmd.to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Command {
            cmd: format!("{cmd} {}", args.join(" ")),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Enables IPv4/IPv6 forwarding inside the calling thread's current
/// namespace. Has no netlink equivalent; the original shells out to
/// `sysctl -w` for the exact same reason.
pub fn set_forwarding(enabled: bool) -> Result<()> {
    let v = if enabled { "1" } else { "0" };
    run("sysctl", &["-w", &format!("net.ipv4.conf.all.forwarding={v}")])?;
    run("sysctl", &["-w", &format!("net.ipv6.conf.all.forwarding={v}")])?;
    Ok(())
}

/// Applies a rendered nftables ruleset (atomically replaces the named
/// table). Kept as a CLI call rather than talking to the nftables netlink
/// family directly, matching the original's use of `nft -f`.
pub fn nft_apply(ruleset: &str) -> Result<()> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(ruleset.as_bytes())?;
    run("nft", &["-f", file.path().to_str().unwrap_or_default()])
}

/// Replaces or deletes a route via the `ip` CLI. Delete and blackhole
/// installation have no ergonomic `rtnetlink` builder equivalent (blackhole
/// needs `RTN_BLACKHOLE` on the raw message, delete needs an exact nexthop
/// match), so both go through `ip route` the same way `nft_apply` shells
/// out instead of driving the nftables netlink family directly.
pub fn route(
    op: RouteOp,
    dst: IpNetwork,
    via: Option<std::net::IpAddr>,
    ifname: Option<&str>,
    kind: RouteKind,
) -> Result<()> {
    let family = match dst {
        IpNetwork::V4(_) => "-4",
        IpNetwork::V6(_) => "-6",
    };
    let verb = match op {
        RouteOp::Replace => "replace",
        RouteOp::Delete => "del",
    };
    let dst_s = dst.to_string();
    let via_s = via.map(|v| v.to_string());

    let mut args: Vec<&str> = vec![family, "route", verb];
    if kind == RouteKind::Blackhole {
        args.push("blackhole");
    }
    args.push(&dst_s);
    if let Some(via_s) = &via_s {
        args.push("via");
        args.push(via_s);
    }
    if let Some(ifname) = ifname {
        args.push("dev");
        args.push(ifname);
    }
    run("ip", &args)
}

/// Flushes every address from `name`. No `rtnetlink` dump/flush helper is
/// used here since `replace_address` is the only caller and only ever
/// needs a clean slate before reassigning, not incremental bookkeeping.
pub fn flush_addresses(name: &str) -> Result<()> {
    run("ip", &["addr", "flush", "dev", name])
}

/// Whether `name` currently carries the `UP` flag, used by the route/SA
/// monitor's sweeper to decide when a connection's interface has gone
/// down under it. Parsed from `ip link show` text rather than the raw
/// netlink flag bitmask — good enough for a periodic poll and one fewer
/// place depending on the exact `netlink-packet-route` flag encoding.
pub fn link_is_up(name: &str) -> Result<bool> {
    let output = Command::new("ip")
        .args(["-o", "link", "show", "dev", name])
        .output()
        .map_err(|e| Error::Command {
            cmd: "ip".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Ok(false);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let flags = text.split_once('<').and_then(|(_, rest)| rest.split_once('>')).map(|(f, _)| f);
    Ok(flags.is_some_and(|f| f.split(',').any(|flag| flag == "UP")))
}

//! Drives the Jool NAT64 kernel module inside a network instance's
//! namespace. Jool has no netlink control plane, only its `jool` CLI, so
//! this stays a shell-out like the original.

use ipnetwork::Ipv6Network;

use crate::error::Result;
use crate::kernel::shell;

/// Flushes any existing instance and (re)adds one bound to `nat64_scope`.
/// Idempotent: flushing first means repeat reconciliation passes converge
/// on the same state instead of erroring on "instance already exists".
pub fn sync_instance(netns: &str, ni_id: &str, nat64_scope: Ipv6Network) -> Result<()> {
    shell::run_checked("ip", &["netns", "exec", netns, "jool", "instance", "flush"])?;
    shell::run_checked(
        "ip",
        &[
            "netns",
            "exec",
            netns,
            "jool",
            "instance",
            "add",
            ni_id,
            "--netfilter",
            "--pool6",
            &nat64_scope.to_string(),
        ],
    )
}

pub fn flush(netns: &str) -> Result<()> {
    shell::run_checked("ip", &["netns", "exec", netns, "jool", "instance", "flush"])
}

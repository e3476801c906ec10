//! Renders `frr.conf` for the CORE network instance's BGP speaker and
//! reloads FRR through its reload script (§4.2).

use std::fmt::Write as _;
use std::path::Path;

use ipnetwork::Ipv6Network;

use crate::error::Result;
use crate::kernel::shell;
use crate::model::ServiceConfig;

/// Renders `frr.conf` from the service's BGP globals/neighbors plus the set
/// of IPv6 prefixes currently advertised across every hub-mode downlink
/// (the NPTv6 prefix for `nptv6: true` routes, the route itself otherwise —
/// callers derive `advertised` the same way the route monitor computes a
/// connection's advertised prefix in §4.6).
pub fn render(core_ni: &str, service: &ServiceConfig, advertised: &[Ipv6Network]) -> String {
    let globals = &service.bgp.globals;
    let mut out = String::new();
    writeln!(out, "frr version 8.0").unwrap();
    writeln!(out, "frr defaults traditional").unwrap();
    writeln!(out, "hostname {core_ni}").unwrap();
    writeln!(out, "no ipv6 forwarding").unwrap();
    writeln!(out, "!").unwrap();
    writeln!(out, "router bgp {}", globals.asn).unwrap();
    writeln!(out, " bgp router-id {}", globals.router_id).unwrap();
    writeln!(out, " no bgp ebgp-requires-policy").unwrap();
    if globals.bfd {
        writeln!(out, " bfd").unwrap();
    }
    let mut neighbors = service.bgp.neighbors.clone();
    neighbors.sort_by_key(|n| n.priority);
    for neighbor in &neighbors {
        writeln!(out, " neighbor {} remote-as {}", neighbor.address, neighbor.asn).unwrap();
        if globals.bfd {
            writeln!(out, " neighbor {} bfd", neighbor.address).unwrap();
        }
    }
    writeln!(out, " address-family ipv6 unicast").unwrap();
    for prefix in advertised {
        writeln!(out, "  network {prefix}").unwrap();
    }
    for neighbor in &neighbors {
        writeln!(out, "  neighbor {} activate", neighbor.address).unwrap();
    }
    writeln!(out, " exit-address-family").unwrap();
    writeln!(out, "!").unwrap();
    out
}

/// Starts FRR inside CORE's namespace via its init script, the same
/// install layout `frr-reload.py` assumes (§4.8 "start FRR").
pub fn start(core_netns: &str) -> Result<()> {
    shell::run_checked(
        "ip",
        &["netns", "exec", core_netns, "/usr/lib/frr/frrinit.sh", "start"],
    )
}

/// Best-effort: shutdown should not fail teardown if FRR already exited.
pub fn stop(core_netns: &str) -> Result<()> {
    let _ = shell::run_checked(
        "ip",
        &["netns", "exec", core_netns, "/usr/lib/frr/frrinit.sh", "stop"],
    );
    Ok(())
}

pub fn write_and_reload(path: &Path, rendered: &str) -> Result<()> {
    std::fs::write(path, rendered)?;
    reload(path)
}

/// `frr-reload.py` diffs the running config against the file and applies
/// only the delta, so this can be called on every reconciliation pass
/// without flapping BGP sessions that didn't change.
fn reload(path: &Path) -> Result<()> {
    shell::run_checked(
        "/usr/lib/frr/frr-reload.py",
        &[path.to_str().unwrap_or_default(), "--reload", "--stdout"],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BgpConfig, BgpGlobals, BgpNeighbor, Mode};

    fn service() -> ServiceConfig {
        ServiceConfig {
            mode: Mode::Hub,
            local_id: "%any".to_string(),
            bgp: BgpConfig {
                globals: BgpGlobals {
                    asn: 65000,
                    router_id: "198.51.100.1".parse().unwrap(),
                    bfd: true,
                },
                neighbors: vec![BgpNeighbor {
                    asn: 65001,
                    address: "2001:db8::1".parse().unwrap(),
                    priority: 0,
                }],
            },
            prefix_downlink_interface_v4: vec!["100.64.0.0/10".parse().unwrap()],
            prefix_downlink_interface_v6: vec!["fdcc:cbe::/32".parse().unwrap()],
            prefix_downlink_nat64: vec!["64:ff9b::/32".parse().unwrap()],
            prefix_downlink_nptv6: vec!["660::/12".parse().unwrap()],
            mgmt_address: None,
        }
    }

    #[test]
    fn renders_bfd_and_neighbor() {
        let advertised = vec!["660:0:c:1:0::/48".parse().unwrap()];
        let rendered = render("CORE", &service(), &advertised);
        assert!(rendered.contains("router bgp 65000"));
        assert!(rendered.contains("bgp router-id 198.51.100.1"));
        assert!(rendered.contains("neighbor 2001:db8::1 remote-as 65001"));
        assert!(rendered.contains("neighbor 2001:db8::1 bfd"));
        assert!(rendered.contains("network 660:0:c:1:0::/48"));
    }
}

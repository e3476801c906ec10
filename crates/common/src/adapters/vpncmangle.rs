//! Generates the DNS64/NPTv6-mangling config consumed by the `vpncmangle`
//! sidecar and supervises its process inside the CORE network instance.
//!
//! `vpncmangle` rewrites DNS responses crossing a downlink's NAT64/NPTv6
//! boundary (A→AAAA for NAT64, prefix rewrite for NPTv6) so resolvers on
//! either side never need to know translation is happening.

use std::collections::BTreeMap;
use std::path::Path;

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::Serialize;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::model::{NetworkInstance, RouteV6};

#[derive(Debug, Clone, Serialize, Default)]
pub struct NiTranslations {
    /// `(nat64_scope, "0.0.0.0/0")` pairs; empty unless this instance has a
    /// NAT64 scope assigned.
    pub dns64: Vec<(Ipv6Network, Ipv4Network)>,
    /// `(nptv6_prefix, route.to)` pairs, one per NPT-translated IPv6 route.
    pub dns66: Vec<(Ipv6Network, Ipv6Network)>,
}

/// Builds the full `translations.json` payload across every tenant's
/// non-CORE/EXTERNAL network instances.
pub fn build_config<'a>(
    instances: impl Iterator<Item = (&'a str, &'a NetworkInstance, Option<Ipv6Network>)>,
) -> BTreeMap<String, NiTranslations> {
    let mut out = BTreeMap::new();
    for (id, ni, nat64_scope) in instances {
        let mut entry = NiTranslations::default();
        if let Some(scope) = nat64_scope {
            entry
                .dns64
                .push((scope, "0.0.0.0/0".parse().expect("valid default")));
        }
        for conn in ni.connections.values() {
            for route in &conn.routes.ipv6 {
                if !route.nptv6 {
                    continue;
                }
                entry.dns66.push(dns66_pair(route));
            }
        }
        out.insert(id.to_string(), entry);
    }
    out
}

fn dns66_pair(route: &RouteV6) -> (Ipv6Network, Ipv6Network) {
    let nptv6_prefix = route.nptv6_prefix.unwrap_or(route.to);
    (nptv6_prefix, route.to)
}

pub fn write_config(path: &Path, config: &BTreeMap<String, NiTranslations>) -> Result<()> {
    let json = serde_json::to_string(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Supervises the `vpncmangle` child process. Held by the daemon for the
/// lifetime of the CORE network instance; dropping it does not kill the
/// child (the original relies on `atexit` for that) — callers must call
/// [`stop`] explicitly during shutdown.
pub struct Supervisor {
    child: Child,
}

pub async fn start(install_dir: &Path, core_netns: &str) -> Result<Supervisor> {
    let binary = install_dir.join("bin/vpncmangle");
    let child = Command::new("ip")
        .args(["netns", "exec", core_netns, binary.to_str().unwrap_or_default()])
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| Error::Command {
            cmd: "vpncmangle".to_string(),
            detail: e.to_string(),
        })?;
    Ok(Supervisor { child })
}

pub async fn stop(mut supervisor: Supervisor) -> Result<()> {
    supervisor
        .child
        .start_kill()
        .map_err(|e| Error::Command {
            cmd: "vpncmangle".to_string(),
            detail: e.to_string(),
        })?;
    let _ = supervisor.child.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns66_falls_back_to_route_prefix_when_unset() {
        let route = RouteV6 {
            to: "2001:db8:1::/64".parse().unwrap(),
            via: None,
            nptv6: true,
            nptv6_prefix: None,
        };
        let (prefix, to) = dns66_pair(&route);
        assert_eq!(prefix, to);
    }

    #[test]
    fn build_config_skips_non_nptv6_routes() {
        use crate::model::{Connection, ConnectionConfig, NetworkInstanceType, PhysicalConfig, Routes};

        let mut ni = NetworkInstance {
            id: "c0001-00".to_string(),
            kind: NetworkInstanceType::Downlink,
            connections: Default::default(),
            nat64: false,
            outbound_nat: false,
        };
        ni.connections.insert(
            0,
            Connection {
                id: 0,
                metadata: serde_yaml::Value::Null,
                description: String::new(),
                interface: None,
                routes: Routes {
                    ipv4: vec![],
                    ipv6: vec![RouteV6 {
                        to: "2001:db8:1::/64".parse().unwrap(),
                        via: None,
                        nptv6: false,
                        nptv6_prefix: None,
                    }],
                },
                config: ConnectionConfig::Physical(PhysicalConfig {
                    interface: "eth1".to_string(),
                }),
            },
        );

        let config = build_config(std::iter::once(("c0001-00", &ni, None)));
        assert!(config["c0001-00"].dns66.is_empty());
    }
}

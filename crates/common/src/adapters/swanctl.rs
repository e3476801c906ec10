//! Renders `swanctl.conf` fragments for a network instance's IPsec
//! connections and reloads strongSwan.
//!
//! The original renders these through Jinja2; this hand-builds the config
//! text instead (no templating engine in the dependency stack), the same
//! way `qemu.rs` builds its `qemu-system-*` argument list by hand rather
//! than templating it.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::ids::VpnId;
use crate::kernel::shell;
use crate::model::{Connection, ConnectionConfig, NetworkInstance};

pub struct SwanctlConfig {
    pub path: PathBuf,
    pub contents: String,
}

/// Renders the `<ni_id>.conf` swanctl fragment for every IPsec connection
/// in `ni`. Returns `None` if the instance has no IPsec connections, so the
/// caller can remove a stale file instead of writing an empty one.
pub fn render(config_dir: &Path, local_id: &str, ni: &NetworkInstance) -> Option<SwanctlConfig> {
    let mut out = String::new();
    let mut any = false;

    for (idx, conn) in &ni.connections {
        let ConnectionConfig::Ipsec(ipsec) = &conn.config else {
            continue;
        };
        any = true;
        let vpn_id = VpnId::for_network_instance(&ni.id, *idx);
        let conn_name = format!("{}-{}", ni.id, idx);

        writeln!(out, "connections.{conn_name} {{").unwrap();
        writeln!(out, "    local_addrs = {}", ipsec.local_addr).unwrap();
        writeln!(out, "    remote_addrs = {}", ipsec.remote_addr).unwrap();
        writeln!(out, "    if_id_in = {:#x}", vpn_id.0).unwrap();
        writeln!(out, "    if_id_out = {:#x}", vpn_id.0).unwrap();
        writeln!(out, "    version = {}", ipsec.ike_version).unwrap();
        writeln!(out, "    proposals = {}", ipsec.ike_proposals.join(",")).unwrap();
        writeln!(out, "    rekey_time = {}", ipsec.ike_lifetime).unwrap();
        writeln!(out, "    local {{").unwrap();
        writeln!(out, "        auth = psk").unwrap();
        writeln!(out, "        id = {local_id}").unwrap();
        writeln!(out, "    }}").unwrap();
        writeln!(out, "    remote {{").unwrap();
        writeln!(out, "        auth = psk").unwrap();
        writeln!(out, "        id = {}", ipsec.remote_id).unwrap();
        writeln!(out, "    }}").unwrap();
        writeln!(out, "    children.{conn_name} {{").unwrap();
        writeln!(out, "        mode = tunnel").unwrap();
        writeln!(out, "        proposals = {}", ipsec.ipsec_proposals.join(",")).unwrap();
        writeln!(out, "        rekey_time = {}", ipsec.ipsec_lifetime).unwrap();
        writeln!(out, "        start_action = {}", match ipsec.initiation {
            crate::model::IpsecInitiation::Start => "start",
            crate::model::IpsecInitiation::None => "none",
        }).unwrap();
        // §6 swanctl contract: an empty selector set defaults to
        // `0.0.0.0/0,::/0`, not an omitted field.
        let local_ts = if ipsec.local_ts.is_empty() {
            "0.0.0.0/0,::/0".to_string()
        } else {
            ipsec.local_ts.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
        };
        writeln!(out, "        local_ts = {local_ts}").unwrap();
        let remote_ts = if ipsec.remote_ts.is_empty() {
            "0.0.0.0/0,::/0".to_string()
        } else {
            ipsec.remote_ts.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
        };
        writeln!(out, "        remote_ts = {remote_ts}").unwrap();
        writeln!(out, "    }}").unwrap();
        writeln!(out, "}}").unwrap();
        writeln!(out).unwrap();
        writeln!(out, "secrets.ike-{conn_name} {{").unwrap();
        writeln!(out, "    id-{conn_name} = {}", ipsec.remote_id).unwrap();
        writeln!(out, "    secret = \"{}\"", ipsec.psk).unwrap();
        writeln!(out, "}}").unwrap();
        writeln!(out).unwrap();
    }

    if !any {
        return None;
    }

    Some(SwanctlConfig {
        path: config_dir.join(format!("{}.conf", ni.id)),
        contents: out,
    })
}

/// Reloads every swanctl config file. VICI has no "reload from directory"
/// call, so the original shells out to `swanctl --load-all` rather than
/// pushing each connection over the session — preserved here unchanged.
pub fn load_all() -> Result<()> {
    shell::run_checked("swanctl", &["--load-all", "--clear"])
}

pub fn start(external_netns: &str) -> Result<()> {
    shell::run_checked("ip", &["netns", "exec", external_netns, "ipsec", "start"])
}

pub fn stop(external_netns: &str) -> Result<()> {
    // Best-effort: shutting down should not fail teardown if IPsec is
    // already stopped.
    let _ = shell::run_checked("ip", &["netns", "exec", external_netns, "ipsec", "stop"]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{IpsecConfig, IpsecInitiation, NetworkInstanceType};

    fn ni_with_empty_ts() -> NetworkInstance {
        let mut connections = BTreeMap::new();
        connections.insert(
            0,
            Connection {
                id: 0,
                metadata: serde_yaml::Value::Null,
                description: String::new(),
                interface: None,
                routes: Default::default(),
                config: ConnectionConfig::Ipsec(IpsecConfig {
                    local_addr: "198.51.100.1".parse().unwrap(),
                    remote_addr: "203.0.113.1".parse().unwrap(),
                    remote_id: "peer".to_string(),
                    ike_version: 2,
                    ike_proposals: vec!["aes256-sha256-modp2048".to_string()],
                    ike_lifetime: 10800,
                    ipsec_proposals: vec!["aes256-sha256".to_string()],
                    ipsec_lifetime: 3600,
                    initiation: IpsecInitiation::Start,
                    psk: "secret".to_string(),
                    local_ts: vec![],
                    remote_ts: vec![],
                }),
            },
        );
        NetworkInstance {
            id: "c0001-00".to_string(),
            kind: NetworkInstanceType::Downlink,
            connections,
            nat64: false,
            outbound_nat: false,
        }
    }

    #[test]
    fn empty_traffic_selectors_default_to_any_any() {
        let ni = ni_with_empty_ts();
        let rendered = render(Path::new("/etc/swanctl/conf.d"), "%any", &ni).unwrap();
        assert!(rendered.contents.contains("local_ts = 0.0.0.0/0,::/0"));
        assert!(rendered.contents.contains("remote_ts = 0.0.0.0/0,::/0"));
    }
}

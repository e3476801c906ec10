use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Operating mode: a hub concentrator (`HUB`) terminates downlink tenants
/// and runs NAT64/NPTv6 translation plus BGP; an endpoint (`ENDPOINT`) is a
/// single-site mode with neither (§1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Hub,
    Endpoint,
}

/// The BGP speaker's own identity: its ASN, router-id, and whether
/// sessions are BFD-monitored (§3 `bgp.globals`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpGlobals {
    pub asn: u32,
    pub router_id: IpAddr,
    #[serde(default)]
    pub bfd: bool,
}

/// One configured BGP neighbor. `priority` is the tie-break the original
/// uses when more than one neighbor could carry the same prefix (lower
/// wins), bounded 0-9 the same way connection ids are (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpNeighbor {
    pub asn: u32,
    pub address: IpAddr,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpConfig {
    pub globals: BgpGlobals,
    #[serde(default)]
    pub neighbors: Vec<BgpNeighbor>,
}

fn default_prefix_downlink_interface_v4() -> Vec<ipnetwork::Ipv4Network> {
    vec!["100.64.0.0/10".parse().expect("valid")]
}

fn default_prefix_downlink_interface_v6() -> Vec<ipnetwork::Ipv6Network> {
    vec!["fdcc:cbe::/32".parse().expect("valid")]
}

fn default_prefix_downlink_nat64() -> Vec<ipnetwork::Ipv6Network> {
    vec!["64:ff9b::/32".parse().expect("valid")]
}

fn default_prefix_downlink_nptv6() -> Vec<ipnetwork::Ipv6Network> {
    vec!["660::/12".parse().expect("valid")]
}

/// The daemon-wide service config: the `DEFAULT` tenant's body in hub mode
/// (§3 `ServiceConfig`). Endpoint mode only needs `mode` and `local_id`; the
/// four scope prefixes and `bgp` are ignored outside hub mode but still
/// required to parse so an operator flipping modes keeps one file shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub mode: Mode,
    /// IKE local identity advertised to peers with no tenant-specific
    /// override. Defaults to `%any`, matching strongSwan's own default.
    #[serde(default = "default_local_id")]
    pub local_id: String,
    pub bgp: BgpConfig,
    /// Seed for deterministic per-downlink IPv4 interface addressing,
    /// bounded `/16` (§4.4 "Interface IPv4"). Default `100.64.0.0/10`.
    #[serde(default = "default_prefix_downlink_interface_v4")]
    pub prefix_downlink_interface_v4: Vec<ipnetwork::Ipv4Network>,
    /// Seed for deterministic per-downlink IPv6 interface addressing,
    /// bounded `/32`. Default `fdcc:cbe::/32`.
    #[serde(default = "default_prefix_downlink_interface_v6")]
    pub prefix_downlink_interface_v6: Vec<ipnetwork::Ipv6Network>,
    /// Seed for the per-downlink NAT64 `/96` scope, bounded `/32`. Default
    /// `64:ff9b::/32`.
    #[serde(default = "default_prefix_downlink_nat64")]
    pub prefix_downlink_nat64: Vec<ipnetwork::Ipv6Network>,
    /// Seed for the per-downlink NPTv6 `/48` scope, bounded `/12`. Default
    /// `660::/12`.
    #[serde(default = "default_prefix_downlink_nptv6")]
    pub prefix_downlink_nptv6: Vec<ipnetwork::Ipv6Network>,
    /// Not part of spec.md's `ServiceConfig` — recovered from the original
    /// (`vpnc/src/vpnc/models/service.py`'s `mgmt_address`), the address
    /// CORE answers management traffic on. Carried as an ambient operator
    /// convenience, not a reconciliation input (see DESIGN.md).
    #[serde(default)]
    pub mgmt_address: Option<IpAddr>,
}

fn default_local_id() -> String {
    "%any".to_string()
}

impl ServiceConfig {
    /// Enforces the per-scope max-length bounds from §3: interface v4 ≤
    /// /16, interface v6 ≤ /32, NAT64 ≤ /32, NPTv6 ≤ /12. Also bounds BGP
    /// neighbor priority to 0-9, mirroring connection ids' range.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        for p in &self.prefix_downlink_interface_v4 {
            if p.prefix() > 16 {
                return Err(Error::schema(
                    "DEFAULT.yaml",
                    format!("prefix_downlink_interface_v4 {p} is narrower than the /16 bound"),
                ));
            }
        }
        for p in &self.prefix_downlink_interface_v6 {
            if p.prefix() > 32 {
                return Err(Error::schema(
                    "DEFAULT.yaml",
                    format!("prefix_downlink_interface_v6 {p} is narrower than the /32 bound"),
                ));
            }
        }
        for p in &self.prefix_downlink_nat64 {
            if p.prefix() > 32 {
                return Err(Error::schema(
                    "DEFAULT.yaml",
                    format!("prefix_downlink_nat64 {p} is narrower than the /32 bound"),
                ));
            }
        }
        for p in &self.prefix_downlink_nptv6 {
            if p.prefix() > 12 {
                return Err(Error::schema(
                    "DEFAULT.yaml",
                    format!("prefix_downlink_nptv6 {p} is narrower than the /12 bound"),
                ));
            }
        }
        if self.mode == Mode::Hub {
            for n in &self.bgp.neighbors {
                if n.priority > 9 {
                    return Err(Error::schema(
                        "DEFAULT.yaml",
                        format!("bgp neighbor {} priority {} exceeds the 0-9 bound", n.address, n.priority),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals() -> BgpGlobals {
        BgpGlobals {
            asn: 65000,
            router_id: "198.51.100.1".parse().unwrap(),
            bfd: false,
        }
    }

    #[test]
    fn rejects_neighbor_priority_above_nine() {
        let svc = ServiceConfig {
            mode: Mode::Hub,
            local_id: "%any".to_string(),
            bgp: BgpConfig {
                globals: globals(),
                neighbors: vec![BgpNeighbor {
                    asn: 65001,
                    address: "198.51.100.2".parse().unwrap(),
                    priority: 10,
                }],
            },
            prefix_downlink_interface_v4: default_prefix_downlink_interface_v4(),
            prefix_downlink_interface_v6: default_prefix_downlink_interface_v6(),
            prefix_downlink_nat64: default_prefix_downlink_nat64(),
            prefix_downlink_nptv6: default_prefix_downlink_nptv6(),
            mgmt_address: None,
        };
        assert!(svc.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        let svc = ServiceConfig {
            mode: Mode::Hub,
            local_id: "%any".to_string(),
            bgp: BgpConfig {
                globals: globals(),
                neighbors: vec![],
            },
            prefix_downlink_interface_v4: default_prefix_downlink_interface_v4(),
            prefix_downlink_interface_v6: default_prefix_downlink_interface_v6(),
            prefix_downlink_nat64: default_prefix_downlink_nat64(),
            prefix_downlink_nptv6: default_prefix_downlink_nptv6(),
            mgmt_address: None,
        };
        assert!(svc.validate().is_ok());
    }
}

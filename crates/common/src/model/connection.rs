use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

/// Explicit interface addresses, when the operator wants to pin them instead
/// of letting the allocator derive them (§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InterfaceAddresses {
    pub ipv4: Option<Ipv4Network>,
    pub ipv6: Option<Ipv6Network>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Routes {
    #[serde(default)]
    pub ipv4: Vec<RouteV4>,
    #[serde(default)]
    pub ipv6: Vec<RouteV6>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteV4 {
    #[serde(deserialize_with = "deserialize_v4_dst", serialize_with = "serialize_v4_dst")]
    pub to: Ipv4Network,
    pub via: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteV6 {
    #[serde(deserialize_with = "deserialize_v6_dst", serialize_with = "serialize_v6_dst")]
    pub to: Ipv6Network,
    pub via: Option<Ipv6Addr>,
    #[serde(default)]
    pub nptv6: bool,
    #[serde(default)]
    pub nptv6_prefix: Option<Ipv6Network>,
}

/// Accepts the literal `"default"` in addition to canonical CIDR text,
/// coercing it to `0.0.0.0/0` (see EXTERNAL INTERFACES §6).
fn deserialize_v4_dst<'de, D>(de: D) -> std::result::Result<Ipv4Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    if s.eq_ignore_ascii_case("default") {
        return Ok(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is valid"));
    }
    s.parse().map_err(serde::de::Error::custom)
}

fn serialize_v4_dst<S>(net: &Ipv4Network, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    ser.serialize_str(&net.to_string())
}

fn deserialize_v6_dst<'de, D>(de: D) -> std::result::Result<Ipv6Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    if s.eq_ignore_ascii_case("default") {
        return Ok(Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).expect("::/0 is valid"));
    }
    s.parse().map_err(serde::de::Error::custom)
}

fn serialize_v6_dst<S>(net: &Ipv6Network, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    ser.serialize_str(&net.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecInitiation {
    Start,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpsecConfig {
    pub local_addr: IpAddr,
    pub remote_addr: IpAddr,
    pub remote_id: String,
    /// IKE version, 1 or 2. The original models both even though most
    /// deployments run IKEv2 exclusively.
    pub ike_version: u8,
    pub ike_proposals: Vec<String>,
    pub ike_lifetime: u32,
    pub ipsec_proposals: Vec<String>,
    pub ipsec_lifetime: u32,
    #[serde(default = "default_initiation")]
    pub initiation: IpsecInitiation,
    pub psk: String,
    #[serde(default)]
    pub local_ts: Vec<IpNetwork>,
    #[serde(default)]
    pub remote_ts: Vec<IpNetwork>,
}

fn default_initiation() -> IpsecInitiation {
    IpsecInitiation::Start
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireguardConfig {
    pub local_port: u16,
    pub remote_addresses: Vec<IpAddr>,
    pub remote_port: u16,
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    pub username: String,
    pub remote_addresses: Vec<IpAddr>,
    pub local_tunnel_id: u8,
    pub remote_tunnel_id: u8,
    #[serde(default)]
    pub remote_config: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalConfig {
    /// Name of the pre-existing interface to adopt into the network instance.
    pub interface: String,
}

/// The tagged connection config variant. Dispatches through `add`/`delete`/
/// `intf_name` the way the original dispatches through a per-type `add()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Ipsec(IpsecConfig),
    Physical(PhysicalConfig),
    Wireguard(WireguardConfig),
    Ssh(SshConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: u8,
    #[serde(default)]
    pub metadata: serde_yaml::Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interface: Option<InterfaceAddresses>,
    #[serde(default)]
    pub routes: Routes,
    #[serde(flatten)]
    pub config: ConnectionConfig,
}

impl Connection {
    /// Matches the original's `Connection.intf_name()`: the interface name
    /// this connection owns, derived from its type and id.
    pub fn intf_name(&self) -> String {
        match &self.config {
            ConnectionConfig::Ipsec(_) => format!("xfrm{}", self.id),
            ConnectionConfig::Wireguard(_) => format!("wg{}", self.id),
            ConnectionConfig::Ssh(cfg) => format!("tun{}", cfg.local_tunnel_id),
            ConnectionConfig::Physical(cfg) => cfg.interface.clone(),
        }
    }

    /// `true` for IPsec connections whose `if_id` is the XFRM interface id
    /// (used by the SA monitor, §4.6).
    pub fn is_ipsec(&self) -> bool {
        matches!(self.config, ConnectionConfig::Ipsec(_))
    }

    pub fn is_ssh(&self) -> bool {
        matches!(self.config, ConnectionConfig::Ssh(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_v4_route_coerces_to_unspecified() {
        let yaml = "to: default\nvia: null\n";
        let route: RouteV4 = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.to, Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap());
    }

    #[test]
    fn intf_name_matches_type() {
        let conn = Connection {
            id: 3,
            metadata: serde_yaml::Value::Null,
            description: String::new(),
            interface: None,
            routes: Routes::default(),
            config: ConnectionConfig::Wireguard(WireguardConfig {
                local_port: 51820,
                remote_addresses: vec![],
                remote_port: 51820,
                private_key: String::new(),
                public_key: String::new(),
            }),
        };
        assert_eq!(conn.intf_name(), "wg3");
    }
}

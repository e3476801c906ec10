//! Parsing and derivation for the tenant/network-instance/downlink id
//! scheme (§3, §4.4).
//!
//! A tenant id is 5 hex digits, `[2-9a-f][0-9a-f]{4}`, e.g. `c0001`. A
//! downlink network instance id appends a 2-digit instance number:
//! `c0001-01`. The leading nibble (`E`) is the environment/tier discriminant
//! reserved by the `[2-9a-f]` range (`0` and `1` are reserved for CORE and
//! EXTERNAL); the remaining 4 hex digits (`T`) are the tenant number; the
//! trailing decimal pair (`N`) is the instance number within the tenant.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownlinkId {
    pub tenant_id: String,
    /// Environment nibble, the tenant id's leading hex digit.
    pub e: u8,
    /// Tenant number, the remaining 4 hex digits.
    pub t: u16,
    /// Instance number within the tenant.
    pub n: u8,
}

impl DownlinkId {
    /// Parses a network instance id of the form `c0001-01`.
    pub fn parse(id: &str) -> Result<Self> {
        let (tenant_id, n_str) = id.split_once('-').ok_or_else(|| {
            Error::InvalidTopology(format!("`{id}` is not a downlink network instance id"))
        })?;
        if !crate::model::is_tenant_filename(tenant_id) {
            return Err(Error::InvalidTopology(format!(
                "`{tenant_id}` is not a valid tenant id"
            )));
        }
        let n: u8 = n_str
            .parse()
            .map_err(|_| Error::InvalidTopology(format!("`{n_str}` is not a valid instance number")))?;
        let e = u8::from_str_radix(&tenant_id[0..1], 16).expect("validated by is_tenant_filename");
        let t = u16::from_str_radix(&tenant_id[1..], 16).expect("validated by is_tenant_filename");
        Ok(DownlinkId {
            tenant_id: tenant_id.to_string(),
            e,
            t,
            n,
        })
    }

    pub fn instance_id(&self) -> String {
        format!("{}-{:02}", self.tenant_id, self.n)
    }
}

/// A compact numeric id derived from `(E, T, N)`, used as the XFRM/WireGuard
/// `fwmark` and as the low bits of the per-instance routing table id. Packs
/// into 24 bits: `E`(4) | `T`(16) | `N`(8), wide enough that no two distinct
/// downlink instances ever collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VpnId(pub u32);

impl From<DownlinkId> for VpnId {
    fn from(d: DownlinkId) -> Self {
        VpnId(((d.e as u32) << 24) | ((d.t as u32) << 8) | d.n as u32)
    }
}

impl VpnId {
    pub fn routing_table(&self) -> u32 {
        // Kernel main/default/local tables occupy 0, 253, 254, 255.
        1000 + (self.0 % 60000)
    }

    /// XFRM `if_id` base for a per-connection IPsec/WireGuard interface,
    /// derived from the network instance id and the connection index. For
    /// downlink instances this folds the hyphen-free hex id left by one
    /// nibble and adds the connection index; `CORE`/`EXTERNAL`/`ENDPOINT`
    /// share a fixed high base since only one of each ever exists.
    pub fn for_network_instance(ni_id: &str, conn_idx: u8) -> Self {
        let compact: String = ni_id.chars().filter(|c| *c != '-').collect();
        let base = u32::from_str_radix(&compact, 16)
            .map(|v| v << 4)
            .unwrap_or(0x1000_0000);
        VpnId(base + conn_idx as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_downlink_id() {
        let d = DownlinkId::parse("c0001-00").unwrap();
        assert_eq!(d.tenant_id, "c0001");
        assert_eq!(d.e, 0xc);
        assert_eq!(d.t, 1);
        assert_eq!(d.n, 0);
    }

    #[test]
    fn rejects_reserved_leading_nibble() {
        assert!(DownlinkId::parse("10001-00").is_err());
        assert!(DownlinkId::parse("00001-00").is_err());
    }

    #[test]
    fn vpn_ids_do_not_collide_across_instances() {
        let a = VpnId::from(DownlinkId::parse("c0001-00").unwrap());
        let b = VpnId::from(DownlinkId::parse("c0001-01").unwrap());
        let c = VpnId::from(DownlinkId::parse("c0002-00").unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}

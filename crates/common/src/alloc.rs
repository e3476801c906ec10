//! Deterministic and dynamic address-scope allocation (§4.4).
//!
//! Two families of allocation happen here:
//!
//! - **Deterministic derivation**: every downlink network instance gets a
//!   NAT64 `/96` and an NPTv6 `/48` scope computed purely from its
//!   `(E, T, N)` id triple and the service-wide seed prefixes. Two daemons
//!   given the same service config and tenant id always derive the same
//!   scope, with no persisted allocation table to go stale.
//! - **Dynamic sub-allocation**: within a network instance's NPTv6 `/48`
//!   scope, individual routes that request NPT translation get a smaller
//!   prefix carved out on demand, tracked in an in-memory bitmap so repeat
//!   reconciliation passes are stable and non-overlapping.
//!
//! Bit layout (`E`: 4 bits, `T`: 16 bits, `N`: 8 bits, from [`crate::ids`]):
//!
//! ```text
//! NAT64  (snapped to /96): seed | E<<80 | T<<64 | N<<48
//!        groups kept:      g0 g1 (seed) | g2=E | g3=T | g4=N | g5 free | g6 g7 = embedded IPv4
//! NPTv6  (snapped to /48): seed | E<<112 | T<<96 | N<<80
//!        groups kept:      g0 (seed nibble | E) | g1=T | g2=N (high byte free)
//! ```
//!
//! The embedded IPv4 octets (NAT64 `g6`/`g7`) and the interface identifier
//! bits below the NPTv6 `/48` are deliberately left untouched by this
//! encoding, so the scopes stay valid RFC 6052 / RFC 6296 prefixes.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

use crate::error::{Error, Result};
use crate::ids::DownlinkId;
use crate::model::ServiceConfig;

fn first_seed(prefixes: &[Ipv6Network]) -> Result<Ipv6Network> {
    prefixes
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidArgument("no seed prefix configured".into()))
}

fn first_v4_seed(prefixes: &[Ipv4Network]) -> Result<Ipv4Network> {
    prefixes
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidArgument("no seed prefix configured".into()))
}

/// Deterministic `/28` IPv4 interface subnet for connection `conn_id` on
/// downlink instance `id`: take the instance's `N`-th `/24` out of the
/// service's `prefix_downlink_interface_v4` seed, then the connection's
/// `conn_id`-th `/28` of that `/24` (§4.4 "Interface IPv4").
pub fn interface_v4(service: &ServiceConfig, id: DownlinkId, conn_id: u8) -> Result<Ipv4Network> {
    let seed = first_v4_seed(&service.prefix_downlink_interface_v4)?;
    let base = u32::from(seed.ip()) & !((1u32 << (32 - seed.prefix() as u32)) - 1);
    let subnet_24 = base.wrapping_add((id.n as u32) << 8);
    let subnet_28 = subnet_24 | ((conn_id as u32) << 4);
    Ipv4Network::new(Ipv4Addr::from(subnet_28), 28).map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Deterministic `/64` IPv6 interface subnet for connection `conn_id` on
/// downlink instance `id`: take the instance's `N`-th `/48` out of
/// `prefix_downlink_interface_v6`, then the connection's `conn_id`-th `/64`
/// of that `/48` (§4.4 "Interface IPv6").
pub fn interface_v6(service: &ServiceConfig, id: DownlinkId, conn_id: u8) -> Result<Ipv6Network> {
    let seed = first_seed(&service.prefix_downlink_interface_v6)?;
    let base = u128::from(seed.ip());
    let subnet_48 = base | ((id.n as u128) << 80);
    let subnet_64 = subnet_48 | ((conn_id as u128) << 64);
    Ipv6Network::new(Ipv6Addr::from(subnet_64), 64).map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Derives the NAT64 `/96` scope for a downlink instance.
pub fn nat64_scope(service: &ServiceConfig, id: DownlinkId) -> Result<Ipv6Network> {
    let seed = first_seed(&service.prefix_downlink_nat64)?;
    let base = u128::from(seed.ip());
    let offset = ((id.e as u128) << 80) | ((id.t as u128) << 64) | ((id.n as u128) << 48);
    let addr = Ipv6Addr::from(base | offset);
    Ipv6Network::new(addr, 96).map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Derives the NPTv6 `/48` scope for a downlink instance.
pub fn nptv6_scope(service: &ServiceConfig, id: DownlinkId) -> Result<Ipv6Network> {
    let seed = first_seed(&service.prefix_downlink_nptv6)?;
    let base = u128::from(seed.ip());
    let offset = ((id.e as u128) << 112) | ((id.t as u128) << 96) | ((id.n as u128) << 80);
    let addr = Ipv6Addr::from(base | offset);
    Ipv6Network::new(addr, 48).map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Carves non-overlapping sub-prefixes for NPT-translated routes out of a
/// network instance's NPTv6 scope. Allocation is first-fit over the scope's
/// address space at the requested prefix length, tracked per-instance so
/// repeated reconciliation passes hand back the same prefix to the same
/// route as long as its requested length doesn't change.
#[derive(Debug, Default)]
pub struct NptAllocator {
    used: HashSet<Ipv6Network>,
}

impl NptAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates (or returns the already-held) sub-prefix of `prefix_len`
    /// bits for `route_key` within `scope`. `route_key` is the caller's
    /// stable identity for the requesting route (e.g. `"{ni_id}:{conn_id}:{route_idx}"`),
    /// used only for idempotent re-derivation across calls within a single
    /// allocator's lifetime — the allocator itself holds no cross-process state.
    pub fn allocate(&mut self, scope: Ipv6Network, prefix_len: u8) -> Result<Ipv6Network> {
        if prefix_len < scope.prefix() || prefix_len > 128 {
            return Err(Error::InvalidArgument(format!(
                "requested NPTv6 sub-prefix /{prefix_len} does not fit within scope {scope}"
            )));
        }
        let step = 1u128 << (128 - prefix_len as u32);
        let scope_base = u128::from(scope.ip());
        let scope_size = 1u128 << (128 - scope.prefix() as u32);
        let mut cursor = scope_base;
        while cursor < scope_base.saturating_add(scope_size) {
            let candidate = Ipv6Network::new(Ipv6Addr::from(cursor), prefix_len)
                .expect("cursor and prefix_len are in range");
            if !self.used.iter().any(|u| overlaps(u, &candidate)) {
                self.used.insert(candidate);
                return Ok(candidate);
            }
            cursor = cursor.saturating_add(step);
        }
        Err(Error::InvalidArgument(format!(
            "NPTv6 scope {scope} exhausted at /{prefix_len}"
        )))
    }

    pub fn release(&mut self, prefix: &Ipv6Network) {
        self.used.remove(prefix);
    }

    /// Marks `prefix` as already assigned without consulting free space —
    /// used to seed the allocator from prefixes found already valid on disk
    /// (e.g. after a restart) before allocating anything new.
    pub fn reserve(&mut self, prefix: Ipv6Network) {
        self.used.insert(prefix);
    }
}

fn overlaps(a: &Ipv6Network, b: &Ipv6Network) -> bool {
    let a_lo = u128::from(a.network());
    let a_hi = a_lo | ((1u128 << (128 - a.prefix() as u32)) - 1);
    let b_lo = u128::from(b.network());
    let b_hi = b_lo | ((1u128 << (128 - b.prefix() as u32)) - 1);
    a_lo <= b_hi && b_lo <= a_hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BgpConfig, BgpGlobals, Mode};

    fn service() -> ServiceConfig {
        ServiceConfig {
            mode: Mode::Hub,
            local_id: "%any".to_string(),
            bgp: BgpConfig {
                globals: BgpGlobals {
                    asn: 65000,
                    router_id: "198.51.100.1".parse().unwrap(),
                    bfd: false,
                },
                neighbors: vec![],
            },
            prefix_downlink_interface_v4: vec!["100.64.0.0/10".parse().unwrap()],
            prefix_downlink_interface_v6: vec!["fdcc:cbe::/32".parse().unwrap()],
            prefix_downlink_nat64: vec!["64:ff9b::/32".parse().unwrap()],
            prefix_downlink_nptv6: vec!["2001:db8:a000::/36".parse().unwrap()],
            mgmt_address: None,
        }
    }

    #[test]
    fn distinct_instances_get_distinct_nat64_scopes() {
        let svc = service();
        let a = nat64_scope(&svc, DownlinkId::parse("c0001-00").unwrap()).unwrap();
        let b = nat64_scope(&svc, DownlinkId::parse("c0001-01").unwrap()).unwrap();
        let c = nat64_scope(&svc, DownlinkId::parse("c0002-00").unwrap()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.prefix(), 96);
    }

    #[test]
    fn distinct_instances_get_distinct_nptv6_scopes() {
        let svc = service();
        let a = nptv6_scope(&svc, DownlinkId::parse("c0001-00").unwrap()).unwrap();
        let b = nptv6_scope(&svc, DownlinkId::parse("c0001-01").unwrap()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.prefix(), 48);
    }

    #[test]
    fn npt_allocator_hands_out_non_overlapping_prefixes() {
        let svc = service();
        let scope = nptv6_scope(&svc, DownlinkId::parse("c0001-00").unwrap()).unwrap();
        let mut alloc = NptAllocator::new();
        let p1 = alloc.allocate(scope, 64).unwrap();
        let p2 = alloc.allocate(scope, 64).unwrap();
        assert_ne!(p1, p2);
        assert!(!overlaps(&p1, &p2));
    }

    #[test]
    fn npt_allocator_rejects_prefix_wider_than_scope() {
        let svc = service();
        let scope = nptv6_scope(&svc, DownlinkId::parse("c0001-00").unwrap()).unwrap();
        let mut alloc = NptAllocator::new();
        assert!(alloc.allocate(scope, 32).is_err());
    }

    #[test]
    fn interface_v4_differs_per_connection_and_instance() {
        let svc = service();
        let id0 = DownlinkId::parse("c0001-00").unwrap();
        let id1 = DownlinkId::parse("c0001-01").unwrap();
        let a = interface_v4(&svc, id0, 0).unwrap();
        let b = interface_v4(&svc, id0, 1).unwrap();
        let c = interface_v4(&svc, id1, 0).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.prefix(), 28);
    }

    #[test]
    fn interface_v6_differs_per_connection_and_instance() {
        let svc = service();
        let id0 = DownlinkId::parse("c0001-00").unwrap();
        let a = interface_v6(&svc, id0, 0).unwrap();
        let b = interface_v6(&svc, id0, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.prefix(), 64);
    }
}

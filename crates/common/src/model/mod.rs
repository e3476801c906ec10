//! Versioned YAML data model for tenants and the service config.
//!
//! Mirrors the DATA MODEL section of the design doc one-to-one: `Tenant`,
//! `NetworkInstance`, `Connection`, `ServiceConfig`. Kernel objects are never
//! modeled here — this module only describes the declared, versioned source
//! of truth.

mod connection;
mod network_instance;
mod service;
mod tenant;

pub use connection::{
    ConnectionConfig, InterfaceAddresses, IpsecConfig, IpsecInitiation, PhysicalConfig, RouteV4,
    RouteV6, Routes, SshConfig, WireguardConfig,
};
pub use network_instance::{NetworkInstance, NetworkInstanceType};
pub use service::{BgpConfig, BgpGlobals, BgpNeighbor, Mode, ServiceConfig};
pub use tenant::Tenant;

use crate::error::{Error, Result};

/// Regex-equivalent filename check for tenant files:
/// `^[2-9a-fA-F][0-9a-fA-F]{4}\.yaml$`.
pub fn is_tenant_filename(stem: &str) -> bool {
    let bytes = stem.as_bytes();
    if bytes.len() != 5 {
        return false;
    }
    let first_ok = matches!(bytes[0], b'2'..=b'9' | b'a'..=b'f' | b'A'..=b'F');
    first_ok && bytes[1..].iter().all(|b| b.is_ascii_hexdigit())
}

/// Validates the structural invariant that connection ids within a network
/// instance are unique (guaranteed by the map) and dense in `[0, 9]`.
pub fn validate_connection_ids_dense(ids: &std::collections::BTreeSet<u8>) -> Result<()> {
    for (expected, actual) in (0u8..).zip(ids.iter().copied()) {
        if expected != actual {
            return Err(Error::InvalidTopology(format!(
                "connection ids must be dense starting at 0, found gap before {actual}"
            )));
        }
    }
    Ok(())
}

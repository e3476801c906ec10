use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::connection::Connection;
use super::validate_connection_ids_dense;
use crate::error::Result;

/// The four network instance roles the original recognizes. Drives which
/// sysctl/nftables/reconciler branch a given instance goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInstanceType {
    External,
    Core,
    Downlink,
    Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInstance {
    /// e.g. `c0001-01`, `EXTERNAL`, `CORE`, `ENDPOINT`.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NetworkInstanceType,
    #[serde(default)]
    pub connections: BTreeMap<u8, Connection>,
    #[serde(default)]
    pub nat64: bool,
    #[serde(default)]
    pub outbound_nat: bool,
}

impl NetworkInstance {
    /// Kernel-visible name of the network namespace (`ip netns`) this
    /// instance maps to.
    pub fn netns_name(&self) -> String {
        format!("ni-{}", self.id)
    }

    pub fn validate(&self) -> Result<()> {
        let ids = self.connections.keys().copied().collect();
        validate_connection_ids_dense(&ids)
    }
}

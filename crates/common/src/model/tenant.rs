use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::network_instance::NetworkInstance;
use crate::error::{Error, Result};

/// A tenant file, keyed by its 5-hex-digit id (`c0001`) in the filename and
/// carried again inside the body for cross-checking on load (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: serde_yaml::Value,
    #[serde(default)]
    pub network_instances: BTreeMap<String, NetworkInstance>,
}

impl Tenant {
    /// Checks the body's `id` against the filename stem it was loaded from.
    pub fn validate(&self, filename_stem: &str) -> Result<()> {
        if self.id != filename_stem {
            return Err(Error::schema(
                format!("{filename_stem}.yaml"),
                format!(
                    "tenant id `{}` in file body does not match filename `{filename_stem}`",
                    self.id
                ),
            ));
        }
        for ni in self.network_instances.values() {
            ni.validate()?;
        }
        Ok(())
    }
}

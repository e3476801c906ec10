//! Daemon-local settings: where the tenant/service YAML tree lives, where
//! generated config for external tools is written, and the handful of poll
//! intervals the control loop uses. This is orthogonal to the tenant
//! config itself (§3's YAML is the reconciliation source of truth; this
//! file only says where to find it), the same split the teacher draws
//! between its own `DaemonConfig` and the VM/volume specs it reconciles.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// On-disk settings for `vpncd` itself, loaded from `--config` (defaults to
/// `/opt/ncubed/config/vpnc/vpncd.toml`) with [`DaemonConfig::load`]/
/// [`DaemonConfig::save`] the same way the teacher round-trips its own TOML
/// settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// `/opt/ncubed/config/vpnc/active` — source of truth.
    pub active_dir: PathBuf,
    /// `/opt/ncubed/config/vpnc/candidate` — CLI edits, committed by the CLI.
    pub candidate_dir: PathBuf,
    /// `/etc/swanctl/conf.d`.
    pub swanctl_conf_dir: PathBuf,
    /// `/etc/frr/frr.conf`.
    pub frr_conf_path: PathBuf,
    /// `/opt/ncubed/config/vpncmangle/translations.json`.
    pub vpncmangle_config_path: PathBuf,
    /// Install root for the `vpncmangle` binary.
    pub install_dir: PathBuf,
    /// strongSwan's VICI control socket, reachable from inside EXTERNAL.
    pub vici_socket: String,
    #[serde(with = "duration_secs")]
    pub file_watch_debounce: Duration,
    #[serde(with = "duration_secs")]
    pub vici_retry_interval: Duration,
    pub vici_retry_attempts: u32,
    #[serde(with = "duration_secs")]
    pub sweeper_interval: Duration,
    #[serde(with = "duration_secs")]
    pub sweeper_grace_period: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = vpnc_common::default_config_dir();
        Self {
            active_dir: base.join("active"),
            candidate_dir: base.join("candidate"),
            swanctl_conf_dir: PathBuf::from("/etc/swanctl/conf.d"),
            frr_conf_path: PathBuf::from("/etc/frr/frr.conf"),
            vpncmangle_config_path: PathBuf::from("/opt/ncubed/config/vpncmangle/translations.json"),
            install_dir: PathBuf::from("/opt/ncubed"),
            vici_socket: "/var/run/charon.vici".to_string(),
            file_watch_debounce: Duration::from_millis(100),
            vici_retry_interval: Duration::from_secs(2),
            vici_retry_attempts: 10,
            sweeper_interval: Duration::from_secs(30),
            sweeper_grace_period: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Loads settings from `path`, falling back to [`Default`] if the file
    /// doesn't exist yet (first boot on a fresh host).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&text)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn service_path(&self) -> PathBuf {
        self.active_dir.join("DEFAULT.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpncd.toml");
        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.vici_retry_attempts, 10);
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpncd.toml");
        let config = DaemonConfig::default();
        config.save(&path).unwrap();
        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.active_dir, config.active_dir);
        assert_eq!(loaded.file_watch_debounce, config.file_watch_debounce);
    }
}

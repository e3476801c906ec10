//! Shared types and infrastructure for the `vpncd` multi-tenant VPN
//! concentrator: the versioned data model, id/scope derivation, the config
//! loader, kernel primitives, external tool adapters and process-wide
//! shared state.

pub mod adapters;
pub mod alloc;
pub mod error;
pub mod ids;
pub mod kernel;
pub mod loader;
pub mod model;
pub mod state;

pub use error::{Error, Result};

/// `vpncd` version, reported in logs and the `status` diagnostic surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default location for the tenant/service YAML tree.
pub fn default_config_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/opt/ncubed/config/vpnc")
}

/// Default location for the daemon's own local settings file.
pub fn default_settings_path() -> std::path::PathBuf {
    default_config_dir().join("vpncd.toml")
}

//! External tool adapters (§4.2): strongSwan (swanctl config + VICI),
//! FRR, Jool, and the `vpncmangle` DNS sidecar. Each owns the
//! render-then-reload or request-then-await shape the corresponding
//! upstream tool demands.

pub mod frr;
pub mod jool;
pub mod ssh;
pub mod swanctl;
pub mod vici;
pub mod vpncmangle;

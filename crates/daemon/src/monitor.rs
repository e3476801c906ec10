//! Route/SA state monitor (C6, §4.6).
//!
//! Two independent watchers share one `Monitor`: a per-connection link-state
//! poll that blackholes routes when their interface drops, and a
//! process-wide VICI event listener that resolves duplicate SAs as they
//! come up and terminates stale ones. A 30s sweeper re-initiates any IPsec
//! connection configured `initiation: start` with no established SA, after
//! an initial grace period so a cold boot isn't treated as a flap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vpnc_common::adapters::vici::{IkeSa, Message, Session};
use vpnc_common::ids::DownlinkId;
use vpnc_common::kernel::{KernelOps, RouteKind, RouteOp};
use vpnc_common::model::{ConnectionConfig, IpsecInitiation, NetworkInstanceType};
use vpnc_common::state::SharedState;
use vpnc_common::Result;

use crate::config::DaemonConfig;

pub struct Monitor {
    kernel: Arc<dyn KernelOps>,
    config: Arc<DaemonConfig>,
    state: SharedState,
}

impl Monitor {
    pub fn new(kernel: Arc<dyn KernelOps>, config: Arc<DaemonConfig>, state: SharedState) -> Self {
        Self { kernel, config, state }
    }

    /// Runs every watcher until the shared stop token is cancelled.
    pub async fn run(self: Arc<Self>) {
        let stop = self.state.stop_token();
        let link_watch = tokio::spawn(self.clone().link_state_loop(stop.clone()));
        let vici_watch = tokio::spawn(self.clone().vici_event_loop(stop.clone()));
        let sweeper = tokio::spawn(self.clone().sweeper_loop(stop.clone()));

        let _ = tokio::join!(link_watch, vici_watch, sweeper);
    }

    // ---- link-state watcher --------------------------------------------

    /// Polls every connection's interface every 5s; on a down transition,
    /// blackholes the connection's configured routes so FRR's redistribution
    /// filter withdraws them instead of routing into a dead tunnel (§4.6
    /// "route withdraw"). On the matching up transition, restores the
    /// unicast route. Any transition also re-evaluates the instance's
    /// advertised prefix in CORE, gated on every sibling connection being
    /// simultaneously up, so a single flapped tunnel among several doesn't
    /// withdraw the whole instance's aggregate (§4.6).
    async fn link_state_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_up: HashMap<String, bool> = HashMap::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            for tenant in self.state.tenants_snapshot() {
                for ni in tenant.network_instances.values() {
                    if !matches!(ni.kind, NetworkInstanceType::Downlink | NetworkInstanceType::Endpoint) {
                        continue;
                    }
                    let ns = ni.netns_name();
                    let is_endpoint = ni.kind == NetworkInstanceType::Endpoint;
                    let c_leg = format!("{}_C", ni.id);
                    let mut any_transition = false;

                    for conn in ni.connections.values() {
                        if conn.routes.ipv4.is_empty() && conn.routes.ipv6.is_empty() {
                            continue;
                        }
                        let key = format!("{}:{}", ni.id, conn.id);
                        let up = match self.kernel.link_is_up(&ns, &conn.intf_name()).await {
                            Ok(up) => up,
                            Err(e) => {
                                warn!(ni = %ni.id, conn = conn.id, error = %e, "failed to poll link state");
                                continue;
                            }
                        };
                        let was_up = last_up.insert(key.clone(), up);
                        if was_up == Some(up) {
                            continue;
                        }
                        any_transition = true;
                        info!(ni = %ni.id, conn = conn.id, up, "connection link state changed");
                        for route in &conn.routes.ipv4 {
                            let _ = self
                                .kernel
                                .route(
                                    &ns,
                                    RouteOp::Replace,
                                    IpNetwork::V4(route.to),
                                    if up { route.via.map(std::net::IpAddr::V4) } else { None },
                                    if up { Some(&conn.intf_name()) } else { None },
                                    if up { RouteKind::Unicast } else { RouteKind::Blackhole },
                                )
                                .await;
                        }
                        for route in &conn.routes.ipv6 {
                            let _ = self
                                .kernel
                                .route(
                                    &ns,
                                    RouteOp::Replace,
                                    IpNetwork::V6(route.to),
                                    if up { route.via.map(std::net::IpAddr::V6) } else { None },
                                    if up { Some(&conn.intf_name()) } else { None },
                                    if up { RouteKind::Unicast } else { RouteKind::Blackhole },
                                )
                                .await;
                        }
                    }

                    if !any_transition {
                        continue;
                    }

                    let all_up = ni.connections.values().all(|conn| {
                        (conn.routes.ipv4.is_empty() && conn.routes.ipv6.is_empty())
                            || last_up.get(&format!("{}:{}", ni.id, conn.id)).copied().unwrap_or(false)
                    });
                    let via_v6: Option<std::net::IpAddr> =
                        "fe80::1".parse().ok().map(std::net::IpAddr::V6);
                    let via_v4: Option<std::net::IpAddr> =
                        "169.254.0.2".parse().ok().map(std::net::IpAddr::V4);

                    for conn in ni.connections.values() {
                        for route in &conn.routes.ipv6 {
                            let advertised = route.nptv6_prefix.unwrap_or(route.to);
                            let _ = self
                                .kernel
                                .route(
                                    "ni-CORE",
                                    RouteOp::Replace,
                                    IpNetwork::V6(advertised),
                                    if all_up { via_v6 } else { None },
                                    if all_up { Some(&c_leg) } else { None },
                                    if all_up { RouteKind::Unicast } else { RouteKind::Blackhole },
                                )
                                .await;
                        }
                        if is_endpoint {
                            for route in &conn.routes.ipv4 {
                                let _ = self
                                    .kernel
                                    .route(
                                        "ni-CORE",
                                        RouteOp::Replace,
                                        IpNetwork::V4(route.to),
                                        if all_up { via_v4 } else { None },
                                        if all_up { Some(&c_leg) } else { None },
                                        if all_up { RouteKind::Unicast } else { RouteKind::Blackhole },
                                    )
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    }

    // ---- VICI event listener --------------------------------------------

    async fn vici_event_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                return;
            }
            let session = match self.connect_vici_with_retry(&stop).await {
                Some(s) => s,
                None => return,
            };
            if session.register_event("ike-updown").await.is_err()
                || session.register_event("child-updown").await.is_err()
            {
                warn!("failed to register VICI event streams, reconnecting");
                continue;
            }
            info!("listening for strongSwan IKE/CHILD SA events");

            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => return,
                    next = session.next_event() => next,
                };
                match next {
                    Ok((_name, event)) => {
                        if let Some(sa) = IkeSa::from_event(&event) {
                            self.resolve_duplicate_sas(&session, &sa).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "VICI event stream broke, reconnecting");
                        break;
                    }
                }
            }
        }
    }

    async fn connect_vici_with_retry(&self, stop: &CancellationToken) -> Option<Session> {
        for attempt in 0..self.config.vici_retry_attempts {
            if stop.is_cancelled() {
                return None;
            }
            match Session::connect(&self.config.vici_socket).await {
                Ok(s) => return Some(s),
                Err(e) => {
                    warn!(attempt, error = %e, "VICI connect failed, retrying");
                    tokio::select! {
                        _ = stop.cancelled() => return None,
                        _ = sleep(self.config.vici_retry_interval) => {}
                    }
                }
            }
        }
        None
    }

    /// Keeps the most-recently-established IKE_SA for a connection name and
    /// terminates the rest, then does the same for that IKE_SA's CHILD_SAs,
    /// bucketed by their traffic selector pair (§4.6 "duplicate SA
    /// resolution"). Non-numeric or missing `established`/`install-time`
    /// fields are treated as oldest, matching the original's string
    /// comparison falling back to a default rather than erroring.
    async fn resolve_duplicate_sas(&self, session: &Session, sa: &IkeSa<'_>) {
        let sas = match session.list_sas(Message::new()).await {
            Ok(sas) => sas,
            Err(e) => {
                warn!(conn = %sa.name, error = %e, "list-sas failed while resolving duplicates");
                return;
            }
        };

        let mut siblings: Vec<IkeSa<'_>> = sas
            .iter()
            .filter_map(IkeSa::from_event)
            .filter(|s| s.name == sa.name)
            .collect();
        siblings.sort_by_key(|s| s.established().unwrap_or(0));

        if siblings.len() > 1 {
            for stale in &siblings[..siblings.len() - 1] {
                if let Some(id) = stale.uniqueid() {
                    info!(conn = %sa.name, ike_id = id, "terminating duplicate IKE_SA");
                    let _ = session.terminate_sa(Some(id), None).await;
                }
            }
        }

        let Some(survivor) = siblings.last() else { return };
        let mut by_ts: HashMap<(String, String), Vec<(u32, i64)>> = HashMap::new();
        for (_, child) in survivor.child_sas() {
            let local_ts = child.get_str("local-ts").unwrap_or_default();
            let remote_ts = child.get_str("remote-ts").unwrap_or_default();
            let uniqueid: u32 = child.get_str("uniqueid").and_then(|s| s.parse().ok()).unwrap_or(0);
            let install_time: i64 = child.get_str("install-time").and_then(|s| s.parse().ok()).unwrap_or(0);
            by_ts.entry((local_ts, remote_ts)).or_default().push((uniqueid, install_time));
        }
        for bucket in by_ts.values() {
            if bucket.len() <= 1 {
                continue;
            }
            let mut sorted = bucket.clone();
            sorted.sort_by_key(|(_, install_time)| *install_time);
            for (id, _) in &sorted[..sorted.len() - 1] {
                info!(conn = %sa.name, child_id = id, "terminating duplicate CHILD_SA");
                let _ = session.terminate_sa(None, Some(*id)).await;
            }
        }
    }

    // ---- sweeper ----------------------------------------------------------

    /// Every `sweeper_interval`, re-initiates any `initiation: start` IPsec
    /// connection with no established IKE_SA, skipped for the first
    /// `sweeper_grace_period` after startup so a cold boot's staggered
    /// connects aren't mistaken for flaps.
    async fn sweeper_loop(self: Arc<Self>, stop: CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(self.config.sweeper_grace_period) => {}
        }

        let mut ticker = interval(self.config.sweeper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let Ok(session) = Session::connect(&self.config.vici_socket).await else {
                continue;
            };
            let Ok(sas) = session.list_sas(Message::new()).await else {
                continue;
            };
            let established: std::collections::HashSet<String> = sas
                .iter()
                .filter_map(IkeSa::from_event)
                .filter(|s| s.established().is_some())
                .map(|s| s.name)
                .collect();

            for tenant in self.state.tenants_snapshot() {
                for ni in tenant.network_instances.values() {
                    let Ok(id) = DownlinkId::parse(&ni.id) else { continue };
                    for (idx, conn) in &ni.connections {
                        let ConnectionConfig::Ipsec(ipsec) = &conn.config else { continue };
                        if !matches!(ipsec.initiation, IpsecInitiation::Start) {
                            continue;
                        }
                        let conn_name = format!("{}-{}", ni.id, idx);
                        if established.contains(&conn_name) {
                            continue;
                        }
                        info!(ni = %ni.id, conn = idx, tenant = %id.tenant_id, "re-initiating inactive IPsec connection");
                        let _ = session.initiate(&conn_name).await;
                    }
                }
            }
        }
    }
}

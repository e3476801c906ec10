//! Network-instance reconciler (C5, §4.5).
//!
//! `apply` is the single entry point: given a network instance's desired
//! (`new`) and last-applied (`prev`) state, it drives live kernel state
//! (namespace, veths/xfrm/wireguard links, addresses, routes, nftables,
//! NAT64, swanctl) toward `new`, touching only what changed. Skipped
//! entirely when `new == prev` (§4.5's idempotence invariant).

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use tracing::{info, warn};

use vpnc_common::alloc::{self, NptAllocator};
use vpnc_common::ids::{DownlinkId, VpnId};
use vpnc_common::kernel::{KernelOps, LinkKind, LinkSpec, RouteKind, RouteOp};
use vpnc_common::model::{
    Connection, ConnectionConfig, NetworkInstance, NetworkInstanceType, ServiceConfig,
};
use vpnc_common::state::SharedState;
use vpnc_common::{adapters, Error, Result};

use crate::config::DaemonConfig;

/// Everything C5 needs to mutate kernel and external-tool state for one
/// network instance. Cheap to clone; held by the file-watch controller and
/// handed one per reconciliation call.
#[derive(Clone)]
pub struct Reconciler {
    kernel: Arc<dyn KernelOps>,
    config: Arc<DaemonConfig>,
    state: SharedState,
    /// One allocator per downlink/endpoint network instance, so repeat
    /// reconciliation passes hand the same route back the same NPTv6
    /// sub-prefix (§4.4 step 1).
    npt_allocators: Arc<DashMap<String, Mutex<NptAllocator>>>,
}

/// `CORE`'s veth leg naming convention: `<ni>_C` in CORE, `<ni>_D` in the
/// downlink/endpoint instance itself (§4.5 step 3).
fn core_leg(ni_id: &str) -> String {
    format!("{ni_id}_C")
}
fn downlink_leg(ni_id: &str) -> String {
    format!("{ni_id}_D")
}

/// A freshly-assigned NPTv6 sub-prefix, handed back to the file-watch
/// controller so it can write the assignment into the owning tenant's YAML
/// (§4.4, §4.7 write-back) instead of the reconciler reaching into a
/// `Tenant` it only ever borrows immutably.
#[derive(Debug, Clone, Copy)]
pub struct NptAssignment {
    pub conn_id: u8,
    pub route_index: usize,
    pub prefix: ipnetwork::Ipv6Network,
}

impl Reconciler {
    pub fn new(kernel: Arc<dyn KernelOps>, config: Arc<DaemonConfig>, state: SharedState) -> Self {
        Self {
            kernel,
            config,
            state,
            npt_allocators: Arc::new(DashMap::new()),
        }
    }

    /// Entry point (§4.5). Returns `true` if NPTv6 assignments changed and
    /// the owning tenant's YAML should be persisted back to disk (§4.7).
    pub async fn apply(
        &self,
        ni_new: Option<&NetworkInstance>,
        ni_prev: Option<&NetworkInstance>,
    ) -> Result<Vec<NptAssignment>> {
        if ni_new == ni_prev {
            return Ok(Vec::new());
        }

        let Some(ni_new) = ni_new else {
            if let Some(prev) = ni_prev {
                self.delete_network_instance(prev).await?;
            }
            return Ok(Vec::new());
        };

        let lock = self.state.ni_lock(&ni_new.id);
        let _guard = lock.lock().await;

        match ni_new.kind {
            NetworkInstanceType::External => {
                self.apply_external(ni_new).await?;
                Ok(Vec::new())
            }
            NetworkInstanceType::Core => {
                self.apply_core(ni_new).await?;
                Ok(Vec::new())
            }
            NetworkInstanceType::Downlink | NetworkInstanceType::Endpoint => {
                self.apply_downlink(ni_new, ni_prev).await
            }
        }
    }

    // ---- EXTERNAL -------------------------------------------------------

    async fn apply_external(&self, ni: &NetworkInstance) -> Result<()> {
        let ns = ni.netns_name();
        self.kernel.ensure_namespace(&ns).await?;

        for conn in ni.connections.values() {
            if let ConnectionConfig::Physical(phys) = &conn.config {
                self.kernel
                    .ensure_link(
                        &ns,
                        LinkSpec {
                            name: phys.interface.clone(),
                            kind: LinkKind::Existing,
                        },
                    )
                    .await?;
                if let Some(addrs) = &conn.interface {
                    if let Some(v4) = addrs.ipv4 {
                        self.kernel
                            .replace_address(&ns, &phys.interface, IpNetwork::V4(v4))
                            .await?;
                    }
                    if let Some(v6) = addrs.ipv6 {
                        self.kernel
                            .replace_address(&ns, &phys.interface, IpNetwork::V6(v6))
                            .await?;
                    }
                }
                self.kernel.set_link_state(&ns, &phys.interface, true).await?;
                for route in &conn.routes.ipv4 {
                    self.kernel
                        .route(
                            &ns,
                            RouteOp::Replace,
                            IpNetwork::V4(route.to),
                            route.via.map(IpAddr::V4),
                            Some(&phys.interface),
                            RouteKind::Unicast,
                        )
                        .await?;
                }
                for route in &conn.routes.ipv6 {
                    self.kernel
                        .route(
                            &ns,
                            RouteOp::Replace,
                            IpNetwork::V6(route.to),
                            route.via.map(IpAddr::V6),
                            Some(&phys.interface),
                            RouteKind::Unicast,
                        )
                        .await?;
                }
            }
        }

        // Only ESP, IKE (500/4500) and the WireGuard port range cross
        // EXTERNAL's boundary in either direction; everything else is
        // dropped (§4.5 EXTERNAL ruleset).
        let ruleset = format!(
            "table inet vpnc_external {{\n\
             \x20  chain inbound {{\n\
             \x20    type filter hook input priority 0; policy drop;\n\
             \x20    ip protocol esp accept\n\
             \x20    udp dport {{500, 4500}} accept\n\
             \x20    udp dport 51820-51899 accept\n\
             \x20  }}\n\
             \x20  chain outbound {{\n\
             \x20    type filter hook output priority 0; policy drop;\n\
             \x20    ip protocol esp accept\n\
             \x20    udp sport {{500, 4500}} accept\n\
             \x20    udp sport 51820-51899 accept\n\
             \x20  }}\n\
             }}\n"
        );
        self.kernel.apply_nft_rules(&ns, &ruleset).await?;
        Ok(())
    }

    // ---- CORE -------------------------------------------------------

    async fn apply_core(&self, ni: &NetworkInstance) -> Result<()> {
        let ns = ni.netns_name();
        self.kernel.ensure_namespace(&ns).await?;
        self.kernel.enable_forwarding(&ns).await?;

        let downlink_legs: Vec<String> = self
            .state
            .tenants_snapshot()
            .iter()
            .flat_map(|t| t.network_instances.values().cloned().collect::<Vec<_>>())
            .filter(|other| {
                matches!(
                    other.kind,
                    NetworkInstanceType::Downlink | NetworkInstanceType::Endpoint
                )
            })
            .map(|other| core_leg(&other.id))
            .collect();

        let mut ruleset = String::from(
            "table inet vpnc_core {\n  chain forward {\n    type filter hook forward priority 0; policy drop;\n",
        );
        for leg in &downlink_legs {
            ruleset.push_str(&format!(
                "    iifname \"{leg}\" oifname \"veth_ext\" drop\n    iifname \"{leg}\" accept\n    oifname \"{leg}\" accept\n"
            ));
        }
        for conn in ni.connections.values() {
            ruleset.push_str(&format!(
                "    iifname \"{}\" accept\n    oifname \"{}\" accept\n",
                conn.intf_name(),
                conn.intf_name()
            ));
        }
        ruleset.push_str("  }\n}\n");
        self.kernel.apply_nft_rules(&ns, &ruleset).await?;

        let service = self.state.service_config();
        if service.mode == vpnc_common::model::Mode::Hub {
            self.regenerate_frr(&service).await?;
        }

        Ok(())
    }

    /// Renders and reloads `frr.conf` from the service BGP config plus
    /// every hub-mode tenant's advertised routes (§4.2, §4.7).
    pub async fn regenerate_frr(&self, service: &ServiceConfig) -> Result<()> {
        let advertised = self.advertised_prefixes();
        let rendered = adapters::frr::render("CORE", service, &advertised);
        let path = self.config.frr_conf_path.clone();
        tokio::task::spawn_blocking(move || adapters::frr::write_and_reload(&path, &rendered))
            .await
            .map_err(|e| Error::Internal(format!("frr render task panicked: {e}")))??;
        Ok(())
    }

    /// The set of IPv6 prefixes every downlink currently advertises into
    /// CORE: the NPTv6 prefix for `nptv6: true` routes, the route itself
    /// otherwise (§4.2 "per-tenant routes").
    fn advertised_prefixes(&self) -> Vec<ipnetwork::Ipv6Network> {
        let mut prefixes = Vec::new();
        for tenant in self.state.tenants_snapshot() {
            for ni in tenant.network_instances.values() {
                if !matches!(ni.kind, NetworkInstanceType::Downlink) {
                    continue;
                }
                for conn in ni.connections.values() {
                    for route in &conn.routes.ipv6 {
                        prefixes.push(route.nptv6_prefix.unwrap_or(route.to));
                    }
                }
            }
        }
        prefixes
    }

    // ---- DOWNLINK / ENDPOINT -----------------------------------------

    async fn apply_downlink(
        &self,
        ni_new: &NetworkInstance,
        ni_prev: Option<&NetworkInstance>,
    ) -> Result<Vec<NptAssignment>> {
        let ns = ni_new.netns_name();
        let is_endpoint = ni_new.kind == NetworkInstanceType::Endpoint;
        let service = self.state.service_config();
        let is_hub = service.mode == vpnc_common::model::Mode::Hub && !is_endpoint;

        self.kernel.ensure_namespace(&ns).await?;
        self.kernel.enable_forwarding(&ns).await?;

        // Step 3: veth pair to CORE.
        let d_leg = downlink_leg(&ni_new.id);
        let c_leg = core_leg(&ni_new.id);
        self.kernel
            .ensure_link(
                "ni-CORE",
                LinkSpec {
                    name: c_leg.clone(),
                    kind: LinkKind::Veth { peer: d_leg.clone() },
                },
            )
            .await?;
        self.kernel.set_link_state("ni-CORE", &c_leg, true).await?;
        self.kernel.set_link_state(&ns, &d_leg, true).await?;
        self.kernel
            .replace_address(&ns, &d_leg, "fe80::/64".parse().expect("valid"))
            .await?;
        self.kernel
            .replace_address("ni-CORE", &c_leg, "fe80::1/64".parse().expect("valid"))
            .await?;
        if is_endpoint {
            self.kernel
                .replace_address(&ns, &d_leg, "169.254.0.1/30".parse().expect("valid"))
                .await?;
            self.kernel
                .replace_address("ni-CORE", &c_leg, "169.254.0.2/30".parse().expect("valid"))
                .await?;
        }

        // Step 4: cross-instance routes for the CORE uplink's advertised
        // prefixes. These come from CORE's own connections (its uplink), not
        // from this downlink's YAML, which carries none.
        let core_ni = self
            .state
            .tenant("DEFAULT")
            .and_then(|t| t.network_instances.get("CORE").cloned());
        if let Some(core_ni) = &core_ni {
            for conn in core_ni.connections.values() {
                for route in &conn.routes.ipv6 {
                    self.kernel
                        .route(
                            &ns,
                            RouteOp::Replace,
                            IpNetwork::V6(route.to),
                            Some("fe80::1".parse().expect("valid")),
                            Some(&d_leg),
                            RouteKind::Unicast,
                        )
                        .await?;
                }
                if !is_hub {
                    for route in &conn.routes.ipv4 {
                        self.kernel
                            .route(
                                &ns,
                                RouteOp::Replace,
                                IpNetwork::V4(route.to),
                                None,
                                Some(&d_leg),
                                RouteKind::Unicast,
                            )
                            .await?;
                    }
                }
            }
        }

        // Step 6: connection reconciliation.
        self.reconcile_connections(&ns, ni_new, ni_prev).await?;

        // Step 7: dynamic NPTv6 assignment + downlink ruleset.
        let mut assignments = Vec::new();
        if is_hub {
            assignments = self.reconcile_nptv6(ni_new).await?;
        }
        let ruleset = self.render_downlink_ruleset(ni_new, is_hub);
        self.kernel.apply_nft_rules(&ns, &ruleset).await?;

        // Step 8: NAT64.
        if is_hub {
            let id = DownlinkId::parse(&ni_new.id)?;
            let scope = alloc::nat64_scope(&service, id)?;
            adapters::jool::sync_instance(&ns, &ni_new.id, scope)?;
        }

        // Step 9: swanctl.
        self.sync_swanctl(ni_new, &service).await?;

        Ok(assignments)
    }

    /// §4.5 step 7: a NETMAP-equivalent nftables rewrite between the
    /// provider-side `nptv6_prefix` and the customer's own `route.to` for
    /// every NPT-translated route, plus a legacy-IPv4 masquerade in
    /// non-hub mode. The original does this with
    /// `PREROUTING -d <nptv6_prefix> -i <ni>_D -j NETMAP --to <route.to>`;
    /// nftables has no single `NETMAP` verb, so the prefix-to-prefix
    /// mapping is split across a `dnat` (customer-bound traffic arriving
    /// addressed to the provider-side prefix) and a `snat` (customer
    /// traffic leaving toward the provider) pair.
    fn render_downlink_ruleset(&self, ni: &NetworkInstance, is_hub: bool) -> String {
        let d_leg = downlink_leg(&ni.id);
        let mut out = String::new();
        out.push_str(&format!("table inet vpnc_{} {{\n", ni.id.replace('-', "_")));
        out.push_str("  chain prerouting {\n    type nat hook prerouting priority -100;\n");
        for conn in ni.connections.values() {
            for route in &conn.routes.ipv6 {
                if let Some(prefix) = route.nptv6_prefix {
                    out.push_str(&format!(
                        "    ip6 daddr {} iifname \"{d_leg}\" dnat to {}\n",
                        prefix, route.to
                    ));
                }
            }
        }
        out.push_str("  }\n");
        out.push_str("  chain postrouting {\n    type nat hook postrouting priority 100;\n");
        for conn in ni.connections.values() {
            for route in &conn.routes.ipv6 {
                if let Some(prefix) = route.nptv6_prefix {
                    out.push_str(&format!(
                        "    ip6 saddr {} oifname \"{d_leg}\" snat to {}\n",
                        route.to, prefix
                    ));
                }
            }
            if !is_hub {
                out.push_str(&format!(
                    "    oifname \"{}\" masquerade\n",
                    conn.intf_name()
                ));
            }
        }
        out.push_str("  }\n}\n");
        out
    }

    /// §4.4 step 1-6: keeps or recomputes the NPTv6 sub-prefix for every
    /// `nptv6: true` route on the instance, returning the assignments that
    /// changed so the caller can persist them back to the tenant's YAML.
    async fn reconcile_nptv6(&self, ni: &NetworkInstance) -> Result<Vec<NptAssignment>> {
        let service = self.state.service_config();
        let id = DownlinkId::parse(&ni.id)?;
        let scope = alloc::nptv6_scope(&service, id)?;

        let entry = self
            .npt_allocators
            .entry(ni.id.clone())
            .or_insert_with(|| Mutex::new(NptAllocator::new()));
        let mut allocator = entry.lock();

        // Seed the allocator with every route's already-valid prefix before
        // handing out anything new, so a fresh-process allocator (its
        // bitmap starts empty on every restart) can't hand a newly
        // allocated route a prefix overlapping one already on disk (§4.4
        // step 4's disjointness applies "including the one being
        // assigned", which needs every survivor reserved first).
        for conn in ni.connections.values() {
            for route in &conn.routes.ipv6 {
                if !route.nptv6 {
                    continue;
                }
                let valid_existing = route.nptv6_prefix.is_some_and(|p| {
                    p.prefix() == route.to.prefix() && network_contains(&scope, &p)
                });
                if let Some(p) = route.nptv6_prefix.filter(|_| valid_existing) {
                    allocator.reserve(p);
                }
            }
        }

        let mut assignments = Vec::new();
        for conn in ni.connections.values() {
            for (route_index, route) in conn.routes.ipv6.iter().enumerate() {
                if !route.nptv6 {
                    continue;
                }
                let valid_existing = route.nptv6_prefix.is_some_and(|p| {
                    p.prefix() == route.to.prefix() && network_contains(&scope, &p)
                });
                if valid_existing {
                    continue;
                }
                if route.to.prefix() < scope.prefix() {
                    warn!(
                        ni = %ni.id,
                        route = %route.to,
                        "route is larger than the NPTv6 scope, skipping NPT assignment"
                    );
                    continue;
                }
                match allocator.allocate(scope, route.to.prefix()) {
                    Ok(prefix) => assignments.push(NptAssignment {
                        conn_id: conn.id,
                        route_index,
                        prefix,
                    }),
                    Err(e) => warn!(ni = %ni.id, route = %route.to, error = %e, "NPTv6 allocation failed"),
                }
            }
        }
        Ok(assignments)
    }

    async fn sync_swanctl(&self, ni: &NetworkInstance, service: &ServiceConfig) -> Result<()> {
        let path = self.config.swanctl_conf_dir.join(format!("{}.conf", ni.id));
        match adapters::swanctl::render(&self.config.swanctl_conf_dir, &service.local_id, ni) {
            Some(rendered) => {
                tokio::fs::write(&rendered.path, &rendered.contents).await?;
            }
            None => {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        tokio::task::spawn_blocking(adapters::swanctl::load_all)
            .await
            .map_err(|e| Error::Internal(format!("swanctl reload task panicked: {e}")))??;
        Ok(())
    }

    // ---- Connection reconciliation -----------------------------------

    /// Builds the desired interface-name set, deletes stale connections
    /// (SSH first, since an SSH tunnel's transport may depend on a sibling
    /// connection's interface existing), then adds every connection in
    /// `ni_new` (§4.5 "Connection reconciliation").
    async fn reconcile_connections(
        &self,
        ns: &str,
        ni_new: &NetworkInstance,
        ni_prev: Option<&NetworkInstance>,
    ) -> Result<()> {
        let desired: BTreeSet<String> = ni_new.connections.values().map(|c| c.intf_name()).collect();

        if let Some(prev) = ni_prev {
            for stale in ssh_first(prev.connections.values().collect()) {
                if !desired.contains(&stale.intf_name()) {
                    self.delete_connection(ns, stale).await?;
                }
            }
        }

        for conn in ni_new.connections.values() {
            self.add_connection(ns, ni_new, conn).await?;
        }
        Ok(())
    }

    async fn add_connection(&self, ns: &str, ni: &NetworkInstance, conn: &Connection) -> Result<()> {
        let id = DownlinkId::parse(&ni.id).ok();
        match &conn.config {
            ConnectionConfig::Ipsec(_) => {
                let vpn_id = VpnId::for_network_instance(&ni.id, conn.id);
                self.kernel
                    .ensure_link(
                        "ni-EXTERNAL",
                        LinkSpec {
                            name: conn.intf_name(),
                            kind: LinkKind::Xfrm {
                                underlying_if_index: 0,
                                if_id: vpn_id.0,
                            },
                        },
                    )
                    .await?;
                self.kernel
                    .move_link("ni-EXTERNAL", &conn.intf_name(), ns)
                    .await?;
                self.kernel.set_link_state(ns, &conn.intf_name(), true).await?;
                self.assign_connection_addresses(ns, ni, conn, id).await?;
            }
            ConnectionConfig::Wireguard(_) => {
                self.kernel
                    .ensure_link(
                        "ni-EXTERNAL",
                        LinkSpec {
                            name: conn.intf_name(),
                            kind: LinkKind::Wireguard,
                        },
                    )
                    .await?;
                self.kernel
                    .move_link("ni-EXTERNAL", &conn.intf_name(), ns)
                    .await?;
                self.assign_connection_addresses(ns, ni, conn, id).await?;
            }
            ConnectionConfig::Physical(phys) => {
                self.kernel
                    .ensure_link(
                        ns,
                        LinkSpec {
                            name: phys.interface.clone(),
                            kind: LinkKind::Existing,
                        },
                    )
                    .await?;
                self.assign_connection_addresses(ns, ni, conn, id).await?;
            }
            ConnectionConfig::Ssh(cfg) => {
                match adapters::ssh::start(ns, &ni.id, conn.id, cfg).await {
                    Ok(_tunnel) => {}
                    Err(e) => warn!(ni = %ni.id, conn = conn.id, error = %e, "failed to start ssh tunnel"),
                }
            }
        }
        Ok(())
    }

    async fn assign_connection_addresses(
        &self,
        ns: &str,
        ni: &NetworkInstance,
        conn: &Connection,
        id: Option<DownlinkId>,
    ) -> Result<()> {
        self.kernel.flush_addresses(ns, &conn.intf_name()).await?;
        if let Some(explicit) = &conn.interface {
            if let Some(v4) = explicit.ipv4 {
                self.kernel
                    .replace_address(ns, &conn.intf_name(), IpNetwork::V4(v4))
                    .await?;
            }
            if let Some(v6) = explicit.ipv6 {
                self.kernel
                    .replace_address(ns, &conn.intf_name(), IpNetwork::V6(v6))
                    .await?;
            }
            return Ok(());
        }
        let Some(id) = id else { return Ok(()) };
        let service = self.state.service_config();
        if let Ok(v4) = alloc::interface_v4(&service, id, conn.id) {
            self.kernel
                .replace_address(ns, &conn.intf_name(), IpNetwork::V4(v4))
                .await?;
        }
        if let Ok(v6) = alloc::interface_v6(&service, id, conn.id) {
            self.kernel
                .replace_address(ns, &conn.intf_name(), IpNetwork::V6(v6))
                .await?;
        }
        Ok(())
    }

    async fn delete_connection(&self, ns: &str, conn: &Connection) -> Result<()> {
        if conn.is_ssh() {
            // The ssh adapter owns its own process handle; teardown here
            // is best-effort namespace cleanup, matching §4.5's "delete
            // SSH connections first" ordering without requiring the
            // reconciler to track live child processes across restarts.
            return Ok(());
        }
        if let ConnectionConfig::Physical(phys) = &conn.config {
            self.kernel.set_link_state(ns, &phys.interface, false).await?;
            return Ok(());
        }
        self.kernel.delete_link(ns, &conn.intf_name()).await
    }

    // ---- Teardown -----------------------------------------------------

    /// Deletes connections in reverse (SSH first), the veth to CORE, the
    /// Jool instance, then the namespace itself (§4.5 "Deletion").
    async fn delete_network_instance(&self, ni: &NetworkInstance) -> Result<()> {
        let ns = ni.netns_name();
        for conn in ssh_first(ni.connections.values().rev().collect()) {
            self.delete_connection(&ns, conn).await?;
        }
        if matches!(
            ni.kind,
            NetworkInstanceType::Downlink | NetworkInstanceType::Endpoint
        ) {
            let _ = adapters::jool::flush(&ns);
            self.npt_allocators.remove(&ni.id);
            self.state.forget_ni_lock(&ni.id);
        }
        self.kernel.delete_namespace(&ns).await?;
        let swanctl_path = self.config.swanctl_conf_dir.join(format!("{}.conf", ni.id));
        let _ = tokio::fs::remove_file(&swanctl_path).await;
        let _ = tokio::task::spawn_blocking(adapters::swanctl::load_all).await;
        info!(ni = %ni.id, "network instance torn down");
        Ok(())
    }
}

/// Orders SSH connections first (they're deleted before anything their
/// transport might depend on — §4.5's "SSH connections are deleted before
/// others because they depend on transport connections").
fn ssh_first(mut conns: Vec<&Connection>) -> Vec<&Connection> {
    conns.sort_by_key(|c| !c.is_ssh());
    conns
}

fn network_contains(scope: &ipnetwork::Ipv6Network, candidate: &ipnetwork::Ipv6Network) -> bool {
    let scope_lo = u128::from(scope.network());
    let scope_hi = scope_lo | ((1u128 << (128 - scope.prefix() as u32)) - 1);
    let cand_lo = u128::from(candidate.network());
    let cand_hi = cand_lo | ((1u128 << (128 - candidate.prefix() as u32)) - 1);
    scope_lo <= cand_lo && cand_hi <= scope_hi
}

/// A [`KernelOps`] fake that records every call it receives instead of
/// touching the kernel, so reconciler tests can assert on idempotence
/// (§8 invariant 4) and on the exact sequence of operations a reconciliation
/// pass issues, the way the teacher's own tests swap a fake in for
/// `QmpClient` rather than talking to real QEMU.
#[cfg(test)]
#[derive(Default)]
struct MockKernel {
    calls: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockKernel {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl KernelOps for MockKernel {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.record(format!("ensure_namespace({name})"));
        Ok(())
    }
    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.record(format!("delete_namespace({name})"));
        Ok(())
    }
    async fn ensure_link(&self, ns: &str, spec: vpnc_common::kernel::LinkSpec) -> Result<()> {
        self.record(format!("ensure_link({ns}, {})", spec.name));
        Ok(())
    }
    async fn delete_link(&self, ns: &str, name: &str) -> Result<()> {
        self.record(format!("delete_link({ns}, {name})"));
        Ok(())
    }
    async fn set_link_state(&self, ns: &str, name: &str, up: bool) -> Result<()> {
        self.record(format!("set_link_state({ns}, {name}, {up})"));
        Ok(())
    }
    async fn link_is_up(&self, ns: &str, name: &str) -> Result<bool> {
        self.record(format!("link_is_up({ns}, {name})"));
        Ok(true)
    }
    async fn flush_addresses(&self, ns: &str, name: &str) -> Result<()> {
        self.record(format!("flush_addresses({ns}, {name})"));
        Ok(())
    }
    async fn replace_address(&self, ns: &str, name: &str, addr: IpNetwork) -> Result<()> {
        self.record(format!("replace_address({ns}, {name}, {addr})"));
        Ok(())
    }
    async fn route(
        &self,
        ns: &str,
        op: RouteOp,
        dst: IpNetwork,
        via: Option<IpAddr>,
        ifname: Option<&str>,
        kind: RouteKind,
    ) -> Result<()> {
        self.record(format!(
            "route({ns}, {op:?}, {dst}, {via:?}, {ifname:?}, {kind:?})"
        ));
        Ok(())
    }
    async fn apply_nft_rules(&self, ns: &str, _rendered: &str) -> Result<()> {
        self.record(format!("apply_nft_rules({ns})"));
        Ok(())
    }
    async fn enable_forwarding(&self, ns: &str) -> Result<()> {
        self.record(format!("enable_forwarding({ns})"));
        Ok(())
    }
    async fn move_link(&self, from_ns: &str, name: &str, to_ns: &str) -> Result<()> {
        self.record(format!("move_link({from_ns}, {name}, {to_ns})"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnc_common::model::{
        BgpConfig, BgpGlobals, IpsecConfig, IpsecInitiation, Mode, PhysicalConfig, RouteV6, Routes,
        SshConfig,
    };

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            mode: Mode::Endpoint,
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
            prefix_downlink_nptv6: vec!["660::/12".parse().unwrap()],
            mgmt_address: None,
        }
    }

    fn reconciler_with_mock() -> (Reconciler, Arc<MockKernel>) {
        let kernel = Arc::new(MockKernel::default());
        let state = SharedState::new(service_config());
        let config = Arc::new(DaemonConfig::default());
        let reconciler = Reconciler::new(kernel.clone() as Arc<dyn KernelOps>, config, state);
        (reconciler, kernel)
    }

    fn external_ni_with_physical() -> NetworkInstance {
        let mut ni = NetworkInstance {
            id: "EXTERNAL".to_string(),
            kind: NetworkInstanceType::External,
            connections: Default::default(),
            nat64: false,
            outbound_nat: false,
        };
        ni.connections.insert(
            0,
            Connection {
                id: 0,
                metadata: serde_yaml::Value::Null,
                description: String::new(),
                interface: Some(vpnc_common::model::InterfaceAddresses {
                    ipv4: Some("198.51.100.1/24".parse().unwrap()),
                    ipv6: None,
                }),
                routes: Routes::default(),
                config: ConnectionConfig::Physical(PhysicalConfig {
                    interface: "eth0".to_string(),
                }),
            },
        );
        ni
    }

    #[tokio::test]
    async fn applying_same_new_and_prev_is_a_kernel_no_op() {
        // §8 invariant 4: apply(new, prev = new) must mutate nothing.
        let (reconciler, kernel) = reconciler_with_mock();
        let ni = external_ni_with_physical();
        let assignments = reconciler.apply(Some(&ni), Some(&ni)).await.unwrap();
        assert!(assignments.is_empty());
        assert!(kernel.calls().is_empty(), "calls = {:?}", kernel.calls());
    }

    #[tokio::test]
    async fn external_reconciliation_adopts_physical_interface_and_applies_ruleset() {
        let (reconciler, kernel) = reconciler_with_mock();
        let ni = external_ni_with_physical();
        reconciler.apply(Some(&ni), None).await.unwrap();

        let calls = kernel.calls();
        assert!(calls.iter().any(|c| c.starts_with("ensure_namespace(ni-EXTERNAL)")));
        assert!(calls.iter().any(|c| c.contains("ensure_link(ni-EXTERNAL, eth0)")));
        assert!(calls.iter().any(|c| c.contains("replace_address(ni-EXTERNAL, eth0, 198.51.100.1/24")));
        assert!(calls.iter().any(|c| c.contains("set_link_state(ni-EXTERNAL, eth0, true)")));
        assert!(calls.iter().any(|c| c.starts_with("apply_nft_rules(ni-EXTERNAL)")));
    }

    #[tokio::test]
    async fn core_reconciliation_enables_forwarding_and_drops_downlink_to_external_transit() {
        let (reconciler, kernel) = reconciler_with_mock();
        let ni = NetworkInstance {
            id: "CORE".to_string(),
            kind: NetworkInstanceType::Core,
            connections: Default::default(),
            nat64: false,
            outbound_nat: false,
        };
        reconciler.apply(Some(&ni), None).await.unwrap();

        let calls = kernel.calls();
        assert!(calls.iter().any(|c| c.starts_with("ensure_namespace(ni-CORE)")));
        assert!(calls.iter().any(|c| c == "enable_forwarding(ni-CORE)"));
        assert!(calls.iter().any(|c| c.starts_with("apply_nft_rules(ni-CORE)")));
    }

    #[tokio::test]
    async fn deleting_a_network_instance_tears_down_in_reverse_ssh_first_order() {
        let (reconciler, kernel) = reconciler_with_mock();
        let mut ni = NetworkInstance {
            id: "c0001-00".to_string(),
            kind: NetworkInstanceType::Downlink,
            connections: Default::default(),
            nat64: false,
            outbound_nat: false,
        };
        ni.connections.insert(0, physical_conn(0));
        ni.connections.insert(1, ssh_conn(1));

        reconciler.apply(None, Some(&ni)).await.unwrap();

        let calls = kernel.calls();
        let set_down = calls
            .iter()
            .position(|c| c.contains("set_link_state(ni-c0001-00, eth1, false)"))
            .expect("physical connection is set down");
        let delete_ns = calls
            .iter()
            .position(|c| c.starts_with("delete_namespace(ni-c0001-00)"))
            .expect("namespace is deleted");
        assert!(set_down < delete_ns, "calls = {calls:?}");
    }

    fn ipsec_conn(id: u8) -> Connection {
        Connection {
            id,
            metadata: serde_yaml::Value::Null,
            description: String::new(),
            interface: None,
            routes: Routes::default(),
            config: ConnectionConfig::Ipsec(IpsecConfig {
                local_addr: "198.51.100.1".parse().unwrap(),
                remote_addr: "203.0.113.1".parse().unwrap(),
                remote_id: "peer".to_string(),
                ike_version: 2,
                ike_proposals: vec!["aes256-sha256-modp2048".to_string()],
                ike_lifetime: 10800,
                ipsec_proposals: vec!["aes256-sha256".to_string()],
                ipsec_lifetime: 3600,
                initiation: IpsecInitiation::Start,
                psk: "secret".to_string(),
                local_ts: vec![],
                remote_ts: vec![],
            }),
        }
    }

    fn ssh_conn(id: u8) -> Connection {
        Connection {
            id,
            metadata: serde_yaml::Value::Null,
            description: String::new(),
            interface: None,
            routes: Routes::default(),
            config: ConnectionConfig::Ssh(SshConfig {
                username: "vpnc".to_string(),
                remote_addresses: vec!["203.0.113.2".parse().unwrap()],
                local_tunnel_id: 0,
                remote_tunnel_id: 0,
                remote_config: false,
            }),
        }
    }

    fn physical_conn(id: u8) -> Connection {
        Connection {
            id,
            metadata: serde_yaml::Value::Null,
            description: String::new(),
            interface: None,
            routes: Routes::default(),
            config: ConnectionConfig::Physical(PhysicalConfig {
                interface: "eth1".to_string(),
            }),
        }
    }

    #[test]
    fn ssh_connections_sort_first() {
        let ipsec = ipsec_conn(0);
        let physical = physical_conn(1);
        let ssh = ssh_conn(2);
        let ordered = ssh_first(vec![&ipsec, &physical, &ssh]);
        assert!(ordered[0].is_ssh());
    }

    #[test]
    fn nptv6_candidate_inside_scope_is_accepted() {
        let scope: ipnetwork::Ipv6Network = "660:0:c:1:0::/48".parse().unwrap();
        let candidate: ipnetwork::Ipv6Network = "660:0:c:1:0:1::/64".parse().unwrap();
        assert!(network_contains(&scope, &candidate));
    }

    #[test]
    fn nptv6_candidate_outside_scope_is_rejected() {
        let scope: ipnetwork::Ipv6Network = "660:0:c:1:0::/48".parse().unwrap();
        let candidate: ipnetwork::Ipv6Network = "660:0:c:2:0::/48".parse().unwrap();
        assert!(!network_contains(&scope, &candidate));
    }

    #[tokio::test]
    async fn nptv6_reconciliation_seeds_allocator_from_valid_existing_prefix_on_restart() {
        // A freshly-constructed allocator (as after a process restart) must
        // not hand a new route a prefix that overlaps one already valid on
        // disk for a sibling route on the same instance (§4.4 step 4).
        let mut svc = service_config();
        svc.mode = Mode::Hub;
        let kernel = Arc::new(MockKernel::default());
        let state = SharedState::new(svc.clone());
        let config = Arc::new(DaemonConfig::default());
        let reconciler = Reconciler::new(kernel as Arc<dyn KernelOps>, config, state);

        let id = vpnc_common::ids::DownlinkId::parse("c0001-00").unwrap();
        let scope = vpnc_common::alloc::nptv6_scope(&svc, id).unwrap();
        let existing_prefix = ipnetwork::Ipv6Network::new(scope.ip(), 64).unwrap();

        let mut ni = NetworkInstance {
            id: "c0001-00".to_string(),
            kind: NetworkInstanceType::Downlink,
            connections: Default::default(),
            nat64: false,
            outbound_nat: false,
        };

        let mut existing_conn = ipsec_conn(0);
        existing_conn.routes.ipv6.push(RouteV6 {
            to: "2001:db8:c57::/64".parse().unwrap(),
            via: None,
            nptv6: true,
            nptv6_prefix: Some(existing_prefix),
        });
        ni.connections.insert(0, existing_conn);

        let mut fresh_conn = ipsec_conn(1);
        fresh_conn.routes.ipv6.push(RouteV6 {
            to: "2001:db8:c58::/64".parse().unwrap(),
            via: None,
            nptv6: true,
            nptv6_prefix: None,
        });
        ni.connections.insert(1, fresh_conn);

        let assignments = reconciler.reconcile_nptv6(&ni).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_ne!(assignments[0].prefix, existing_prefix);
    }
}

//! File-watch controller (C7, §4.7).
//!
//! Watches the active config directory for tenant and `DEFAULT.yaml`
//! changes and drives them through the reconciler. `notify` is already in
//! the workspace's dependency table (unused anywhere in the teacher's own
//! code until now) — the debounce and the content-hash suppression below
//! are hand-rolled on top of it, the same way the route monitor hand-rolls
//! its own polling loop instead of reaching for a scheduling crate.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vpnc_common::loader::ConfigLoader;
use vpnc_common::model::{is_tenant_filename, Mode, Tenant};
use vpnc_common::state::SharedState;
use vpnc_common::Result;

use crate::config::DaemonConfig;
use crate::reconciler::{NptAssignment, Reconciler};

pub struct FileWatchController {
    config: Arc<DaemonConfig>,
    state: SharedState,
    reconciler: Reconciler,
    loader: ConfigLoader,
    /// Content hash of the last write this controller itself performed for
    /// a given path, so the watcher does not re-react to its own NPTv6
    /// write-back (§9 Open Question 1: "make the in-memory snapshot
    /// authoritative and suppress the next event with a content hash").
    self_writes: Mutex<HashMap<PathBuf, u64>>,
}

impl FileWatchController {
    pub fn new(reconciler: Reconciler, config: Arc<DaemonConfig>, state: SharedState) -> Self {
        let loader = ConfigLoader::new(config.service_path(), config.active_dir.clone());
        Self {
            config,
            state,
            reconciler,
            loader,
            self_writes: Mutex::new(HashMap::new()),
        }
    }

    /// Runs until `stop` is cancelled. Sets up a `notify` watch on the
    /// active directory, debounces bursts of events ~100ms, and dispatches
    /// each settled path to reconciliation.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to create file watcher, C7 disabled");
                return;
            }
        };
        if let Err(e) = watcher.watch(&self.config.active_dir, RecursiveMode::NonRecursive) {
            warn!(error = %e, dir = %self.config.active_dir.display(), "failed to watch active config directory");
            return;
        }
        info!(dir = %self.config.active_dir.display(), "watching active config directory");

        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                maybe = rx.recv() => {
                    match maybe {
                        Some(Ok(event)) => pending.extend(event.paths),
                        Some(Err(e)) => warn!(error = %e, "file watch error"),
                        None => break,
                    }
                }
            }

            // Debounce: keep coalescing events arriving within the window
            // instead of reacting to every one of an editor's save burst.
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.file_watch_debounce) => break,
                    maybe = rx.recv() => {
                        match maybe {
                            Some(Ok(event)) => pending.extend(event.paths),
                            Some(Err(e)) => warn!(error = %e, "file watch error"),
                            None => break,
                        }
                    }
                }
            }

            if stop.is_cancelled() {
                break;
            }
            for path in std::mem::take(&mut pending) {
                self.handle_path_event(&path).await;
            }
        }

        let _ = watcher.unwatch(&self.config.active_dir);
        info!("file watch controller stopped");
    }

    async fn handle_path_event(&self, path: &Path) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            return;
        };
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            return;
        }
        let is_default = stem == "DEFAULT";
        if !is_default && !is_tenant_filename(&stem) {
            return;
        }

        let mode = self.state.service_config().mode;
        if mode == Mode::Endpoint && !is_default {
            warn!(file = %path.display(), "endpoint mode ignores tenant files");
            return;
        }

        if !path.exists() {
            self.handle_delete(&stem, is_default).await;
            return;
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to read changed file");
                return;
            }
        };
        let hash = content_hash(&bytes);
        if self.self_writes.lock().get(path) == Some(&hash) {
            return;
        }

        if is_default {
            self.handle_service_change().await;
        } else {
            self.handle_tenant_change(&stem).await;
        }
    }

    async fn handle_delete(&self, stem: &str, is_default: bool) {
        if is_default {
            warn!("DEFAULT.yaml removed from active directory; keeping last-known service config");
            return;
        }
        let Some(prev) = self.state.remove_tenant(stem) else {
            return;
        };
        info!(tenant = stem, "tenant file deleted, tearing down its network instances");
        self.reconcile_transition(Some(&prev), None).await;
        self.maybe_regenerate_frr().await;
    }

    async fn handle_service_change(&self) {
        let doc = match self.loader.load_service() {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "failed to load DEFAULT.yaml, keeping prior service config");
                return;
            }
        };
        self.state.set_service_config(doc.service);

        let prev = self.state.tenant("DEFAULT");
        let assignments = self.reconcile_transition(prev.as_ref(), Some(&doc.tenant)).await;

        let mut tenant = doc.tenant;
        if !assignments.is_empty() {
            apply_npt_assignments(&mut tenant, &assignments);
            if let Err(e) = self.write_back(&tenant) {
                warn!(tenant = "DEFAULT", error = %e, "failed to persist NPTv6 write-back");
            }
        }
        self.state.set_tenant(tenant);
        self.maybe_regenerate_frr().await;
    }

    async fn handle_tenant_change(&self, stem: &str) {
        let new_tenant = match self.loader.load_tenant(stem) {
            Ok(t) => t,
            Err(e) => {
                warn!(tenant = stem, error = %e, "failed to load tenant file, keeping prior state");
                return;
            }
        };

        let prev = self.state.tenant(stem);
        let assignments = self.reconcile_transition(prev.as_ref(), Some(&new_tenant)).await;

        let mut tenant = new_tenant;
        if !assignments.is_empty() {
            apply_npt_assignments(&mut tenant, &assignments);
            if let Err(e) = self.write_back(&tenant) {
                warn!(tenant = stem, error = %e, "failed to persist NPTv6 write-back");
            }
        }
        self.state.set_tenant(tenant);
        self.maybe_regenerate_frr().await;
    }

    /// Walks the union of `prev`/`new`'s network-instance ids and calls C5
    /// per instance, returning every instance's NPTv6 write-back
    /// assignments keyed by instance id (§4.7).
    async fn reconcile_transition(
        &self,
        prev: Option<&Tenant>,
        new: Option<&Tenant>,
    ) -> Vec<(String, Vec<NptAssignment>)> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        if let Some(t) = prev {
            ids.extend(t.network_instances.keys().cloned());
        }
        if let Some(t) = new {
            ids.extend(t.network_instances.keys().cloned());
        }

        let mut out = Vec::new();
        for id in ids {
            let ni_new = new.and_then(|t| t.network_instances.get(&id));
            let ni_prev = prev.and_then(|t| t.network_instances.get(&id));
            match self.reconciler.apply(ni_new, ni_prev).await {
                Ok(assignments) if !assignments.is_empty() => out.push((id, assignments)),
                Ok(_) => {}
                Err(e) => warn!(ni = %id, error = %e, "reconciliation failed"),
            }
        }
        out
    }

    async fn maybe_regenerate_frr(&self) {
        let service = self.state.service_config();
        if service.mode != Mode::Hub {
            return;
        }
        if let Err(e) = self.reconciler.regenerate_frr(&service).await {
            warn!(error = %e, "failed to regenerate frr.conf");
        }
    }

    /// Writes `tenant`'s YAML back to both the active and candidate
    /// directories, atomically (temp file + rename), and records the
    /// active-directory write's content hash so the next `notify` event
    /// for that exact content is suppressed instead of re-triggering
    /// reconciliation against a no-op diff.
    fn write_back(&self, tenant: &Tenant) -> Result<()> {
        let yaml = serde_yaml::to_string(tenant)?;
        let hash = content_hash(yaml.as_bytes());

        let active_path = self.config.active_dir.join(format!("{}.yaml", tenant.id));
        atomic_write(&active_path, yaml.as_bytes())?;
        self.self_writes.lock().insert(active_path, hash);

        let candidate_path = self.config.candidate_dir.join(format!("{}.yaml", tenant.id));
        atomic_write(&candidate_path, yaml.as_bytes())?;

        info!(tenant = %tenant.id, "persisted NPTv6 assignment write-back");
        Ok(())
    }
}

fn apply_npt_assignments(tenant: &mut Tenant, assignments: &[(String, Vec<NptAssignment>)]) {
    for (ni_id, assigns) in assignments {
        let Some(ni) = tenant.network_instances.get_mut(ni_id) else {
            continue;
        };
        for a in assigns {
            if let Some(conn) = ni.connections.get_mut(&a.conn_id) {
                if let Some(route) = conn.routes.ipv6.get_mut(a.route_index) {
                    route.nptv6_prefix = Some(a.prefix);
                }
            }
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| vpnc_common::Error::Io(e.error))?;
    Ok(())
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnc_common::model::{NetworkInstance, NetworkInstanceType, RouteV6, Routes};

    #[test]
    fn content_hash_is_stable_for_identical_bytes() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }

    #[test]
    fn apply_npt_assignments_sets_matching_route_prefix() {
        use vpnc_common::model::{Connection, ConnectionConfig, PhysicalConfig};
        use crate::reconciler::NptAssignment;

        let mut ni = NetworkInstance {
            id: "c0001-00".to_string(),
            kind: NetworkInstanceType::Downlink,
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
                interface: None,
                routes: Routes {
                    ipv4: vec![],
                    ipv6: vec![RouteV6 {
                        to: "2001:db8:1::/64".parse().unwrap(),
                        via: None,
                        nptv6: true,
                        nptv6_prefix: None,
                    }],
                },
                config: ConnectionConfig::Physical(PhysicalConfig {
                    interface: "eth1".to_string(),
                }),
            },
        );
        let mut tenant = Tenant {
            id: "c0001".to_string(),
            name: String::new(),
            version: "0.0.12".to_string(),
            metadata: serde_yaml::Value::Null,
            network_instances: Default::default(),
        };
        tenant.network_instances.insert(ni.id.clone(), ni);

        let prefix: ipnetwork::Ipv6Network = "660:0:c:1:0::/64".parse().unwrap();
        let assignments = vec![(
            "c0001-00".to_string(),
            vec![NptAssignment {
                conn_id: 0,
                route_index: 0,
                prefix,
            }],
        )];
        apply_npt_assignments(&mut tenant, &assignments);

        let route = &tenant.network_instances["c0001-00"].connections[&0].routes.ipv6[0];
        assert_eq!(route.nptv6_prefix, Some(prefix));
    }
}

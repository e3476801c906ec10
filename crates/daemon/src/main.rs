//! `vpncd` — multi-tenant IPsec/VPN concentrator daemon (C8, §4.8).
//!
//! Bootstrap order: load `DEFAULT.yaml`; ensure the `DEFAULT` namespace
//! alias is mounted; reconcile `EXTERNAL` and `CORE`; start strongSwan
//! inside `EXTERNAL` and wait for VICI with retries; start the route/SA
//! monitor; in hub mode, `modprobe jool`, launch `vpncmangle` inside
//! `CORE` and start FRR; start the file-watch controller; load every
//! tenant file and converge it; then block on a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod monitor;
mod reconciler;
mod watch;

use config::DaemonConfig;
use monitor::Monitor;
use reconciler::Reconciler;
use vpnc_common::adapters::{self, vici::Session};
use vpnc_common::kernel::{shell, KernelOps, LinuxKernel, NetworkNamespace};
use vpnc_common::loader::ConfigLoader;
use vpnc_common::model::Mode;
use vpnc_common::state::SharedState;
use watch::FileWatchController;

#[derive(Parser)]
#[command(name = "vpncd")]
#[command(about = "Multi-tenant IPsec/VPN concentrator daemon")]
#[command(version)]
struct Cli {
    /// Daemon settings file (paths, poll intervals). Defaults to
    /// `/opt/ncubed/config/vpnc/vpncd.toml`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the active config directory from the settings file.
    #[arg(long)]
    active_dir: Option<PathBuf>,

    /// Overrides the candidate config directory from the settings file.
    #[arg(long)]
    candidate_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Run in the foreground. This daemon never detaches; the flag is
    /// accepted for CLI-surface parity with deployments that always pass
    /// it and is otherwise a no-op.
    #[arg(short, long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    info!("vpncd v{}", vpnc_common::VERSION);

    let config_path = cli.config.unwrap_or_else(vpnc_common::default_settings_path);
    let mut daemon_config = DaemonConfig::load(&config_path)?;
    if let Some(dir) = cli.active_dir {
        daemon_config.active_dir = dir;
    }
    if let Some(dir) = cli.candidate_dir {
        daemon_config.candidate_dir = dir;
    }
    let daemon_config = Arc::new(daemon_config);

    let loader = ConfigLoader::new(daemon_config.service_path(), daemon_config.active_dir.clone());
    let doc = match loader.load_service() {
        Ok(doc) => doc,
        Err(e) => {
            error!(error = %e, file = %daemon_config.service_path().display(), "failed to load DEFAULT.yaml, cannot start");
            std::process::exit(1);
        }
    };
    let mode = doc.service.mode;
    info!(?mode, "loaded service configuration");

    let external = doc.tenant.network_instances.get("EXTERNAL").cloned();
    let core = doc.tenant.network_instances.get("CORE").cloned();
    let (Some(external), Some(core)) = (external, core) else {
        error!("DEFAULT.yaml is missing its EXTERNAL or CORE network instance, cannot start");
        std::process::exit(1);
    };
    let external_ns = external.netns_name();
    let core_ns = core.netns_name();

    NetworkNamespace::ensure_default_alias()?;

    let kernel: Arc<dyn KernelOps> = Arc::new(LinuxKernel);
    let state = SharedState::new(doc.service);
    state.set_tenant(doc.tenant);

    let reconciler = Reconciler::new(kernel.clone(), daemon_config.clone(), state.clone());

    reconciler.apply(Some(&external), None).await?;
    reconciler.apply(Some(&core), None).await?;

    adapters::swanctl::start(&external_ns)?;
    wait_for_vici(&daemon_config).await?;
    info!("strongSwan VICI socket is ready");

    let monitor = Arc::new(Monitor::new(kernel.clone(), daemon_config.clone(), state.clone()));
    let monitor_handle = tokio::spawn(monitor.run());

    let vpncmangle_supervisor = if mode == Mode::Hub {
        if let Err(e) = shell::run_checked("modprobe", &["jool"]) {
            warn!(error = %e, "failed to load the jool kernel module");
        }
        let supervisor = adapters::vpncmangle::start(&daemon_config.install_dir, &core_ns).await?;
        adapters::frr::start(&core_ns)?;
        reconciler.regenerate_frr(&state.service_config()).await?;
        Some(supervisor)
    } else {
        None
    };

    let watch_controller = Arc::new(FileWatchController::new(
        reconciler.clone(),
        daemon_config.clone(),
        state.clone(),
    ));
    let watch_handle = tokio::spawn(watch_controller.run(state.stop_token()));

    load_and_converge_tenants(&loader, &reconciler, &state).await;

    info!("vpncd is up, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    state.request_shutdown();
    let _ = tokio::join!(monitor_handle, watch_handle);

    if let Some(supervisor) = vpncmangle_supervisor {
        let _ = adapters::vpncmangle::stop(supervisor).await;
        let _ = adapters::frr::stop(&core_ns);
    }
    let _ = adapters::swanctl::stop(&external_ns);

    info!("vpncd shutdown complete");
    Ok(())
}

/// Retries the VICI connect at `vici_retry_interval` up to
/// `vici_retry_attempts` times, matching the route/SA monitor's own retry
/// loop (§7 `ExternalServiceUnavailable`: "retry with backoff at startup
/// (≤10 attempts) then abort startup").
async fn wait_for_vici(config: &DaemonConfig) -> anyhow::Result<()> {
    for attempt in 0..config.vici_retry_attempts {
        match Session::connect(&config.vici_socket).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "VICI not ready yet, retrying");
                tokio::time::sleep(config.vici_retry_interval).await;
            }
        }
    }
    anyhow::bail!(
        "strongSwan VICI socket at {} never became reachable after {} attempts",
        config.vici_socket,
        config.vici_retry_attempts
    );
}

/// Loads every tenant file and converges it against an empty previous
/// state. `apply` is idempotent (every kernel primitive is an "ensure"),
/// so this safely re-applies tenants whose namespaces already exist from
/// before a restart as well as ones that don't exist yet.
async fn load_and_converge_tenants(loader: &ConfigLoader, reconciler: &Reconciler, state: &SharedState) {
    let tenants = match loader.load_tenants() {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to list tenant directory");
            return;
        }
    };
    info!(count = tenants.len(), "loaded tenant files");

    for (id, tenant) in tenants {
        for ni in tenant.network_instances.values() {
            if let Err(e) = reconciler.apply(Some(ni), None).await {
                warn!(tenant = %id, ni = %ni.id, error = %e, "failed to converge network instance at startup");
            }
        }
        state.set_tenant(tenant);
    }
}

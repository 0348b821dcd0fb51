//! Entry points behind the CLI subcommands.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use libpartition::PerfScheme;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{Agent, ConvergenceReport};
use crate::config::Config;
use crate::context::Context;
use crate::exec::{CommandExecutor, Executor};
use crate::inventory::discover_inventory;
use crate::mon::CliConnectionFactory;
use crate::proc::ProcManager;
use crate::state::remove_desired_device;
use crate::store::{ConfigStore, XlineStore};

async fn connect_store(cfg: &Config) -> Result<Arc<dyn ConfigStore>> {
    let store = XlineStore::new(&cfg.xline_config)
        .await
        .with_context(|| format!("failed to connect to xline at {:?}", cfg.xline_config.endpoints))?;
    Ok(Arc::new(store))
}

/// Run the agent until Ctrl-C, reconciling on every interval tick.
pub async fn run(cfg: Config) -> Result<()> {
    let store = connect_store(&cfg).await?;
    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor);
    let proc_man = ProcManager::new(executor.clone(), cfg.restart_policy());
    let factory = Arc::new(CliConnectionFactory::new(cfg.ceph_binary.clone()));
    let agent = Arc::new(Agent::new(factory, cfg.osd_settings()));
    let base = Context::new(
        cfg.node_id.clone(),
        cfg.config_dir.clone(),
        store,
        executor,
        proc_man,
    );
    agent
        .initialize(&base)
        .await
        .context("failed to initialize the osd agent")?;
    info!(node = cfg.node_id, config_dir = ?cfg.config_dir, "osd agent initialized");

    let cancel = CancellationToken::new();
    {
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl_c: {e:?}");
            } else {
                info!("Received CTRL-C, shutting down...");
            }
            token.cancel();
        });
    }

    let mut ticker = interval(cfg.reconcile_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match reconcile_once(&agent, &base).await {
            Ok(report) => log_report(&report),
            Err(e) => error!("reconciliation pass failed: {e:#}"),
        }
    }

    agent
        .destroy_local_service()
        .await
        .context("failed to stop local osds")?;
    info!("all local osds stopped");
    Ok(())
}

/// One full pass against a fresh inventory snapshot.
pub async fn reconcile_once(agent: &Arc<Agent>, base: &Context) -> Result<ConvergenceReport> {
    let inventory = discover_inventory(base.executor.as_ref())
        .await
        .context("failed to discover local disks")?;
    let ctx = Arc::new(base.clone().with_inventory(inventory));
    let completion = agent.configure_local_service(ctx).await?;
    Ok(completion.wait().await)
}

fn log_report(report: &ConvergenceReport) {
    for entry in &report.entries {
        for warning in &entry.warnings {
            warn!(unit = %entry.target, osd = ?entry.osd_id, "{warning}");
        }
        match &entry.error {
            Some(e) => error!(unit = %entry.target, osd = ?entry.osd_id, "not converged: {e}"),
            None => info!(unit = %entry.target, osd = ?entry.osd_id, state = %entry.state, "converged"),
        }
    }
}

pub fn print_scheme(cfg: &Config) -> Result<()> {
    let scheme = PerfScheme::load(&cfg.config_dir)
        .with_context(|| format!("failed to load partition scheme from {:?}", cfg.config_dir))?;
    println!("{}", serde_json::to_string_pretty(&scheme)?);
    Ok(())
}

pub async fn remove_device(cfg: &Config, disk_uuid: &str) -> Result<()> {
    let store = connect_store(cfg).await?;
    remove_desired_device(store.as_ref(), &cfg.node_id, disk_uuid)
        .await
        .with_context(|| format!("failed to remove device {disk_uuid}"))?;
    info!(node = cfg.node_id, disk_uuid, "device removed from desired state");
    Ok(())
}

//! Subsystem assembly and the daemon's run loop.
//!
//! Startup order:
//! 1. Create the state directories and open the store
//! 2. Build the host actuators and the ingress rule store
//! 3. Wire reconciler, worker, health monitor and facade together
//! 4. Queue recovery work for anything left unfinished by the last run
//! 5. Serve the API until SIGINT/SIGTERM, then stop the worker and probes

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use pvdify_actuator::{
    ContainerRuntime, JournalLogSource, LogSource, PodmanRuntime, ProcessSupervisor,
    SystemdSupervisor, UnitDefaults, UnitGenerator,
};
use pvdify_core::{DaemonConfig, UnitNaming};
use pvdify_health::HealthMonitor;
use pvdify_ingress::{FileIngressStore, IngressStore, IngressSynchronizer, MemoryIngressStore};
use pvdify_orchestrator::{Actuators, Orchestrator};
use pvdify_scheduler::{JobReceiver, Reconciler, RetryPolicy, Worker, job_queue};
use pvdify_state::{PortRange, StateStore};

/// Everything that reaches outside the process.
pub struct HostActuators {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub logs: Arc<dyn LogSource>,
    pub ingress: Arc<dyn IngressStore>,
}

impl HostActuators {
    /// systemd, podman and journald as configured. With the tunnel disabled
    /// the ingress rules are kept in memory only.
    pub fn from_config(config: &DaemonConfig) -> Self {
        let ingress: Arc<dyn IngressStore> = if config.tunnel.enabled {
            Arc::new(FileIngressStore::new(
                &config.tunnel.config,
                &config.tunnel.tunnel_id,
                &config.tunnel.credentials,
            ))
        } else {
            info!("tunnel disabled, ingress rules are not persisted");
            Arc::new(MemoryIngressStore::new())
        };
        Self {
            supervisor: Arc::new(SystemdSupervisor::new(&config.units.dir, config.units.user_mode)),
            runtime: Arc::new(PodmanRuntime::new(&config.runtime.podman)),
            logs: Arc::new(JournalLogSource::new(config.units.user_mode)),
            ingress,
        }
    }
}

/// The wired-up subsystems, ready to run.
pub struct Services {
    pub orchestrator: Orchestrator,
    pub worker: Worker,
    pub jobs: JobReceiver,
    pub health: Option<HealthMonitor>,
}

pub fn unit_defaults(config: &DaemonConfig) -> UnitDefaults {
    UnitDefaults {
        container_port: config.units.container_port,
        memory: config.units.memory.clone(),
        cpu: config.units.cpu.clone(),
        user: config.units.user.clone(),
        podman: config.runtime.podman.clone(),
        stop_timeout_secs: config.runtime.stop_timeout_secs,
    }
}

pub fn assemble(config: &DaemonConfig, store: StateStore, host: HostActuators) -> Services {
    let naming = UnitNaming::new(&config.units.namespace);

    let reconciler = Reconciler::new(
        store.clone(),
        host.supervisor.clone(),
        host.runtime.clone(),
        Arc::new(IngressSynchronizer::new(host.ingress)),
        UnitGenerator::new(naming.clone(), unit_defaults(config)),
        &config.state_dir,
    )
    .with_stop_timeout(Duration::from_secs(u64::from(config.runtime.stop_timeout_secs)));
    let worker = Worker::new(Arc::new(reconciler), RetryPolicy::from(&config.reconcile));

    let (tx, jobs) = job_queue();
    let mut orchestrator = Orchestrator::new(
        store.clone(),
        tx,
        Actuators {
            supervisor: host.supervisor,
            runtime: host.runtime,
            logs: host.logs,
        },
        naming,
        PortRange {
            start: config.ports.start,
            end: config.ports.end,
        },
    );

    let health = config.health.enabled.then(|| HealthMonitor::new(store));
    if let Some(monitor) = &health {
        orchestrator = orchestrator.with_health(monitor.clone());
    }

    Services {
        orchestrator,
        worker,
        jobs,
        health,
    }
}

/// Create `state_dir`, its subdirectories and the database's parent.
pub fn prepare_dirs(config: &DaemonConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.state_dir)?;
    for dir in config.state_subdirs() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    let store = StateStore::open(path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(listen = %config.listen, dev = config.dev, "Pvdify daemon starting");

    prepare_dirs(&config)?;
    let store = open_store(&config.database)?;
    let host = HostActuators::from_config(&config);
    let Services {
        orchestrator,
        worker,
        jobs,
        health,
    } = assemble(&config, store, host);

    let report = orchestrator.recover().await?;
    info!(
        reconciles = report.reconciles,
        deploys = report.deploys,
        teardowns = report.teardowns,
        "recovery queued"
    );

    // ── Background worker ──────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(jobs, shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = pvdify_api::build_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(monitor) = health {
        monitor.stop_all().await;
    }
    let _ = worker_handle.await;

    info!("Pvdify daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

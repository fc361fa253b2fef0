//! Health monitor: one probe task per app with a health check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use pvdify_state::{AppStatus, HealthCheck, HealthStatus, StateStore};

use crate::checker::{HealthTracker, http_probe};

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    /// What the task was started with, to skip needless restarts.
    target: (HealthCheck, u16),
}

/// Manages the probe tasks for all monitored apps.
#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    /// app name → slot
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing `127.0.0.1:{port}{check.path}` for `app`, replacing
    /// any monitor already running for it.
    pub async fn start_monitor(&self, app: &str, check: &HealthCheck, port: u16) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let app_owned = app.to_string();
        let check_owned = check.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            run_health_loop(&app_owned, &check_owned, port, state, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            app.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
                target: (check.clone(), port),
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%app, path = %check.path, port, "health monitor started");
    }

    pub async fn stop_monitor(&self, app: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(app) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%app, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (app, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%app, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Bring the running monitors in line with the store for one app:
    /// started or restarted when it has a health check and a port, stopped
    /// otherwise.
    pub async fn refresh(&self, app: &str) {
        let target = match self.state.get_app(app) {
            Ok(Some(a)) if a.status != AppStatus::Deleting => {
                a.healthcheck.zip(a.bound_port)
            }
            Ok(_) => None,
            Err(e) => {
                error!(%app, error = %e, "failed to load app for health monitor");
                return;
            }
        };
        match target {
            Some((check, port)) => {
                let unchanged = self
                    .monitors
                    .read()
                    .await
                    .get(app)
                    .is_some_and(|slot| slot.target == (check.clone(), port));
                if !unchanged {
                    self.start_monitor(app, &check, port).await;
                }
            }
            None => self.stop_monitor(app).await,
        }
    }

    /// Refresh every app in the store. Used at startup.
    pub async fn refresh_all(&self) {
        let apps = match self.state.list_apps() {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "failed to list apps for health monitor");
                return;
            }
        };
        for app in apps {
            self.refresh(&app.name).await;
        }
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        let mut apps: Vec<String> = monitors.keys().cloned().collect();
        apps.sort();
        apps
    }

    pub async fn is_monitoring(&self, app: &str) -> bool {
        self.monitors.read().await.contains_key(app)
    }
}

async fn run_health_loop(
    app: &str,
    check: &HealthCheck,
    port: u16,
    state: StateStore,
    mut shutdown: watch::Receiver<bool>,
) {
    let address = format!("127.0.0.1:{port}");
    let timeout = match check.timeout_secs {
        0 => Duration::from_secs(5),
        secs => Duration::from_secs(secs),
    };
    let mut tracker = HealthTracker::new(check);

    debug!(%app, %address, path = %check.path, "health loop starting");

    loop {
        let interval = tracker.next_interval();

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let result = http_probe(&address, &check.path, timeout).await;
                let prev = tracker.status();
                let next = tracker.record(result);
                if next != prev {
                    record_health(&state, app, next);
                }
            }
            _ = shutdown.changed() => {
                debug!(%app, "health loop shutting down");
                break;
            }
        }
    }
}

fn record_health(state: &StateStore, app: &str, status: HealthStatus) {
    match state.update_observation(app, |obs| obs.health = status) {
        Ok(Some(_)) => info!(%app, ?status, "health changed"),
        Ok(None) => debug!(%app, "app gone, health not recorded"),
        Err(e) => error!(%app, error = %e, "failed to record health status"),
    }
}

//! The orchestration facade.
//!
//! Every mutating operation follows the same shape: validate, take the
//! app's facade lock, commit desired state in one store transaction, then
//! enqueue a job for the worker and return. Actuation never runs under the
//! lock and its failures surface as observed state, not as errors here.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use pvdify_actuator::{ContainerRuntime, LogSource, ProcessSupervisor};
use pvdify_core::{KeyedLocks, UnitNaming, validate};
use pvdify_health::HealthMonitor;
use pvdify_scheduler::{Job, JobSender};
use pvdify_state::*;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{AppDetail, AppUpdate, RecoveryReport};

pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_RELEASE_LIMIT: usize = 20;
/// Creator recorded on releases produced by a rollback.
pub const ROLLBACK_CREATOR: &str = "rollback";

/// Host-side collaborators the facade queries directly.
#[derive(Clone)]
pub struct Actuators {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub logs: Arc<dyn LogSource>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: StateStore,
    pub(crate) jobs: JobSender,
    pub(crate) actuators: Actuators,
    pub(crate) naming: UnitNaming,
    ports: PortRange,
    locks: KeyedLocks,
    health: Option<HealthMonitor>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        jobs: JobSender,
        actuators: Actuators,
        naming: UnitNaming,
        ports: PortRange,
    ) -> Self {
        Self {
            store,
            jobs,
            actuators,
            naming,
            ports,
            locks: KeyedLocks::new(),
            health: None,
        }
    }

    pub fn with_health(mut self, monitor: HealthMonitor) -> Self {
        self.health = Some(monitor);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub async fn create_app(&self, name: &str, environment: Option<&str>) -> OrchestratorResult<App> {
        validate::app_name(name)?;
        let environment = environment
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_ENVIRONMENT);

        let _guard = self.locks.lock(name).await;
        let app = self.store.create_app(
            &NewApp {
                name: name.to_string(),
                environment: environment.to_string(),
            },
            self.ports,
        )?;
        info!(app = %app.name, port = ?app.bound_port, %environment, "app created");
        Ok(app)
    }

    pub fn get_app(&self, name: &str) -> OrchestratorResult<AppDetail> {
        let app = self.require_app(name)?;
        Ok(AppDetail {
            processes: self.store.list_processes(name)?,
            domains: self.store.list_domains(name)?,
            release: self.store.active_release(name)?,
            observed: self.store.get_observation(name)?,
            app,
        })
    }

    pub fn list_apps(&self) -> OrchestratorResult<Vec<App>> {
        Ok(self.store.list_apps()?)
    }

    /// Change resource limits or the health check. Units pick the new
    /// limits up on the next reconcile; running containers keep theirs
    /// until restarted.
    pub async fn update_app(&self, name: &str, update: AppUpdate) -> OrchestratorResult<App> {
        // Blank limits fall back to the daemon defaults.
        if let Some(resources) = &update.resources {
            if let Some(memory) = resources.memory.as_deref().filter(|m| !m.is_empty()) {
                validate::memory(memory)?;
            }
            if let Some(cpu) = resources.cpu.as_deref().filter(|c| !c.is_empty()) {
                validate::cpu(cpu)?;
            }
        }
        if let Some(check) = &update.healthcheck {
            validate::health_path(&check.path)?;
        }

        let app = {
            let _guard = self.locks.lock(name).await;
            self.require_mutable(name)?;
            self.store.update_app(name, |app| {
                if let Some(resources) = update.resources {
                    app.resources = resources;
                }
                if let Some(check) = update.healthcheck {
                    app.healthcheck = Some(check);
                }
            })?
        };
        self.jobs.enqueue(Job::Reconcile { app: name.to_string() })?;
        if let Some(monitor) = &self.health {
            monitor.refresh(name).await;
        }
        info!(app = %name, "app updated");
        Ok(app)
    }

    /// Mark the app for deletion and hand teardown to the worker. Every
    /// later mutation of the app is a conflict.
    pub async fn delete_app(&self, name: &str) -> OrchestratorResult<()> {
        {
            let _guard = self.locks.lock(name).await;
            self.require_mutable(name)?;
            self.store.set_app_status(name, AppStatus::Deleting)?;
        }
        if let Some(monitor) = &self.health {
            monitor.stop_monitor(name).await;
        }
        self.jobs.enqueue(Job::Teardown { app: name.to_string() })?;
        info!(app = %name, "app deletion scheduled");
        Ok(())
    }

    // ── Releases ───────────────────────────────────────────────────

    /// Append a pending release pinned to the current config and schedule
    /// its rollout.
    pub async fn deploy(&self, app: &str, image: &str, created_by: &str) -> OrchestratorResult<Release> {
        let image = image.trim();
        validate::image(image)?;
        let created_by = if created_by.trim().is_empty() { "unknown" } else { created_by.trim() };

        let release = {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
            self.store.append_release(app, image, ConfigPin::Latest, created_by)?
        };
        self.enqueue_deploy(&release)?;
        info!(%app, version = release.version, %image, %created_by, "release created");
        Ok(release)
    }

    /// Newest first. `limit` defaults to 20.
    pub fn list_releases(&self, app: &str, limit: Option<usize>) -> OrchestratorResult<Vec<Release>> {
        self.require_app(app)?;
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_RELEASE_LIMIT);
        Ok(self.store.list_releases(app, limit)?)
    }

    pub fn get_release(&self, app: &str, version: u32) -> OrchestratorResult<Release> {
        self.require_app(app)?;
        self.store
            .get_release(app, version)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("release {app}/v{version}")))
    }

    /// Append a copy of `version` (default: the one before the latest) and
    /// roll it out.
    pub async fn rollback(&self, app: &str, version: Option<u32>) -> OrchestratorResult<Release> {
        let release = {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
            self.store.rollback_release(app, version, ROLLBACK_CREATOR)?
        };
        self.enqueue_deploy(&release)?;
        info!(%app, version = release.version, image = %release.image, "rollback release created");
        Ok(release)
    }

    fn enqueue_deploy(&self, release: &Release) -> OrchestratorResult<()> {
        self.jobs.enqueue(Job::Deploy {
            app: release.app.clone(),
            version: release.version,
        })?;
        Ok(())
    }

    // ── Config ─────────────────────────────────────────────────────

    pub fn get_config(&self, app: &str) -> OrchestratorResult<ConfigSnapshot> {
        self.require_app(app)?;
        Ok(self.store.latest_config(app)?)
    }

    /// Merge `changes` into a new snapshot. Takes effect at the next deploy.
    pub async fn set_config(
        &self,
        app: &str,
        changes: &BTreeMap<String, String>,
    ) -> OrchestratorResult<ConfigSnapshot> {
        if changes.is_empty() {
            return Err(OrchestratorError::BadRequest("no config vars given".to_string()));
        }
        for key in changes.keys() {
            validate::config_key(key)?;
        }
        let _guard = self.locks.lock(app).await;
        self.require_mutable(app)?;
        let snapshot = self.store.set_config(app, changes)?;
        info!(%app, version = snapshot.version, keys = ?changes.keys().collect::<Vec<_>>(), "config set");
        Ok(snapshot)
    }

    pub async fn unset_config(&self, app: &str, key: &str) -> OrchestratorResult<ConfigSnapshot> {
        let _guard = self.locks.lock(app).await;
        self.require_mutable(app)?;
        let snapshot = self.store.unset_config(app, key)?;
        info!(%app, version = snapshot.version, %key, "config unset");
        Ok(snapshot)
    }

    // ── Domains ────────────────────────────────────────────────────

    pub fn list_domains(&self, app: &str) -> OrchestratorResult<Vec<Domain>> {
        self.require_app(app)?;
        Ok(self.store.list_domains(app)?)
    }

    /// Attach `hostname` (stored `pending`) and schedule an ingress sync.
    pub async fn add_domain(&self, app: &str, hostname: &str) -> OrchestratorResult<Domain> {
        let hostname = hostname.trim().to_ascii_lowercase();
        validate::hostname(&hostname)?;
        let domain = {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
            self.store.create_domain(app, &hostname)?
        };
        self.jobs.enqueue(Job::SyncIngress)?;
        info!(%app, %hostname, "domain added");
        Ok(domain)
    }

    pub async fn remove_domain(&self, app: &str, hostname: &str) -> OrchestratorResult<()> {
        let hostname = hostname.trim().to_ascii_lowercase();
        {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
            self.store.delete_domain(app, &hostname)?;
        }
        self.jobs.enqueue(Job::SyncIngress)?;
        info!(%app, %hostname, "domain removed");
        Ok(())
    }

    // ── Processes ──────────────────────────────────────────────────

    /// Persist new desired counts and schedule a reconcile. Every entry is
    /// validated before anything is written.
    pub async fn scale(
        &self,
        app: &str,
        counts: &BTreeMap<String, i64>,
    ) -> OrchestratorResult<Vec<ProcessDefinition>> {
        if counts.is_empty() {
            return Err(OrchestratorError::BadRequest("no process counts given".to_string()));
        }
        let mut desired = BTreeMap::new();
        for (process_type, count) in counts {
            validate::process_type(process_type)?;
            if *count < 0 {
                return Err(validate::ValidationError::NegativeCount {
                    process_type: process_type.clone(),
                    count: *count,
                }
                .into());
            }
            let count = u32::try_from(*count).map_err(|_| {
                OrchestratorError::BadRequest(format!("count {count} for {process_type} is too large"))
            })?;
            desired.insert(process_type.clone(), count);
        }

        let defs = {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
            self.store.scale_processes(app, &desired)?
        };
        self.jobs.enqueue(Job::Reconcile { app: app.to_string() })?;
        info!(%app, ?desired, "scale requested");
        Ok(defs)
    }

    pub async fn restart(&self, app: &str) -> OrchestratorResult<()> {
        {
            let _guard = self.locks.lock(app).await;
            self.require_mutable(app)?;
        }
        self.jobs.enqueue(Job::Restart { app: app.to_string() })?;
        info!(%app, "restart requested");
        Ok(())
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Re-derive outstanding work from the store after a restart: resync
    /// ingress, resume unfinished deploys and teardowns, reconcile the rest.
    pub async fn recover(&self) -> OrchestratorResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.jobs.enqueue(Job::SyncIngress)?;

        let mut unfinished: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for release in self.store.list_unfinished_releases()? {
            unfinished.entry(release.app).or_default().push(release.version);
        }

        for app in self.store.list_apps()? {
            if app.status == AppStatus::Deleting {
                self.jobs.enqueue(Job::Teardown { app: app.name.clone() })?;
                report.teardowns += 1;
                continue;
            }
            match unfinished.get(&app.name) {
                Some(versions) => {
                    for version in versions {
                        self.jobs.enqueue(Job::Deploy {
                            app: app.name.clone(),
                            version: *version,
                        })?;
                        report.deploys += 1;
                    }
                }
                None => {
                    self.jobs.enqueue(Job::Reconcile { app: app.name.clone() })?;
                    report.reconciles += 1;
                }
            }
        }

        if let Some(monitor) = &self.health {
            monitor.refresh_all().await;
        }
        info!(
            reconciles = report.reconciles,
            deploys = report.deploys,
            teardowns = report.teardowns,
            "startup recovery queued"
        );
        Ok(report)
    }

    // ── Helpers ────────────────────────────────────────────────────

    pub(crate) fn require_app(&self, name: &str) -> OrchestratorResult<App> {
        self.store
            .get_app(name)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("app {name}")))
    }

    /// The app, provided it is not being deleted.
    fn require_mutable(&self, name: &str) -> OrchestratorResult<App> {
        let app = self.require_app(name)?;
        if app.status == AppStatus::Deleting {
            debug!(app = %name, "rejecting mutation of deleting app");
            return Err(OrchestratorError::Conflict(format!("app {name} is being deleted")));
        }
        Ok(app)
    }
}

//! Process reconciler: turns persisted desired state into supervisor calls.
//!
//! Every entry point re-reads the store, so a job can be retried or replayed
//! after a crash without carrying state of its own. Supervisor and runtime
//! operations used here are idempotent.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use pvdify_actuator::{
    ContainerRuntime, HealthProbe, ProcessSupervisor, UnitGenerator, UnitSpec,
};
use pvdify_ingress::IngressSynchronizer;
use pvdify_state::*;

use crate::error::{SchedulerError, SchedulerResult};

/// Process type that publishes the app's bound port and receives traffic.
pub const WEB_PROCESS: &str = "web";

/// What a job changed on the host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Convergence {
    pub started: u32,
    pub restarted: u32,
    pub stopped: u32,
    /// Reason the job did less than asked, e.g. no release to run.
    pub note: Option<String>,
}

impl Convergence {
    fn noted(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: Convergence) {
        self.started += other.started;
        self.restarted += other.restarted;
        self.stopped += other.stopped;
        if other.note.is_some() {
            self.note = other.note;
        }
    }
}

pub struct Reconciler {
    store: StateStore,
    supervisor: Arc<dyn ProcessSupervisor>,
    runtime: Arc<dyn ContainerRuntime>,
    ingress: Arc<IngressSynchronizer>,
    units: UnitGenerator,
    state_dir: PathBuf,
    stop_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        supervisor: Arc<dyn ProcessSupervisor>,
        runtime: Arc<dyn ContainerRuntime>,
        ingress: Arc<IngressSynchronizer>,
        units: UnitGenerator,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            supervisor,
            runtime,
            ingress,
            units,
            state_dir: state_dir.into(),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Env file a release's units read their configuration from.
    pub fn env_file(&self, app: &str, version: u32) -> PathBuf {
        self.state_dir
            .join("releases")
            .join(app)
            .join(format!("v{version}.env"))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Roll out `version`: pull, write config, install units, converge with
    /// restarts, then activate and refresh ingress.
    pub async fn deploy(&self, app_name: &str, version: u32) -> SchedulerResult<Convergence> {
        let Some(app) = self.live_app(app_name)? else {
            return Ok(Convergence::noted("app is gone or being deleted"));
        };
        let release = self
            .store
            .get_release(app_name, version)?
            .ok_or_else(|| SchedulerError::ReleaseNotFound {
                app: app_name.to_string(),
                version,
            })?;
        if matches!(release.status, ReleaseStatus::Failed | ReleaseStatus::RolledBack) {
            return Ok(Convergence::noted(format!(
                "release v{version} is {}",
                release.status
            )));
        }

        let release = if release.status == ReleaseStatus::Active {
            release
        } else {
            self.store
                .set_release_status(app_name, version, ReleaseStatus::Deploying)?
        };
        info!(app = %app_name, version, image = %release.image, "deploying release");

        self.runtime.pull(&release.image).await?;
        let processes = self.store.list_processes(app_name)?;
        self.install_units(&app, &processes, &release).await?;

        let mut outcome = Convergence::default();
        for def in &processes {
            outcome.absorb(self.converge_process(def, true).await?);
        }

        self.store.activate_release(app_name, version)?;
        self.store.update_app(app_name, |a| {
            if a.status != AppStatus::Deleting {
                a.status = AppStatus::Running;
            }
        })?;
        info!(app = %app_name, version, started = outcome.started, restarted = outcome.restarted, "release active");

        self.sync_ingress().await?;
        Ok(outcome)
    }

    /// Start missing instances and stop surplus ones for every process type.
    /// Without an active release nothing is started.
    pub async fn reconcile(&self, app_name: &str) -> SchedulerResult<Convergence> {
        let Some(app) = self.live_app(app_name)? else {
            return Ok(Convergence::noted("app is gone or being deleted"));
        };
        let processes = self.store.list_processes(app_name)?;
        let mut outcome = Convergence::default();

        match self.store.active_release(app_name)? {
            Some(release) => {
                self.install_units(&app, &processes, &release).await?;
                for def in &processes {
                    outcome.absorb(self.converge_process(def, false).await?);
                }
            }
            None => {
                for def in &processes {
                    outcome.stopped += self.stop_surplus(def).await?;
                }
                outcome.note = Some("no active release".to_string());
            }
        }
        debug!(app = %app_name, ?outcome, "reconciled");
        Ok(outcome)
    }

    /// Stop then start every desired instance. Desired state is untouched.
    pub async fn restart(&self, app_name: &str) -> SchedulerResult<Convergence> {
        if self.live_app(app_name)?.is_none() {
            return Ok(Convergence::noted("app is gone or being deleted"));
        }
        if self.store.active_release(app_name)?.is_none() {
            return Ok(Convergence::noted("no active release"));
        }
        let naming = self.units.naming();
        let mut outcome = Convergence::default();
        for def in self.store.list_processes(app_name)? {
            let base = naming.base(&def.app, &def.process_type);
            for index in 1..=def.count {
                self.supervisor.stop(&base, index).await?;
                self.supervisor.start(&base, index).await?;
                outcome.restarted += 1;
            }
        }
        info!(app = %app_name, restarted = outcome.restarted, "app restarted");
        Ok(outcome)
    }

    /// Remove everything an app runs, then purge its records. Only acts on
    /// apps marked `deleting`.
    pub async fn teardown(&self, app_name: &str) -> SchedulerResult<Convergence> {
        let Some(app) = self.store.get_app(app_name)? else {
            return Ok(Convergence::noted("app already purged"));
        };
        if app.status != AppStatus::Deleting {
            return Ok(Convergence::noted("app is not being deleted"));
        }

        let naming = self.units.naming();
        let mut outcome = Convergence::default();
        for def in self.store.list_processes(app_name)? {
            let base = naming.base(&def.app, &def.process_type);
            let mut indices: BTreeSet<u32> =
                self.supervisor.list_instances(&base).await?.into_iter().collect();
            indices.extend(1..=def.count);
            for index in indices {
                self.stop_instance(&def.app, &def.process_type, index).await?;
                outcome.stopped += 1;
            }
            self.supervisor
                .remove_unit(&naming.template_unit(&def.app, &def.process_type))
                .await?;
        }
        self.supervisor.daemon_reload().await?;

        for domain in self.store.list_domains(app_name)? {
            self.ingress.remove_route(&domain.hostname).await?;
        }
        remove_dir_if_present(&self.state_dir.join("releases").join(app_name)).await?;

        self.store.purge_app(app_name)?;
        info!(app = %app_name, stopped = outcome.stopped, "app torn down");
        Ok(outcome)
    }

    /// Rewrite the rule file from every domain of every live app and record
    /// the result on the domains.
    pub async fn sync_ingress(&self) -> SchedulerResult<Convergence> {
        let apps: BTreeMap<String, App> = self
            .store
            .list_apps()?
            .into_iter()
            .filter(|a| a.status != AppStatus::Deleting)
            .map(|a| (a.name.clone(), a))
            .collect();

        let mut desired = BTreeMap::new();
        let mut routed = Vec::new();
        for domain in self.store.list_all_domains()? {
            if domain.status == DomainStatus::Deleting {
                continue;
            }
            match apps.get(&domain.app).and_then(|a| a.bound_port) {
                Some(port) => {
                    desired.insert(domain.hostname.clone(), port);
                    routed.push(domain);
                }
                None => debug!(hostname = %domain.hostname, "domain has no routable app"),
            }
        }

        let stats = match self.ingress.sync(&desired).await {
            Ok(stats) => stats,
            Err(e) => {
                for domain in routed.iter().filter(|d| d.status == DomainStatus::Pending) {
                    self.store
                        .set_domain_status(&domain.hostname, DomainStatus::Failed)?;
                }
                return Err(e.into());
            }
        };
        for domain in routed.iter().filter(|d| d.status != DomainStatus::Active) {
            self.store
                .set_domain_status(&domain.hostname, DomainStatus::Active)?;
        }

        Ok(Convergence {
            started: stats.added,
            restarted: stats.updated,
            stopped: stats.removed,
            note: None,
        })
    }

    /// Record a deploy that ran out of attempts.
    pub fn fail_deploy(&self, app_name: &str, version: u32) -> SchedulerResult<()> {
        match self.store.get_release(app_name, version)? {
            Some(release) if release.status.is_unfinished() => {
                self.store
                    .set_release_status(app_name, version, ReleaseStatus::Failed)?;
            }
            _ => {}
        }
        if self.live_app(app_name)?.is_some() {
            self.store.set_app_status(app_name, AppStatus::Failed)?;
        }
        warn!(app = %app_name, version, "deploy marked failed");
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn live_app(&self, name: &str) -> SchedulerResult<Option<App>> {
        Ok(self
            .store
            .get_app(name)?
            .filter(|a| a.status != AppStatus::Deleting))
    }

    fn unit_spec(&self, app: &App, def: &ProcessDefinition, release: &Release) -> UnitSpec {
        let web = def.process_type == WEB_PROCESS;
        UnitSpec {
            app: app.name.clone(),
            process_type: def.process_type.clone(),
            image: release.image.clone(),
            host_port: if web { app.bound_port } else { None },
            container_port: None,
            memory: app.resources.memory.clone(),
            cpu: app.resources.cpu.clone(),
            command: def.command.clone(),
            env_file: self.env_file(&app.name, release.version),
            health: app.healthcheck.as_ref().filter(|_| web).map(|h| HealthProbe {
                path: h.path.clone(),
                interval_secs: h.interval_secs,
                timeout_secs: h.timeout_secs,
                retries: h.retries,
            }),
        }
    }

    async fn install_units(
        &self,
        app: &App,
        processes: &[ProcessDefinition],
        release: &Release,
    ) -> SchedulerResult<()> {
        self.write_env_file(release).await?;
        for def in processes {
            let spec = self.unit_spec(app, def, release);
            self.supervisor
                .install_unit(&self.units.file_name(&spec), &self.units.render(&spec))
                .await?;
        }
        self.supervisor.daemon_reload().await?;
        Ok(())
    }

    async fn write_env_file(&self, release: &Release) -> SchedulerResult<PathBuf> {
        let snapshot = match self
            .store
            .get_config_version(&release.app, release.config_version)?
        {
            Some(snapshot) => snapshot,
            None => {
                warn!(app = %release.app, config_version = release.config_version, "pinned config missing, using empty environment");
                ConfigSnapshot::empty(&release.app)
            }
        };
        let path = self.env_file(&release.app, release.version);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SchedulerError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, render_env(&snapshot.vars))
            .await
            .map_err(|source| SchedulerError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Indices the supervisor knows about and reports active.
    async fn running_indices(&self, base: &str) -> SchedulerResult<BTreeSet<u32>> {
        let mut running = BTreeSet::new();
        for index in self.supervisor.list_instances(base).await? {
            match self.supervisor.status(base, index).await {
                Ok(status) if status.is_active() => {
                    running.insert(index);
                }
                Ok(_) => {}
                Err(e) => debug!(unit = %base, index, error = %e, "status unavailable"),
            }
        }
        Ok(running)
    }

    async fn converge_process(
        &self,
        def: &ProcessDefinition,
        restart_existing: bool,
    ) -> SchedulerResult<Convergence> {
        let base = self.units.naming().base(&def.app, &def.process_type);
        let running = self.running_indices(&base).await?;
        let mut outcome = Convergence::default();

        for index in 1..=def.count {
            if running.contains(&index) {
                if restart_existing {
                    self.supervisor.restart(&base, index).await?;
                    outcome.restarted += 1;
                }
            } else {
                self.supervisor.start(&base, index).await?;
                self.supervisor.enable(&base, index).await?;
                outcome.started += 1;
            }
        }
        outcome.stopped = self.stop_surplus(def).await?;
        Ok(outcome)
    }

    async fn stop_surplus(&self, def: &ProcessDefinition) -> SchedulerResult<u32> {
        let base = self.units.naming().base(&def.app, &def.process_type);
        let mut stopped = 0;
        for index in self.supervisor.list_instances(&base).await? {
            if index > def.count {
                self.stop_instance(&def.app, &def.process_type, index).await?;
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Stop, disable and remove the container of one instance.
    async fn stop_instance(&self, app: &str, process_type: &str, index: u32) -> SchedulerResult<()> {
        let naming = self.units.naming();
        let base = naming.base(app, process_type);
        self.supervisor.stop(&base, index).await?;
        self.supervisor.disable(&base, index).await?;
        let container = naming.container(app, process_type, index);
        self.runtime.stop(&container, self.stop_timeout).await?;
        self.runtime.remove(&container, true).await?;
        debug!(%app, %process_type, index, "instance removed");
        Ok(())
    }
}

/// `KEY=value` lines for podman's `--env-file`. Multi-line values cannot be
/// expressed in that format and are skipped.
fn render_env(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        if value.contains('\n') {
            warn!(%key, "skipping multi-line config value");
            continue;
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

async fn remove_dir_if_present(dir: &Path) -> SchedulerResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SchedulerError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pvdify_actuator::UnitDefaults;
    use pvdify_actuator::fake::{FakeRuntime, FakeSupervisor};
    use pvdify_core::UnitNaming;
    use pvdify_ingress::{IngressStore, MemoryIngressStore};

    pub(crate) const POOL: PortRange = PortRange { start: 3000, end: 3999 };

    pub(crate) struct Harness {
        pub store: StateStore,
        pub supervisor: FakeSupervisor,
        pub runtime: FakeRuntime,
        pub rules: Arc<MemoryIngressStore>,
        pub reconciler: Arc<Reconciler>,
        pub _dir: tempfile::TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let supervisor = FakeSupervisor::new();
        let runtime = FakeRuntime::new();
        let rules = Arc::new(MemoryIngressStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(supervisor.clone()),
            Arc::new(runtime.clone()),
            Arc::new(IngressSynchronizer::new(rules.clone())),
            UnitGenerator::new(UnitNaming::default(), UnitDefaults::default()),
            dir.path(),
        );
        Harness {
            store,
            supervisor,
            runtime,
            rules,
            reconciler: Arc::new(reconciler),
            _dir: dir,
        }
    }

    pub(crate) fn create(h: &Harness, name: &str) -> App {
        h.store
            .create_app(
                &NewApp {
                    name: name.to_string(),
                    environment: "production".to_string(),
                },
                POOL,
            )
            .unwrap()
    }

    fn scale(h: &Harness, app: &str, pt: &str, count: u32) {
        h.store
            .scale_processes(app, &BTreeMap::from([(pt.to_string(), count)]))
            .unwrap();
    }

    #[tokio::test]
    async fn deploy_starts_units_and_activates() {
        let h = harness();
        create(&h, "shop");
        h.store
            .set_config("shop", &BTreeMap::from([("DATABASE_URL".to_string(), "pg://db".to_string())]))
            .unwrap();
        let release = h
            .store
            .append_release("shop", "img:v1", ConfigPin::Latest, "alice")
            .unwrap();

        let outcome = h.reconciler.deploy("shop", release.version).await.unwrap();
        assert_eq!(outcome.started, 1);

        assert_eq!(h.runtime.pulls(), vec!["img:v1"]);
        assert_eq!(h.supervisor.running("pvdify-shop-web"), vec![1]);
        assert!(h.supervisor.is_enabled("pvdify-shop-web", 1));
        let unit = h.supervisor.unit_file("pvdify-shop-web@.service").unwrap();
        assert!(unit.contains("-p 3000:3000"));
        assert!(unit.contains("v1.env"));

        let env = std::fs::read_to_string(h.reconciler.env_file("shop", 1)).unwrap();
        assert_eq!(env, "DATABASE_URL=pg://db\n");

        let active = h.store.active_release("shop").unwrap().unwrap();
        assert_eq!(active.version, 1);
        assert_eq!(h.store.get_app("shop").unwrap().unwrap().status, AppStatus::Running);
    }

    #[tokio::test]
    async fn second_deploy_restarts_and_demotes() {
        let h = harness();
        create(&h, "shop");
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.reconciler.deploy("shop", v1.version).await.unwrap();
        let v2 = h.store.append_release("shop", "img:v2", ConfigPin::Latest, "a").unwrap();
        let outcome = h.reconciler.deploy("shop", v2.version).await.unwrap();

        assert_eq!(outcome.restarted, 1);
        assert_eq!(outcome.started, 0);
        let releases = h.store.list_releases("shop", 10).unwrap();
        assert_eq!(releases[0].status, ReleaseStatus::Active);
        assert_eq!(releases[1].status, ReleaseStatus::RolledBack);
    }

    #[tokio::test]
    async fn scale_down_stops_and_removes_surplus() {
        let h = harness();
        create(&h, "shop");
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.reconciler.deploy("shop", v1.version).await.unwrap();

        scale(&h, "shop", "web", 3);
        let up = h.reconciler.reconcile("shop").await.unwrap();
        assert_eq!(up.started, 2);
        assert_eq!(h.supervisor.running("pvdify-shop-web"), vec![1, 2, 3]);

        scale(&h, "shop", "web", 1);
        let down = h.reconciler.reconcile("shop").await.unwrap();
        assert_eq!(down.stopped, 2);
        assert_eq!(h.supervisor.running("pvdify-shop-web"), vec![1]);
        assert!(!h.supervisor.is_enabled("pvdify-shop-web", 2));
        assert_eq!(
            h.runtime.removed(),
            vec!["pvdify-shop-web-2", "pvdify-shop-web-3"]
        );
    }

    #[tokio::test]
    async fn reconcile_without_release_starts_nothing() {
        let h = harness();
        create(&h, "shop");
        h.supervisor.set_running("pvdify-shop-web", 2);

        let outcome = h.reconciler.reconcile("shop").await.unwrap();
        assert_eq!(outcome.started, 0);
        assert_eq!(outcome.stopped, 1);
        assert_eq!(outcome.note.as_deref(), Some("no active release"));
        assert!(h.supervisor.running("pvdify-shop-web").is_empty());
    }

    #[tokio::test]
    async fn worker_processes_get_no_port_mapping() {
        let h = harness();
        create(&h, "shop");
        scale(&h, "shop", "worker", 2);
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.reconciler.deploy("shop", v1.version).await.unwrap();

        let unit = h.supervisor.unit_file("pvdify-shop-worker@.service").unwrap();
        assert!(!unit.contains("-p "));
        assert_eq!(h.supervisor.running("pvdify-shop-worker"), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_start_leaves_release_deploying() {
        let h = harness();
        create(&h, "shop");
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.supervisor.fail_always("start");

        let err = h.reconciler.deploy("shop", v1.version).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Actuator(_)));
        assert!(err.is_retryable());
        let release = h.store.get_release("shop", 1).unwrap().unwrap();
        assert_eq!(release.status, ReleaseStatus::Deploying);

        h.reconciler.fail_deploy("shop", 1).unwrap();
        let release = h.store.get_release("shop", 1).unwrap().unwrap();
        assert_eq!(release.status, ReleaseStatus::Failed);
        assert_eq!(h.store.get_app("shop").unwrap().unwrap().status, AppStatus::Failed);
    }

    #[tokio::test]
    async fn restart_cycles_desired_instances() {
        let h = harness();
        create(&h, "shop");
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.reconciler.deploy("shop", v1.version).await.unwrap();

        let outcome = h.reconciler.restart("shop").await.unwrap();
        assert_eq!(outcome.restarted, 1);
        let calls = h.supervisor.calls();
        let tail: Vec<_> = calls.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec!["stop pvdify-shop-web@1", "start pvdify-shop-web@1"]);
    }

    #[tokio::test]
    async fn ingress_sync_marks_domains_active() {
        let h = harness();
        create(&h, "shop");
        h.store.create_domain("shop", "shop.example.com").unwrap();

        h.reconciler.sync_ingress().await.unwrap();
        let cfg = h.rules.load().unwrap();
        assert_eq!(cfg.ingress[0].service, "http://localhost:3000");
        assert_eq!(
            h.store.get_domain("shop.example.com").unwrap().unwrap().status,
            DomainStatus::Active
        );
    }

    #[tokio::test]
    async fn ingress_failure_marks_pending_domains_failed() {
        let h = harness();
        create(&h, "shop");
        h.store.create_domain("shop", "shop.example.com").unwrap();
        h.rules.set_fail_saves(true);

        assert!(h.reconciler.sync_ingress().await.is_err());
        assert_eq!(
            h.store.get_domain("shop.example.com").unwrap().unwrap().status,
            DomainStatus::Failed
        );
    }

    #[tokio::test]
    async fn teardown_removes_everything() {
        let h = harness();
        create(&h, "shop");
        h.store.create_domain("shop", "shop.example.com").unwrap();
        let v1 = h.store.append_release("shop", "img:v1", ConfigPin::Latest, "a").unwrap();
        h.reconciler.deploy("shop", v1.version).await.unwrap();
        assert_eq!(h.rules.load().unwrap().routes().len(), 1);

        // Only apps marked for deletion are torn down.
        let skipped = h.reconciler.teardown("shop").await.unwrap();
        assert!(skipped.note.is_some());

        h.store.set_app_status("shop", AppStatus::Deleting).unwrap();
        h.reconciler.teardown("shop").await.unwrap();

        assert!(h.supervisor.running("pvdify-shop-web").is_empty());
        assert!(h.supervisor.unit_files().is_empty());
        assert!(h.rules.load().unwrap().routes().is_empty());
        assert!(h.store.get_app("shop").unwrap().is_none());
        assert!(!h.reconciler.env_file("shop", 1).exists());

        // A replay after the purge is harmless.
        h.reconciler.teardown("shop").await.unwrap();
    }

    #[test]
    fn env_rendering_skips_multiline_values() {
        let vars = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "x\ny".to_string()),
            ("C".to_string(), "a=b".to_string()),
        ]);
        assert_eq!(render_env(&vars), "A=1\nC=a=b\n");
    }
}

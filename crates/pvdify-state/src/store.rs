//! StateStore: redb-backed state persistence for Pvdify.
//!
//! This module holds the store handle plus apps (with port allocation),
//! process definitions, domains, and observed state. The release ledger and
//! config snapshots live in [`crate::releases`] and [`crate::config`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        txn.open_table(PROCESSES).map_err(map_err!(Table))?;
        txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        txn.open_table(OBSERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Insert a new app, bind it a port from `pool`, and give it one `web`
    /// process. Duplicate check, port choice and inserts share one write
    /// transaction.
    pub fn create_app(&self, new: &NewApp, pool: PortRange) -> StateResult<App> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let app = {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            if apps.get(new.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("app {}", new.name)));
            }
            let port = allocate_port(&apps, pool)?;
            let app = App {
                name: new.name.clone(),
                environment: new.environment.clone(),
                status: AppStatus::Created,
                image: None,
                bound_port: Some(port),
                resources: ResourceLimits::default(),
                healthcheck: None,
                created_at: now,
                updated_at: now,
            };
            apps.insert(new.name.as_str(), encode(&app)?.as_slice())
                .map_err(map_err!(Write))?;

            let web = ProcessDefinition {
                app: new.name.clone(),
                process_type: "web".to_string(),
                command: None,
                count: 1,
            };
            let mut processes = txn.open_table(PROCESSES).map_err(map_err!(Table))?;
            let key = process_key(&new.name, "web");
            processes
                .insert(key.as_str(), encode(&web)?.as_slice())
                .map_err(map_err!(Write))?;
            app
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %app.name, port = ?app.bound_port, "app created");
        Ok(app)
    }

    pub fn get_app(&self, name: &str) -> StateResult<Option<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        load(&table, name)
    }

    /// All apps, ordered by name.
    pub fn list_apps(&self) -> StateResult<Vec<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Apply `f` to the stored app and persist the result.
    pub fn update_app(&self, name: &str, f: impl FnOnce(&mut App)) -> StateResult<App> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let app = {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let mut app = require_app(&apps, name)?;
            f(&mut app);
            app.updated_at = epoch_secs();
            apps.insert(name, encode(&app)?.as_slice())
                .map_err(map_err!(Write))?;
            app
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(app)
    }

    pub fn set_app_status(&self, name: &str, status: AppStatus) -> StateResult<App> {
        self.update_app(name, |app| app.status = status)
    }

    /// Remove every record belonging to `name` in one transaction, including
    /// its sequences. Returns false if the app did not exist.
    pub fn purge_app(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let existed = apps.remove(name).map_err(map_err!(Write))?.is_some();

            for def in [RELEASES, CONFIGS, PROCESSES] {
                let mut table = txn.open_table(def).map_err(map_err!(Table))?;
                remove_app_range(&mut table, name)?;
            }

            let mut seqs = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let (lo, hi) = app_range(name);
            let keys: Vec<String> = collect_keys(seqs.range(lo.as_str()..hi.as_str()))?;
            for key in keys {
                seqs.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut domains = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            let mut owned = Vec::new();
            for entry in domains.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let domain: Domain = decode(value.value())?;
                if domain.app == name {
                    owned.push(key.value().to_string());
                }
            }
            for host in owned {
                domains.remove(host.as_str()).map_err(map_err!(Write))?;
            }

            let mut obs = txn.open_table(OBSERVATIONS).map_err(map_err!(Table))?;
            obs.remove(name).map_err(map_err!(Write))?;
            existed
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %name, existed, "app purged");
        Ok(existed)
    }

    // ── Processes ──────────────────────────────────────────────────

    /// Process definitions of an app, ordered by type name.
    pub fn list_processes(&self, app: &str) -> StateResult<Vec<ProcessDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROCESSES).map_err(map_err!(Table))?;
        let (lo, hi) = app_range(app);
        let mut results = Vec::new();
        for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn get_process(&self, app: &str, process_type: &str) -> StateResult<Option<ProcessDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROCESSES).map_err(map_err!(Table))?;
        load(&table, &process_key(app, process_type))
    }

    /// Set desired counts for several process types at once. Types not yet
    /// defined are created without a command override. Returns every
    /// definition of the app afterwards.
    pub fn scale_processes(
        &self,
        app: &str,
        counts: &BTreeMap<String, u32>,
    ) -> StateResult<Vec<ProcessDefinition>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let defs = {
            let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            require_app(&apps, app)?;

            let mut table = txn.open_table(PROCESSES).map_err(map_err!(Table))?;
            for (process_type, count) in counts {
                let key = process_key(app, process_type);
                let mut def: ProcessDefinition =
                    load(&table, &key)?.unwrap_or_else(|| ProcessDefinition {
                        app: app.to_string(),
                        process_type: process_type.clone(),
                        command: None,
                        count: 0,
                    });
                def.count = *count;
                table
                    .insert(key.as_str(), encode(&def)?.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let (lo, hi) = app_range(app);
            let mut defs = Vec::new();
            for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                defs.push(decode(value.value())?);
            }
            defs
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, ?counts, "processes scaled");
        Ok(defs)
    }

    // ── Domains ────────────────────────────────────────────────────

    /// Attach `hostname` to `app` in `pending` state. A hostname belongs to
    /// at most one app.
    pub fn create_domain(&self, app: &str, hostname: &str) -> StateResult<Domain> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let domain = {
            let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            require_app(&apps, app)?;

            let mut table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            if let Some(existing) = load::<Domain>(&table, hostname)? {
                return Err(StateError::AlreadyExists(format!(
                    "domain {hostname} (attached to {})",
                    existing.app
                )));
            }
            let domain = Domain {
                hostname: hostname.to_string(),
                app: app.to_string(),
                status: DomainStatus::Pending,
                dns_record_id: None,
                created_at: epoch_secs(),
            };
            table
                .insert(hostname, encode(&domain)?.as_slice())
                .map_err(map_err!(Write))?;
            domain
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, %hostname, "domain created");
        Ok(domain)
    }

    pub fn get_domain(&self, hostname: &str) -> StateResult<Option<Domain>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        load(&table, hostname)
    }

    pub fn list_domains(&self, app: &str) -> StateResult<Vec<Domain>> {
        Ok(self
            .list_all_domains()?
            .into_iter()
            .filter(|d| d.app == app)
            .collect())
    }

    /// Every domain across apps, ordered by hostname.
    pub fn list_all_domains(&self) -> StateResult<Vec<Domain>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn set_domain_status(&self, hostname: &str, status: DomainStatus) -> StateResult<Domain> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let domain = {
            let mut table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            let mut domain: Domain = load(&table, hostname)?
                .ok_or_else(|| StateError::NotFound(format!("domain {hostname}")))?;
            domain.status = status;
            table
                .insert(hostname, encode(&domain)?.as_slice())
                .map_err(map_err!(Write))?;
            domain
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(domain)
    }

    /// Delete `hostname` if it belongs to `app`.
    pub fn delete_domain(&self, app: &str, hostname: &str) -> StateResult<Domain> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let domain = {
            let mut table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            let domain: Domain = load(&table, hostname)?
                .filter(|d: &Domain| d.app == app)
                .ok_or_else(|| StateError::NotFound(format!("domain {hostname} for app {app}")))?;
            table.remove(hostname).map_err(map_err!(Write))?;
            domain
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, %hostname, "domain deleted");
        Ok(domain)
    }

    // ── Observed state ─────────────────────────────────────────────

    pub fn get_observation(&self, app: &str) -> StateResult<Option<AppObservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBSERVATIONS).map_err(map_err!(Table))?;
        load(&table, app)
    }

    /// Apply `f` to the app's observation, creating a default one first if
    /// needed. Returns `None` without writing when the app no longer exists,
    /// so late reports from background tasks cannot resurrect a purged app.
    pub fn update_observation(
        &self,
        app: &str,
        f: impl FnOnce(&mut AppObservation),
    ) -> StateResult<Option<AppObservation>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let obs = {
            let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            if load::<App>(&apps, app)?.is_none() {
                return Ok(None);
            }
            let mut table = txn.open_table(OBSERVATIONS).map_err(map_err!(Table))?;
            let mut obs: AppObservation = load(&table, app)?.unwrap_or_else(|| AppObservation {
                app: app.to_string(),
                ..Default::default()
            });
            f(&mut obs);
            obs.updated_at = epoch_secs();
            table
                .insert(app, encode(&obs)?.as_slice())
                .map_err(map_err!(Write))?;
            obs
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(obs))
    }
}

// ── Helpers shared with the ledger modules ─────────────────────────

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Read and decode a JSON value by key.
pub(crate) fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn require_app(
    apps: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> StateResult<App> {
    load(apps, name)?.ok_or_else(|| StateError::NotFound(format!("app {name}")))
}

/// Bump and return the sequence stored under `key`. Must run in the same
/// write transaction as the insert that consumes the number.
pub(crate) fn next_sequence(txn: &WriteTransaction, key: &str) -> StateResult<u32> {
    let mut seqs = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = seqs
        .get(key)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    let version = u32::try_from(next).map_err(map_err!(Write))?;
    seqs.insert(key, next).map_err(map_err!(Write))?;
    Ok(version)
}

/// Max bound port in the pool plus one, or the pool start when no app in the
/// pool holds a port.
fn allocate_port(
    apps: &impl ReadableTable<&'static str, &'static [u8]>,
    pool: PortRange,
) -> StateResult<u16> {
    let mut highest: Option<u16> = None;
    for entry in apps.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let app: App = decode(value.value())?;
        if let Some(port) = app.bound_port.filter(|p| (pool.start..=pool.end).contains(p)) {
            highest = Some(highest.map_or(port, |h| h.max(port)));
        }
    }
    let next = match highest {
        Some(port) => u32::from(port) + 1,
        None => u32::from(pool.start),
    };
    if next > u32::from(pool.end) {
        return Err(StateError::PortPoolExhausted {
            start: pool.start,
            end: pool.end,
        });
    }
    u16::try_from(next).map_err(|_| StateError::PortPoolExhausted {
        start: pool.start,
        end: pool.end,
    })
}

fn collect_keys<V: redb::Value + 'static>(
    range: Result<redb::Range<'_, &'static str, V>, redb::StorageError>,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in range.map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn remove_app_range(table: &mut Table<'_, &'static str, &'static [u8]>, app: &str) -> StateResult<()> {
    let (lo, hi) = app_range(app);
    let keys = collect_keys(table.range(lo.as_str()..hi.as_str()))?;
    for key in keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

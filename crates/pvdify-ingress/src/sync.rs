//! Ingress route synchronization.
//!
//! `IngressSynchronizer` serializes every read-modify-write of the rule
//! set, so concurrent domain operations cannot lose each other's edits.
//! Both event-driven edits (`add_route` / `remove_route`) and a full
//! rebuild from desired state (`sync`) are provided. File reads and writes
//! run on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{IngressError, IngressResult};
use crate::rules::{IngressRule, TunnelConfig};
use crate::store::IngressStore;

/// Outcome of a full sync.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
}

impl SyncStats {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Upstream for an app bound to `port` on this host.
pub fn local_service(port: u16) -> String {
    format!("http://localhost:{port}")
}

pub struct IngressSynchronizer {
    store: Arc<dyn IngressStore>,
    lock: Mutex<()>,
}

impl IngressSynchronizer {
    pub fn new(store: Arc<dyn IngressStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    async fn edit<T, F>(&self, f: F) -> IngressResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TunnelConfig) -> (T, bool) + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> IngressResult<T> {
            let mut config = store.load()?;
            let (out, changed) = f(&mut config);
            if changed {
                store.save(&config)?;
            }
            Ok(out)
        })
        .await
        .map_err(|e| IngressError::Task(e.to_string()))?
    }

    /// Route `hostname` to the local `port`.
    pub async fn add_route(&self, hostname: &str, port: u16) -> IngressResult<()> {
        let service = local_service(port);
        let host = hostname.to_string();
        let target = service.clone();
        self.edit(move |cfg| ((), cfg.add_route(&host, &target))).await?;
        debug!(%hostname, %service, "ingress route set");
        Ok(())
    }

    /// Returns true if a route existed.
    pub async fn remove_route(&self, hostname: &str) -> IngressResult<bool> {
        let host = hostname.to_string();
        let removed = self
            .edit(move |cfg| {
                let removed = cfg.remove_route(&host);
                (removed, removed)
            })
            .await?;
        debug!(%hostname, removed, "ingress route removed");
        Ok(removed)
    }

    /// Hostname rules currently on file, catch-all excluded.
    pub async fn list_routes(&self) -> IngressResult<Vec<IngressRule>> {
        self.edit(|cfg| (cfg.routes(), false)).await
    }

    /// Make the file hold exactly `desired` (hostname → port). Existing rules
    /// keep their position; new ones are appended before the catch-all.
    pub async fn sync(&self, desired: &BTreeMap<String, u16>) -> IngressResult<SyncStats> {
        let desired = desired.clone();
        let stats = self
            .edit(move |cfg| {
                let mut stats = SyncStats::default();
                let stale: Vec<String> = cfg
                    .routes()
                    .into_iter()
                    .filter_map(|r| r.hostname)
                    .filter(|h| !desired.contains_key(h))
                    .collect();
                for host in stale {
                    if cfg.remove_route(&host) {
                        stats.removed += 1;
                    }
                }
                for (host, port) in &desired {
                    let existed = cfg
                        .ingress
                        .iter()
                        .any(|r| r.hostname.as_deref() == Some(host.as_str()));
                    if cfg.add_route(host, &local_service(*port)) {
                        if existed {
                            stats.updated += 1;
                        } else {
                            stats.added += 1;
                        }
                    }
                }
                let changed = stats.changed();
                (stats, changed)
            })
            .await?;
        info!(
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            "ingress sync complete"
        );
        Ok(stats)
    }
}

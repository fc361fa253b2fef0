//! Config snapshot store.
//!
//! Every mutation, however small, appends a complete new snapshot. Old
//! snapshots stay readable so any release can be started with the exact
//! environment it was deployed with.

use std::collections::BTreeMap;

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, epoch_secs, load, next_sequence, require_app};
use crate::tables::*;
use crate::types::*;

fn config_seq_key(app: &str) -> String {
    format!("{app}/config")
}

impl StateStore {
    /// Latest snapshot, or version 0 with no variables.
    pub fn latest_config(&self, app: &str) -> StateResult<ConfigSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        require_app(&apps, app)?;
        let table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        let (lo, hi) = app_range(app);
        match table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Read))?
            .next_back()
        {
            Some(entry) => {
                let (_, value) = entry.map_err(map_err!(Read))?;
                decode(value.value())
            }
            None => Ok(ConfigSnapshot::empty(app)),
        }
    }

    /// A specific snapshot. Version 0 is always the empty config.
    pub fn get_config_version(&self, app: &str, version: u32) -> StateResult<Option<ConfigSnapshot>> {
        if version == 0 {
            return Ok(Some(ConfigSnapshot::empty(app)));
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        load(&table, &versioned_key(app, version))
    }

    /// Overwrite `changes` on top of the latest snapshot and append the result.
    pub fn set_config(
        &self,
        app: &str,
        changes: &BTreeMap<String, String>,
    ) -> StateResult<ConfigSnapshot> {
        self.mutate_config(app, |vars| {
            vars.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    /// Remove `key` and append the result. An absent key fails with
    /// `KeyNotFound` and appends nothing.
    pub fn unset_config(&self, app: &str, key: &str) -> StateResult<ConfigSnapshot> {
        self.mutate_config(app, |vars| {
            vars.remove(key)
                .map(|_| ())
                .ok_or_else(|| StateError::KeyNotFound {
                    app: app.to_string(),
                    key: key.to_string(),
                })
        })
    }

    fn mutate_config(
        &self,
        app: &str,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> StateResult<()>,
    ) -> StateResult<ConfigSnapshot> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let snapshot = {
            {
                let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
                require_app(&apps, app)?;
            }
            let mut vars = latest_vars(&txn, app)?;
            f(&mut vars)?;

            let version = next_sequence(&txn, &config_seq_key(app))?;
            let snapshot = ConfigSnapshot {
                app: app.to_string(),
                version,
                vars,
                created_at: epoch_secs(),
            };
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            table
                .insert(versioned_key(app, version).as_str(), encode(&snapshot)?.as_slice())
                .map_err(map_err!(Write))?;
            snapshot
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, version = snapshot.version, keys = snapshot.vars.len(), "config snapshot appended");
        Ok(snapshot)
    }
}

fn latest_vars(txn: &WriteTransaction, app: &str) -> StateResult<BTreeMap<String, String>> {
    let table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
    let (lo, hi) = app_range(app);
    let last = table
        .range(lo.as_str()..hi.as_str())
        .map_err(map_err!(Read))?
        .next_back();
    match last {
        Some(entry) => {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: ConfigSnapshot = decode(value.value())?;
            Ok(snapshot.vars)
        }
        None => Ok(BTreeMap::new()),
    }
}

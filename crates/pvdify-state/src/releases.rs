//! Release ledger.
//!
//! Releases are append-only. Versions come from a per-app sequence bumped in
//! the same write transaction as the insert, so they are gapless from 1 and
//! never handed out twice. After creation only `status` changes, and only
//! along the edges of [`ReleaseStatus::can_transition_to`].

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, epoch_secs, load, next_sequence, require_app};
use crate::tables::*;
use crate::types::*;

fn release_seq_key(app: &str) -> String {
    format!("{app}/release")
}

impl StateStore {
    /// Append a `pending` release of `image`, pinned to a config snapshot,
    /// and record `image` as the app's current image.
    pub fn append_release(
        &self,
        app: &str,
        image: &str,
        pin: ConfigPin,
        created_by: &str,
    ) -> StateResult<Release> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let release = {
            let config_version = match pin {
                ConfigPin::Latest => latest_config_version(&txn, app)?,
                ConfigPin::Version(0) => 0,
                ConfigPin::Version(v) => {
                    let configs = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
                    if configs
                        .get(versioned_key(app, v).as_str())
                        .map_err(map_err!(Read))?
                        .is_none()
                    {
                        return Err(StateError::NotFound(format!("config {app}/v{v}")));
                    }
                    v
                }
            };
            insert_release(&txn, app, image, config_version, created_by)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%app, version = release.version, %image, "release created");
        Ok(release)
    }

    /// Append a new release copying the image and config of an earlier one.
    ///
    /// With no `target`, the release before the latest is used. History is
    /// never rewritten: the target keeps its own status.
    pub fn rollback_release(
        &self,
        app: &str,
        target: Option<u32>,
        created_by: &str,
    ) -> StateResult<Release> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let release = {
            let (latest, count) = {
                let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
                require_app(&apps, app)?;
                let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
                let (lo, hi) = app_range(app);
                let mut count = 0usize;
                let mut latest: Option<Release> = None;
                for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    count += 1;
                    latest = Some(decode(value.value())?);
                }
                (latest, count)
            };
            let latest = match latest {
                Some(latest) if count >= 2 => latest,
                _ => {
                    return Err(StateError::NoRollbackTarget {
                        app: app.to_string(),
                        reason: format!("{count} release(s), need at least 2"),
                    });
                }
            };

            let version = target.unwrap_or(latest.version.saturating_sub(1));
            let source: Release = {
                let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
                load(&table, &versioned_key(app, version))?.ok_or_else(|| {
                    StateError::NoRollbackTarget {
                        app: app.to_string(),
                        reason: format!("release v{version} does not exist"),
                    }
                })?
            };
            insert_release(&txn, app, &source.image, source.config_version, created_by)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%app, version = release.version, image = %release.image, "rollback release created");
        Ok(release)
    }

    pub fn get_release(&self, app: &str, version: u32) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        load(&table, &versioned_key(app, version))
    }

    /// Up to `limit` releases, newest first.
    pub fn list_releases(&self, app: &str, limit: usize) -> StateResult<Vec<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let (lo, hi) = app_range(app);
        let mut results = Vec::new();
        for entry in table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Read))?
            .rev()
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn latest_release(&self, app: &str) -> StateResult<Option<Release>> {
        Ok(self.list_releases(app, 1)?.into_iter().next())
    }

    /// The release currently serving traffic, if any.
    pub fn active_release(&self, app: &str) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let (lo, hi) = app_range(app);
        for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: Release = decode(value.value())?;
            if release.status == ReleaseStatus::Active {
                return Ok(Some(release));
            }
        }
        Ok(None)
    }

    /// Releases left `pending` or `deploying`, across all apps.
    pub fn list_unfinished_releases(&self) -> StateResult<Vec<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: Release = decode(value.value())?;
            if release.status.is_unfinished() {
                results.push(release);
            }
        }
        Ok(results)
    }

    /// Move a release to `to`. Moving to the current status is a no-op.
    ///
    /// Activation demotes any other active release of the app to
    /// `rolled_back` in the same transaction, so two active releases are
    /// never observable.
    pub fn set_release_status(
        &self,
        app: &str,
        version: u32,
        to: ReleaseStatus,
    ) -> StateResult<Release> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (release, demoted) = {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let key = versioned_key(app, version);
            let mut release: Release = load(&table, &key)?
                .ok_or_else(|| StateError::NotFound(format!("release {app}/v{version}")))?;

            if release.status == to {
                return Ok(release);
            }
            if !release.status.can_transition_to(to) {
                return Err(StateError::InvalidTransition {
                    from: release.status.to_string(),
                    to: to.to_string(),
                });
            }

            let mut demoted = Vec::new();
            if to == ReleaseStatus::Active {
                let (lo, hi) = app_range(app);
                let mut previous = Vec::new();
                for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let other: Release = decode(value.value())?;
                    if other.status == ReleaseStatus::Active && other.version != version {
                        previous.push(other);
                    }
                }
                for mut other in previous {
                    other.status = ReleaseStatus::RolledBack;
                    table
                        .insert(
                            versioned_key(app, other.version).as_str(),
                            encode(&other)?.as_slice(),
                        )
                        .map_err(map_err!(Write))?;
                    demoted.push(other.version);
                }
            }

            release.status = to;
            table
                .insert(key.as_str(), encode(&release)?.as_slice())
                .map_err(map_err!(Write))?;
            (release, demoted)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, version, status = %to, ?demoted, "release status changed");
        Ok(release)
    }

    pub fn activate_release(&self, app: &str, version: u32) -> StateResult<Release> {
        self.set_release_status(app, version, ReleaseStatus::Active)
    }
}

fn latest_config_version(txn: &WriteTransaction, app: &str) -> StateResult<u32> {
    let configs = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
    let (lo, hi) = app_range(app);
    let last = configs
        .range(lo.as_str()..hi.as_str())
        .map_err(map_err!(Read))?
        .next_back();
    match last {
        Some(entry) => {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: ConfigSnapshot = decode(value.value())?;
            Ok(snapshot.version)
        }
        None => Ok(0),
    }
}

/// Allocate the next version and insert a pending release. Also records the
/// image on the app row. Caller owns the transaction.
fn insert_release(
    txn: &WriteTransaction,
    app: &str,
    image: &str,
    config_version: u32,
    created_by: &str,
) -> StateResult<Release> {
    let now = epoch_secs();
    let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
    let mut record = require_app(&apps, app)?;

    let version = next_sequence(txn, &release_seq_key(app))?;
    let release = Release {
        app: app.to_string(),
        version,
        image: image.to_string(),
        config_version,
        status: ReleaseStatus::Pending,
        created_by: created_by.to_string(),
        created_at: now,
    };
    let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
    releases
        .insert(versioned_key(app, version).as_str(), encode(&release)?.as_slice())
        .map_err(map_err!(Write))?;

    record.image = Some(image.to_string());
    record.updated_at = now;
    apps.insert(app, encode(&record)?.as_slice())
        .map_err(map_err!(Write))?;
    Ok(release)
}

//! redb table definitions for the Pvdify state store.
//!
//! Values are JSON-serialized domain types. Per-app keys are `{app}/{suffix}`
//! so every record of an app sits in one contiguous key range; app names
//! never contain `/`.

use redb::TableDefinition;

/// Apps keyed by `{name}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Releases keyed by `{app}/{version:010}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Config snapshots keyed by `{app}/{version:010}`.
pub const CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("configs");

/// Process definitions keyed by `{app}/{process_type}`.
pub const PROCESSES: TableDefinition<&str, &[u8]> = TableDefinition::new("processes");

/// Domains keyed by `{hostname}`.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

/// Observed (actual) state keyed by `{app}`.
pub const OBSERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("observations");

/// Last issued sequence numbers keyed by `{app}/release` and `{app}/config`.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key of version `version` under `app`. Zero padding keeps key order equal
/// to numeric order.
pub fn versioned_key(app: &str, version: u32) -> String {
    format!("{app}/{version:010}")
}

pub fn process_key(app: &str, process_type: &str) -> String {
    format!("{app}/{process_type}")
}

/// Half-open key range covering every `{app}/...` key.
pub fn app_range(app: &str) -> (String, String) {
    // '0' is the byte after '/'.
    (format!("{app}/"), format!("{app}0"))
}

//! Domain types for the Pvdify state store.
//!
//! Everything here is persisted as JSON. Process instances are deliberately
//! absent: they are derived from a process definition's count and queried
//! from the supervisor on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── App ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Created,
    Running,
    Stopped,
    Failed,
    Deleting,
}

/// A named application slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub name: String,
    pub environment: String,
    pub status: AppStatus,
    /// Image of the most recently created release.
    pub image: Option<String>,
    /// Host port all `web` instances publish on.
    pub bound_port: Option<u16>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Per-container limits. `None` falls back to the daemon defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in podman syntax, e.g. `512M`.
    pub memory: Option<String>,
    /// CPU share, e.g. `0.5`.
    pub cpu: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheck {
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
            retries: 3,
        }
    }
}

/// Input for app creation.
#[derive(Debug, Clone)]
pub struct NewApp {
    pub name: String,
    pub environment: String,
}

/// Inclusive host port pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

// ── Release ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Deploying,
    Active,
    RolledBack,
    Failed,
}

impl ReleaseStatus {
    /// Allowed edges of the release state machine.
    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Deploying, Active)
                | (Deploying, Failed)
                | (Active, RolledBack)
        )
    }

    /// Releases a crashed daemon left mid-deploy.
    pub fn is_unfinished(self) -> bool {
        matches!(self, ReleaseStatus::Pending | ReleaseStatus::Deploying)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Deploying => "deploying",
            ReleaseStatus::Active => "active",
            ReleaseStatus::RolledBack => "rolled_back",
            ReleaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Immutable binding of an app to an image and a config snapshot.
/// Only `status` ever changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub app: String,
    pub version: u32,
    pub image: String,
    /// Config snapshot version the release runs with; 0 means empty config.
    pub config_version: u32,
    pub status: ReleaseStatus,
    pub created_by: String,
    pub created_at: u64,
}

/// Which config snapshot a new release is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPin {
    Latest,
    Version(u32),
}

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    pub app: String,
    pub version: u32,
    pub vars: BTreeMap<String, String>,
    pub created_at: u64,
}

impl ConfigSnapshot {
    /// Version 0: the config of an app that never set a variable.
    pub fn empty(app: &str) -> Self {
        Self {
            app: app.to_string(),
            version: 0,
            vars: BTreeMap::new(),
            created_at: 0,
        }
    }
}

// ── Processes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub app: String,
    pub process_type: String,
    /// Overrides the image's default command.
    pub command: Option<String>,
    pub count: u32,
}

// ── Domains ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Pending,
    Active,
    Failed,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Domain {
    pub hostname: String,
    pub app: String,
    pub status: DomainStatus,
    pub dns_record_id: Option<String>,
    pub created_at: u64,
}

// ── Observed state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    #[default]
    Pending,
    Reconciling,
    Converged,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// What the background machinery last saw, kept apart from desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppObservation {
    pub app: String,
    pub reconcile: ReconcileState,
    /// Attempts spent on the current job.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub note: Option<String>,
    pub health: HealthStatus,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_state_machine_edges() {
        use ReleaseStatus::*;
        assert!(Pending.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Active));
        assert!(Active.can_transition_to(RolledBack));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
        assert!(!RolledBack.can_transition_to(Active));
        assert!(!Active.can_transition_to(Failed));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ReleaseStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        assert_eq!(ReleaseStatus::RolledBack.to_string(), "rolled_back");
    }

    #[test]
    fn app_without_resources_deserializes() {
        let json = r#"{"name":"a","environment":"production","status":"created",
            "image":null,"bound_port":3000,"created_at":1,"updated_at":1}"#;
        let app: App = serde_json::from_str(json).unwrap();
        assert_eq!(app.resources, ResourceLimits::default());
        assert!(app.healthcheck.is_none());
    }
}

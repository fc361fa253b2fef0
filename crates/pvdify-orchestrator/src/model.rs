//! Views and requests exchanged with the facade.

use serde::{Deserialize, Serialize};

use pvdify_state::{
    App, AppObservation, Domain, HealthCheck, ProcessDefinition, Release, ResourceLimits,
};

/// An app with everything it owns that callers usually want at once.
#[derive(Debug, Clone, Serialize)]
pub struct AppDetail {
    #[serde(flatten)]
    pub app: App,
    pub processes: Vec<ProcessDefinition>,
    pub domains: Vec<Domain>,
    /// The release currently serving traffic.
    pub release: Option<Release>,
    pub observed: Option<AppObservation>,
}

/// Partial update of an app's runtime settings. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppUpdate {
    pub resources: Option<ResourceLimits>,
    pub healthcheck: Option<HealthCheck>,
}

/// One supervised instance of a process type.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceInfo {
    pub index: u32,
    pub unit: String,
    pub container: String,
    /// Supervisor active state, or `unknown` when it could not be queried.
    pub state: String,
    pub sub_state: String,
    pub pid: u32,
    pub memory: String,
    pub cpu_percent: Option<f64>,
    pub container_memory: Option<String>,
}

impl InstanceInfo {
    pub(crate) fn unknown(index: u32, unit: String, container: String) -> Self {
        Self {
            index,
            unit,
            container,
            state: "unknown".to_string(),
            sub_state: String::new(),
            pid: 0,
            memory: String::new(),
            cpu_percent: None,
            container_memory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    #[serde(flatten)]
    pub definition: ProcessDefinition,
    pub instances: Vec<InstanceInfo>,
}

/// Options for a log stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogRequest {
    /// Restrict to one process type; all types when absent.
    pub process: Option<String>,
    /// Historical lines to emit first. Defaults to 100.
    pub lines: Option<u32>,
    #[serde(default)]
    pub follow: bool,
}

/// What startup recovery queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub reconciles: usize,
    pub deploys: usize,
    pub teardowns: usize,
}

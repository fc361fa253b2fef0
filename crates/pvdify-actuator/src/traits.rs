//! Capability traits for the host collaborators.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::error::ActuatorResult;
use crate::exec::CommandOutput;

// ── Container runtime ──────────────────────────────────────────────

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    /// Human-readable usage as reported by the runtime, e.g. `12.5MB`.
    pub memory: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> ActuatorResult<()>;

    /// Whether `image` is present locally.
    async fn exists(&self, image: &str) -> ActuatorResult<bool>;

    /// Stop a container. Stopping an absent container succeeds.
    async fn stop(&self, name: &str, timeout: Duration) -> ActuatorResult<()>;

    /// Remove a container. Removing an absent container succeeds.
    async fn remove(&self, name: &str, force: bool) -> ActuatorResult<()>;

    async fn stats(&self, name: &str) -> ActuatorResult<ContainerStats>;

    /// Run `cmd` inside a running container. A non-zero exit of `cmd` is
    /// reported in the output, not as an error.
    async fn exec(&self, name: &str, cmd: &[String]) -> ActuatorResult<CommandOutput>;
}

// ── Process supervisor ─────────────────────────────────────────────

/// Supervisor view of one unit instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub active: String,
    pub sub_state: String,
    pub pid: u32,
    pub memory: String,
    pub load_state: String,
}

impl UnitStatus {
    pub fn is_active(&self) -> bool {
        self.active == "active"
    }
}

/// Supervises templated units. `unit` is the template base name such as
/// `pvdify-shop-web`; instance `index` is `pvdify-shop-web@index`.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Write (or overwrite) a unit file, e.g. `pvdify-shop-web@.service`.
    async fn install_unit(&self, file_name: &str, contents: &str) -> ActuatorResult<()>;

    /// Delete a unit file. A missing file is not an error.
    async fn remove_unit(&self, file_name: &str) -> ActuatorResult<()>;

    async fn daemon_reload(&self) -> ActuatorResult<()>;

    async fn start(&self, unit: &str, index: u32) -> ActuatorResult<()>;
    async fn stop(&self, unit: &str, index: u32) -> ActuatorResult<()>;
    async fn restart(&self, unit: &str, index: u32) -> ActuatorResult<()>;
    async fn enable(&self, unit: &str, index: u32) -> ActuatorResult<()>;
    async fn disable(&self, unit: &str, index: u32) -> ActuatorResult<()>;

    async fn status(&self, unit: &str, index: u32) -> ActuatorResult<UnitStatus>;

    /// Indices of currently loaded instances of `unit`, ascending.
    async fn list_instances(&self, unit: &str) -> ActuatorResult<Vec<u32>>;
}

// ── Log source ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Unit globs, e.g. `pvdify-shop-web@*`. Lines from any of them are
    /// interleaved; an empty list selects nothing.
    pub selectors: Vec<String>,
    /// Number of historical lines to emit first.
    pub lines: u32,
    /// Keep streaming new lines until dropped.
    pub follow: bool,
}

/// Lines of log output. Dropping the stream terminates the follower.
pub type LogStream = Pin<Box<dyn Stream<Item = ActuatorResult<String>> + Send>>;

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn stream(&self, query: &LogQuery) -> ActuatorResult<LogStream>;
}

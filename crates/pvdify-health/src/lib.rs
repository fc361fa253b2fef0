//! pvdify-health: HTTP health probes for running apps.
//!
//! One background task per app with a configured health check probes
//! `127.0.0.1:<bound port><path>` on its own timer. Probe outcomes go
//! through a [`HealthTracker`] (failure threshold, exponential backoff) and
//! status changes are written to the app's observed state. A failing probe
//! never blocks reconciliation.
//!
//! ```text
//! HealthMonitor
//!   └── per-app task
//!         ├── HealthTracker (consecutive failures, backoff)
//!         ├── http_probe() → ProbeResult
//!         └── StateStore::update_observation
//! ```

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use monitor::HealthMonitor;

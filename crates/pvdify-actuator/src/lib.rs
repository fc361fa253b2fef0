//! pvdify-actuator: everything that touches the host.
//!
//! Each external collaborator sits behind a narrow async trait
//! ([`ContainerRuntime`], [`ProcessSupervisor`], [`LogSource`]) with one
//! command-backed implementation (podman, systemctl, journalctl) and an
//! in-memory fake in [`fake`] for tests.

pub mod error;
pub mod exec;
pub mod fake;
pub mod journal;
pub mod podman;
pub mod systemd;
pub mod traits;
pub mod unit;

pub use error::{ActuatorError, ActuatorResult};
pub use exec::CommandOutput;
pub use journal::JournalLogSource;
pub use podman::PodmanRuntime;
pub use systemd::SystemdSupervisor;
pub use traits::*;
pub use unit::{HealthProbe, UnitDefaults, UnitGenerator, UnitSpec};

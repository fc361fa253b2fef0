//! pvdify-orchestrator: the operations Pvdify exposes upward.
//!
//! [`Orchestrator`] validates requests, commits desired state to the
//! [`StateStore`](pvdify_state::StateStore) under a per-app lock, and hands
//! actuation to the background worker through the job queue. Errors carry
//! an [`ErrorKind`] so transports can map them without inspecting sources.

pub mod error;
pub mod model;
pub mod orchestrator;
pub mod processes;

pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use model::{AppDetail, AppUpdate, InstanceInfo, LogRequest, ProcessInfo, RecoveryReport};
pub use orchestrator::{Actuators, DEFAULT_ENVIRONMENT, DEFAULT_RELEASE_LIMIT, Orchestrator};
pub use processes::DEFAULT_LOG_LINES;

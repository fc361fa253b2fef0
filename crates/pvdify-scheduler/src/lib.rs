//! pvdify-scheduler: converges what runs on the host onto what the store
//! says should run.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──enqueue──▶ JobSender
//!                             │
//!                         JobReceiver
//!                             │
//! Worker (per-app lanes, retry + backoff, observed state)
//!   └── Reconciler
//!         ├── StateStore (desired state, read fresh per job)
//!         ├── ProcessSupervisor (units, instances)
//!         ├── ContainerRuntime (pull, remove)
//!         └── IngressSynchronizer (rule file)
//! ```

pub mod error;
pub mod queue;
pub mod reconciler;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use queue::{Job, JobReceiver, JobSender, job_queue};
pub use reconciler::{Convergence, Reconciler, WEB_PROCESS};
pub use worker::{RetryPolicy, Worker};

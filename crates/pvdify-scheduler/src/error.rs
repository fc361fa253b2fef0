//! Scheduler error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while converging actual state onto desired state.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("release not found: {app}/v{version}")]
    ReleaseNotFound { app: String, version: u32 },

    #[error("job queue closed")]
    QueueClosed,

    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] pvdify_state::StateError),

    #[error("actuation failed: {0}")]
    Actuator(#[from] pvdify_actuator::ActuatorError),

    #[error("ingress sync failed: {0}")]
    Ingress(#[from] pvdify_ingress::IngressError),
}

impl SchedulerError {
    /// Whether another attempt could succeed. Storage failures are fatal and
    /// a missing release will not reappear.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::State(e) => !e.is_storage(),
            SchedulerError::ReleaseNotFound { .. } | SchedulerError::QueueClosed => false,
            _ => true,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

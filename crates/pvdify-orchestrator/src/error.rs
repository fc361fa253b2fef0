//! Facade error type and its classification.

use serde::Serialize;
use thiserror::Error;

use pvdify_actuator::ActuatorError;
use pvdify_core::ValidationError;
use pvdify_scheduler::SchedulerError;
use pvdify_state::StateError;

/// Broad classes callers can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, rejected before anything was written.
    Validation,
    /// Duplicate app or domain, or an app that is being deleted.
    Conflict,
    /// Unknown app, release, domain or key.
    NotFound,
    /// Port pool exhausted.
    ResourceExhausted,
    /// A host-side call failed.
    Actuation,
    /// The store or the daemon itself misbehaved.
    Internal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Invalid(_) | OrchestratorError::BadRequest(_) => {
                ErrorKind::Validation
            }
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::State(e) => match e {
                StateError::NotFound(_) | StateError::KeyNotFound { .. } => ErrorKind::NotFound,
                StateError::AlreadyExists(_) | StateError::InvalidTransition { .. } => {
                    ErrorKind::Conflict
                }
                StateError::PortPoolExhausted { .. } => ErrorKind::ResourceExhausted,
                StateError::NoRollbackTarget { .. } => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            },
            OrchestratorError::Actuator(_) => ErrorKind::Actuation,
            OrchestratorError::Scheduler(e) => match e {
                SchedulerError::QueueClosed => ErrorKind::Internal,
                SchedulerError::State(s) if s.is_storage() => ErrorKind::Internal,
                _ => ErrorKind::Actuation,
            },
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_map_onto_kinds() {
        let cases = [
            (StateError::NotFound("app x".into()), ErrorKind::NotFound),
            (
                StateError::KeyNotFound { app: "x".into(), key: "K".into() },
                ErrorKind::NotFound,
            ),
            (StateError::AlreadyExists("app x".into()), ErrorKind::Conflict),
            (
                StateError::PortPoolExhausted { start: 3000, end: 3000 },
                ErrorKind::ResourceExhausted,
            ),
            (
                StateError::NoRollbackTarget { app: "x".into(), reason: "one release".into() },
                ErrorKind::Validation,
            ),
            (StateError::Write("disk full".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(OrchestratorError::from(err).kind(), kind);
        }
    }

    #[test]
    fn other_sources() {
        let invalid = OrchestratorError::from(ValidationError::AppName("Bad".into()));
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert!(invalid.to_string().contains("Bad"));

        let actuation = OrchestratorError::from(ActuatorError::CommandFailed {
            command: "podman exec".into(),
            exit_code: 125,
            stdout: String::new(),
            stderr: "no such container".into(),
        });
        assert_eq!(actuation.kind(), ErrorKind::Actuation);
        assert_eq!(
            OrchestratorError::from(SchedulerError::QueueClosed).kind(),
            ErrorKind::Internal
        );
    }
}

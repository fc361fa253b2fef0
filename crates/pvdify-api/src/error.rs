//! Response envelope and error mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{error, warn};

use pvdify_orchestrator::{ErrorKind, OrchestratorError};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error class, present on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

/// `data` with a non-200 success status, e.g. 201 or 202.
pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, ApiResponse::ok(data)).into_response()
}

fn error_response(msg: String, kind: ErrorKind, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg),
            kind: Some(kind),
        }),
    )
        .into_response()
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::Actuation => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error: a facade error or a request body that did not parse.
#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    Body(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Orchestrator(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Body(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Orchestrator(e) => {
                let kind = e.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    error!(error = %e, ?kind, "request failed");
                } else {
                    warn!(error = %e, ?kind, "request rejected");
                }
                error_response(e.to_string(), kind, status)
            }
            ApiError::Body(msg) => {
                error_response(format!("invalid request body: {msg}"), ErrorKind::Validation, StatusCode::BAD_REQUEST)
            }
        }
    }
}

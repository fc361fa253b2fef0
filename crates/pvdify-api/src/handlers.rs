//! REST API handlers.
//!
//! Each handler unpacks the request, calls one facade operation and wraps
//! the result in the `{success, data, error}` envelope. Operations whose
//! actuation happens in the background answer `202 Accepted`.

use std::collections::BTreeMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use pvdify_orchestrator::{AppUpdate, OrchestratorError};

use crate::ApiState;
use crate::error::{ApiError, ApiResponse, ApiResult, with_status};

// ── Request bodies ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateReleaseRequest {
    pub image: String,
    #[serde(default)]
    pub created_by: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    /// Target version; the release before the latest when absent.
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AddDomainRequest {
    pub domain: String,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub processes: BTreeMap<String, i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListReleasesParams {
    pub limit: Option<usize>,
}

// ── Health ─────────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Apps ───────────────────────────────────────────────────────────

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<ApiState>) -> ApiResult<Response> {
    let apps = state.orchestrator.list_apps()?;
    Ok(ApiResponse::ok(apps).into_response())
}

/// POST /api/v1/apps
pub async fn create_app(
    State(state): State<ApiState>,
    body: Result<Json<CreateAppRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let app = state
        .orchestrator
        .create_app(&req.name, req.environment.as_deref())
        .await?;
    Ok(with_status(StatusCode::CREATED, app))
}

/// GET /api/v1/apps/{name}
pub async fn get_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let detail = state.orchestrator.get_app(&name)?;
    Ok(ApiResponse::ok(detail).into_response())
}

/// PATCH /api/v1/apps/{name}
pub async fn update_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<AppUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(update) = body?;
    let app = state.orchestrator.update_app(&name, update).await?;
    Ok(ApiResponse::ok(app).into_response())
}

/// DELETE /api/v1/apps/{name}
pub async fn delete_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.orchestrator.delete_app(&name).await?;
    Ok(with_status(
        StatusCode::ACCEPTED,
        serde_json::json!({ "app": name, "status": "deleting" }),
    ))
}

// ── Releases ───────────────────────────────────────────────────────

/// GET /api/v1/apps/{name}/releases?limit=N
pub async fn list_releases(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<ListReleasesParams>,
) -> ApiResult<Response> {
    let releases = state.orchestrator.list_releases(&name, params.limit)?;
    Ok(ApiResponse::ok(releases).into_response())
}

/// POST /api/v1/apps/{name}/releases
pub async fn create_release(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<CreateReleaseRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let release = state
        .orchestrator
        .deploy(&name, &req.image, &req.created_by)
        .await?;
    Ok(with_status(StatusCode::ACCEPTED, release))
}

/// GET /api/v1/apps/{name}/releases/{version}
pub async fn get_release(
    State(state): State<ApiState>,
    Path((name, version)): Path<(String, u32)>,
) -> ApiResult<Response> {
    let release = state.orchestrator.get_release(&name, version)?;
    Ok(ApiResponse::ok(release).into_response())
}

/// POST /api/v1/apps/{name}/rollback
///
/// The body is optional; an empty one rolls back to the previous release.
pub async fn rollback(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let req: RollbackRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RollbackRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Body(e.to_string()))?
    };
    let release = state.orchestrator.rollback(&name, req.version).await?;
    Ok(with_status(StatusCode::ACCEPTED, release))
}

// ── Config ─────────────────────────────────────────────────────────

/// GET /api/v1/apps/{name}/config
pub async fn get_config(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let snapshot = state.orchestrator.get_config(&name)?;
    Ok(ApiResponse::ok(snapshot).into_response())
}

/// PUT /api/v1/apps/{name}/config
pub async fn set_config(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<SetConfigRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let snapshot = state.orchestrator.set_config(&name, &req.vars).await?;
    Ok(ApiResponse::ok(snapshot).into_response())
}

/// DELETE /api/v1/apps/{name}/config/{key}
pub async fn unset_config(
    State(state): State<ApiState>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    let snapshot = state.orchestrator.unset_config(&name, &key).await?;
    Ok(ApiResponse::ok(snapshot).into_response())
}

// ── Domains ────────────────────────────────────────────────────────

/// GET /api/v1/apps/{name}/domains
pub async fn list_domains(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let domains = state.orchestrator.list_domains(&name)?;
    Ok(ApiResponse::ok(domains).into_response())
}

/// POST /api/v1/apps/{name}/domains
pub async fn add_domain(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<AddDomainRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let domain = state.orchestrator.add_domain(&name, &req.domain).await?;
    Ok(with_status(StatusCode::CREATED, domain))
}

/// DELETE /api/v1/apps/{name}/domains/{domain}
pub async fn remove_domain(
    State(state): State<ApiState>,
    Path((name, domain)): Path<(String, String)>,
) -> ApiResult<Response> {
    state.orchestrator.remove_domain(&name, &domain).await?;
    Ok(ApiResponse::ok("removed").into_response())
}

// ── Processes ──────────────────────────────────────────────────────

/// GET /api/v1/apps/{name}/ps
pub async fn list_processes(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let processes = state.orchestrator.list_processes(&name).await?;
    Ok(ApiResponse::ok(processes).into_response())
}

/// POST /api/v1/apps/{name}/ps/scale
pub async fn scale(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let definitions = state.orchestrator.scale(&name, &req.processes).await?;
    Ok(with_status(StatusCode::ACCEPTED, definitions))
}

/// POST /api/v1/apps/{name}/ps/restart
pub async fn restart(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.orchestrator.restart(&name).await?;
    Ok(with_status(
        StatusCode::ACCEPTED,
        serde_json::json!({ "app": name, "status": "restarting" }),
    ))
}

/// POST /api/v1/apps/{name}/ps/{process}/{index}/exec
pub async fn exec(
    State(state): State<ApiState>,
    Path((name, process, index)): Path<(String, String, u32)>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body?;
    let output = state
        .orchestrator
        .exec(&name, &process, index, &req.command)
        .await?;
    Ok(ApiResponse::ok(output).into_response())
}

/// Fallback for unknown API paths, so they get the JSON envelope too.
pub async fn not_found() -> ApiError {
    ApiError::Orchestrator(OrchestratorError::NotFound("route".to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use pvdify_actuator::fake::{FakeLogSource, FakeRuntime, FakeSupervisor};
    use pvdify_core::UnitNaming;
    use pvdify_orchestrator::{Actuators, Orchestrator};
    use pvdify_scheduler::{JobReceiver, job_queue};
    use pvdify_state::{PortRange, StateStore};

    /// API state over an in-memory store. The receiver must outlive the
    /// test or every enqueue fails.
    pub(crate) fn test_state() -> (ApiState, JobReceiver) {
        let store = StateStore::open_in_memory().unwrap();
        let (tx, rx) = job_queue();
        let orchestrator = Orchestrator::new(
            store,
            tx,
            Actuators {
                supervisor: Arc::new(FakeSupervisor::new()),
                runtime: Arc::new(FakeRuntime::new()),
                logs: Arc::new(FakeLogSource::new(["booted", "listening on 3000"])),
            },
            UnitNaming::default(),
            PortRange { start: 3000, end: 3001 },
        );
        (ApiState { orchestrator }, rx)
    }

    async fn with_app(state: &ApiState, name: &str) {
        state.orchestrator.create_app(name, None).await.unwrap();
    }

    fn status(result: ApiResult<Response>) -> StatusCode {
        match result {
            Ok(resp) => resp.status(),
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn list_apps_empty() {
        let (state, _rx) = test_state();
        assert_eq!(status(list_apps(State(state)).await), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_get_app() {
        let (state, _rx) = test_state();
        let req = CreateAppRequest {
            name: "shop".into(),
            environment: None,
        };
        let resp = create_app(State(state.clone()), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::CREATED);

        let resp = get_app(State(state), Path("shop".to_string())).await;
        assert_eq!(status(resp), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_app_conflicts() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let req = CreateAppRequest {
            name: "shop".into(),
            environment: Some("staging".into()),
        };
        let resp = create_app(State(state), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn exhausted_pool_is_507() {
        let (state, _rx) = test_state();
        with_app(&state, "a").await;
        with_app(&state, "b").await;
        let req = CreateAppRequest {
            name: "c".into(),
            environment: None,
        };
        let resp = create_app(State(state), Ok(Json(req))).await;
        assert_eq!(status(resp).as_u16(), 507);
    }

    #[tokio::test]
    async fn get_nonexistent_app() {
        let (state, _rx) = test_state();
        let resp = get_app(State(state), Path("nope".to_string())).await;
        assert_eq!(status(resp), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deploy_is_accepted() {
        let (state, mut rx) = test_state();
        with_app(&state, "shop").await;
        let req = CreateReleaseRequest {
            image: "ghcr.io/acme/shop:1".into(),
            created_by: String::new(),
        };
        let resp = create_release(State(state), Path("shop".to_string()), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::ACCEPTED);
        assert!(rx.try_next().is_some());
    }

    #[tokio::test]
    async fn rollback_accepts_empty_body() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        state.orchestrator.deploy("shop", "img:1", "a").await.unwrap();
        state.orchestrator.deploy("shop", "img:2", "a").await.unwrap();

        let resp = rollback(State(state.clone()), Path("shop".to_string()), Bytes::new()).await;
        assert_eq!(status(resp), StatusCode::ACCEPTED);

        let body = Bytes::from_static(br#"{"version": 9}"#);
        let resp = rollback(State(state.clone()), Path("shop".to_string()), body).await;
        assert_eq!(status(resp), StatusCode::NOT_FOUND);

        let resp = rollback(State(state), Path("shop".to_string()), Bytes::from_static(b"{")).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unset_missing_key_is_404() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let resp = unset_config(State(state), Path(("shop".to_string(), "NOPE".to_string()))).await;
        assert_eq!(status(resp), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scale_rejects_negative_counts() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let req = ScaleRequest {
            processes: BTreeMap::from([("web".to_string(), -1)]),
        };
        let resp = scale(State(state), Path("shop".to_string()), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scale_rejects_hyphenated_process_types() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let req = ScaleRequest {
            processes: BTreeMap::from([("eu-web".to_string(), 1)]),
        };
        let resp = scale(State(state.clone()), Path("shop".to_string()), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);
        assert!(state.orchestrator.store().get_process("shop", "eu-web").unwrap().is_none());
    }

    #[tokio::test]
    async fn update_app_rejects_unsafe_limits() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;

        let memory: AppUpdate =
            serde_json::from_str(r#"{"resources": {"memory": "512M\nExecStartPre=/bin/sh -c id"}}"#).unwrap();
        let resp = update_app(State(state.clone()), Path("shop".to_string()), Ok(Json(memory))).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);

        let path: AppUpdate =
            serde_json::from_str(r#"{"healthcheck": {"path": "/h\" ; touch /tmp/pwn ; \""}}"#).unwrap();
        let resp = update_app(State(state.clone()), Path("shop".to_string()), Ok(Json(path))).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);

        let fine: AppUpdate =
            serde_json::from_str(r#"{"resources": {"memory": "1G", "cpu": "2"}, "healthcheck": {"path": "/up"}}"#)
                .unwrap();
        let resp = update_app(State(state), Path("shop".to_string()), Ok(Json(fine))).await;
        assert_eq!(status(resp), StatusCode::OK);
    }

    #[tokio::test]
    async fn add_domain_is_created() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let req = AddDomainRequest {
            domain: "shop.example.com".into(),
        };
        let resp = add_domain(State(state.clone()), Path("shop".to_string()), Ok(Json(req))).await;
        assert_eq!(status(resp), StatusCode::CREATED);

        let resp = remove_domain(
            State(state),
            Path(("shop".to_string(), "other.example.com".to_string())),
        )
        .await;
        assert_eq!(status(resp), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exec_runs_and_rejects_empty_command() {
        let (state, _rx) = test_state();
        with_app(&state, "shop").await;
        let req = ExecRequest {
            command: vec!["true".into()],
        };
        let resp = exec(
            State(state.clone()),
            Path(("shop".to_string(), "web".to_string(), 1)),
            Ok(Json(req)),
        )
        .await;
        assert_eq!(status(resp), StatusCode::OK);

        let req = ExecRequest { command: vec![] };
        let resp = exec(
            State(state),
            Path(("shop".to_string(), "web".to_string(), 1)),
            Ok(Json(req)),
        )
        .await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);
    }
}

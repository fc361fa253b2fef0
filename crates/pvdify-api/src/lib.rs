//! pvdify-api: REST API for Pvdify.
//!
//! Thin axum marshaling over [`Orchestrator`]. Every JSON response uses the
//! `{success, data, error}` envelope; failures also carry `kind`, and the
//! HTTP status follows it (400/409/404/507/502/500).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness and version |
//! | GET | `/api/v1/apps` | List apps |
//! | POST | `/api/v1/apps` | Create an app |
//! | GET | `/api/v1/apps/{name}` | App detail |
//! | PATCH | `/api/v1/apps/{name}` | Update resources / health check |
//! | DELETE | `/api/v1/apps/{name}` | Delete an app |
//! | GET | `/api/v1/apps/{name}/releases` | List releases (`?limit=`) |
//! | POST | `/api/v1/apps/{name}/releases` | Deploy an image |
//! | GET | `/api/v1/apps/{name}/releases/{version}` | One release |
//! | POST | `/api/v1/apps/{name}/rollback` | Roll back |
//! | GET | `/api/v1/apps/{name}/config` | Current config |
//! | PUT | `/api/v1/apps/{name}/config` | Merge config vars |
//! | DELETE | `/api/v1/apps/{name}/config/{key}` | Unset a var |
//! | GET | `/api/v1/apps/{name}/domains` | List domains |
//! | POST | `/api/v1/apps/{name}/domains` | Add a domain |
//! | DELETE | `/api/v1/apps/{name}/domains/{domain}` | Remove a domain |
//! | GET | `/api/v1/apps/{name}/ps` | Processes and instances |
//! | POST | `/api/v1/apps/{name}/ps/scale` | Scale process types |
//! | POST | `/api/v1/apps/{name}/ps/restart` | Restart all instances |
//! | POST | `/api/v1/apps/{name}/ps/{process}/{index}/exec` | Run a command in an instance |
//! | GET | `/api/v1/apps/{name}/logs` | Log stream (SSE) |

pub mod error;
pub mod handlers;
pub mod logs;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use pvdify_orchestrator::Orchestrator;

pub use error::{ApiError, ApiResponse, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/apps", get(handlers::list_apps).post(handlers::create_app))
        .route(
            "/apps/{name}",
            get(handlers::get_app)
                .patch(handlers::update_app)
                .delete(handlers::delete_app),
        )
        .route(
            "/apps/{name}/releases",
            get(handlers::list_releases).post(handlers::create_release),
        )
        .route("/apps/{name}/releases/{version}", get(handlers::get_release))
        .route("/apps/{name}/rollback", post(handlers::rollback))
        .route(
            "/apps/{name}/config",
            get(handlers::get_config).put(handlers::set_config),
        )
        .route("/apps/{name}/config/{key}", delete(handlers::unset_config))
        .route(
            "/apps/{name}/domains",
            get(handlers::list_domains).post(handlers::add_domain),
        )
        .route("/apps/{name}/domains/{domain}", delete(handlers::remove_domain))
        .route("/apps/{name}/ps", get(handlers::list_processes))
        .route("/apps/{name}/ps/scale", post(handlers::scale))
        .route("/apps/{name}/ps/restart", post(handlers::restart))
        .route("/apps/{name}/ps/{process}/{index}/exec", post(handlers::exec))
        .route("/apps/{name}/logs", get(logs::stream_logs))
        .fallback(handlers::not_found)
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

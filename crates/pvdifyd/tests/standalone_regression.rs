//! Standalone regression tests.
//!
//! Drives the full HTTP surface over in-memory actuators: apps, releases,
//! config, domains, scaling and logs, with the worker converging state
//! between requests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

use pvdify_actuator::fake::{FakeLogSource, FakeRuntime, FakeSupervisor};
use pvdify_actuator::{UnitDefaults, UnitGenerator};
use pvdify_api::build_router;
use pvdify_core::UnitNaming;
use pvdify_ingress::{IngressStore, IngressSynchronizer, MemoryIngressStore};
use pvdify_orchestrator::{Actuators, Orchestrator};
use pvdify_scheduler::{JobReceiver, Reconciler, RetryPolicy, Worker, job_queue};
use pvdify_state::{PortRange, StateStore};

struct Daemon {
    router: Router,
    worker: Worker,
    jobs: JobReceiver,
    supervisor: FakeSupervisor,
    rules: Arc<MemoryIngressStore>,
    _dir: tempfile::TempDir,
}

fn daemon() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let supervisor = FakeSupervisor::new();
    let runtime = FakeRuntime::new();
    let rules = Arc::new(MemoryIngressStore::new());

    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(supervisor.clone()),
        Arc::new(runtime.clone()),
        Arc::new(IngressSynchronizer::new(rules.clone())),
        UnitGenerator::new(UnitNaming::default(), UnitDefaults::default()),
        dir.path(),
    );
    let worker = Worker::new(
        Arc::new(reconciler),
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
    );

    let (tx, jobs) = job_queue();
    let orchestrator = Orchestrator::new(
        store,
        tx,
        Actuators {
            supervisor: Arc::new(supervisor.clone()),
            runtime: Arc::new(runtime),
            logs: Arc::new(FakeLogSource::new(["GET / 200", "GET /health 200"])),
        },
        UnitNaming::default(),
        PortRange { start: 3000, end: 3999 },
    );

    Daemon {
        router: build_router(orchestrator),
        worker,
        jobs,
        supervisor,
        rules,
        _dir: dir,
    }
}

impl Daemon {
    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn settle(&mut self) {
        self.worker.drain(&mut self.jobs).await;
    }
}

#[tokio::test]
async fn health_endpoint_reports_version() {
    let d = daemon();
    let (status, body) = d.call("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn standalone_api_list_apps_empty() {
    let d = daemon();
    let (status, body) = d.call("GET", "/api/v1/apps", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn deploy_flow_over_http() {
    let mut d = daemon();

    let (status, body) = d
        .call("POST", "/api/v1/apps", Some(json!({ "name": "shop" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["bound_port"], 3000);
    assert_eq!(body["data"]["environment"], "production");

    let (status, body) = d
        .call("PUT", "/api/v1/apps/shop/config", Some(json!({ "vars": { "DATABASE_URL": "postgres://db" } })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 1);

    let (status, body) = d
        .call("POST", "/api/v1/apps/shop/releases", Some(json!({ "image": "ghcr.io/acme/shop:1", "created_by": "ci" })))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["version"], 1);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["config_version"], 1);

    d.settle().await;

    let (status, body) = d.call("GET", "/api/v1/apps/shop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
    assert_eq!(body["data"]["release"]["version"], 1);
    assert_eq!(body["data"]["observed"]["reconcile"], "converged");

    let (status, body) = d.call("GET", "/api/v1/apps/shop/ps", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["process_type"], "web");
    assert_eq!(body["data"][0]["instances"][0]["state"], "active");
    assert_eq!(d.supervisor.running("pvdify-shop-web"), vec![1]);
}

#[tokio::test]
async fn rollback_over_http() {
    let mut d = daemon();
    d.call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;
    for image in ["img:a", "img:b"] {
        d.call("POST", "/api/v1/apps/shop/releases", Some(json!({ "image": image }))).await;
        d.settle().await;
    }

    let (status, body) = d.call("POST", "/api/v1/apps/shop/rollback", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["version"], 3);
    assert_eq!(body["data"]["image"], "img:a");
    d.settle().await;

    let (_, body) = d.call("GET", "/api/v1/apps/shop/releases?limit=2", None).await;
    let releases = body["data"].as_array().unwrap();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0]["version"], 3);
    assert_eq!(releases[0]["status"], "active");
    assert_eq!(releases[1]["status"], "rolled_back");

    let (status, _) = d.call("GET", "/api/v1/apps/shop/releases/1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = d.call("GET", "/api/v1/apps/shop/releases/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn config_unset_over_http() {
    let d = daemon();
    d.call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;
    d.call("PUT", "/api/v1/apps/shop/config", Some(json!({ "vars": { "X": "1", "Y": "2" } }))).await;

    let (status, body) = d.call("DELETE", "/api/v1/apps/shop/config/X", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 2);
    assert_eq!(body["data"]["vars"], json!({ "Y": "2" }));

    let (status, _) = d.call("DELETE", "/api/v1/apps/shop/config/X", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = d.call("GET", "/api/v1/apps/shop/config", None).await;
    assert_eq!(body["data"]["version"], 2);
}

#[tokio::test]
async fn domains_and_scaling_over_http() {
    let mut d = daemon();
    d.call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;
    d.call("POST", "/api/v1/apps/shop/releases", Some(json!({ "image": "img:1" }))).await;

    let (status, body) = d
        .call("POST", "/api/v1/apps/shop/domains", Some(json!({ "domain": "shop.example.com" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "pending");

    let (status, body) = d
        .call("POST", "/api/v1/apps/shop/ps/scale", Some(json!({ "processes": { "web": 3 } })))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"][0]["count"], 3);
    d.settle().await;
    assert_eq!(d.supervisor.running("pvdify-shop-web"), vec![1, 2, 3]);

    d.call("POST", "/api/v1/apps/shop/ps/scale", Some(json!({ "processes": { "web": 1 } }))).await;
    d.settle().await;
    assert_eq!(d.supervisor.running("pvdify-shop-web"), vec![1]);

    let (_, body) = d.call("GET", "/api/v1/apps/shop/domains", None).await;
    assert_eq!(body["data"][0]["status"], "active");
    let routes = d.rules.load().unwrap().routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].service, "http://localhost:3000");

    let (status, body) = d
        .call("POST", "/api/v1/apps/shop/ps/scale", Some(json!({ "processes": { "web": -2 } })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn malformed_bodies_and_unknown_routes() {
    let d = daemon();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/apps")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = d.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let (status, body) = d.call("GET", "/api/v1/nothing-here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn delete_app_over_http() {
    let mut d = daemon();
    d.call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;
    d.call("POST", "/api/v1/apps/shop/releases", Some(json!({ "image": "img:1" }))).await;
    d.settle().await;

    let (status, _) = d.call("DELETE", "/api/v1/apps/shop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = d.call("POST", "/api/v1/apps/shop/ps/restart", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    d.settle().await;
    let (status, _) = d.call("GET", "/api/v1/apps/shop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(d.supervisor.running("pvdify-shop-web").is_empty());
}

#[tokio::test]
async fn logs_stream_as_server_sent_events() {
    let d = daemon();
    d.call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;

    let req = Request::builder()
        .uri("/api/v1/apps/shop/logs?process=web&lines=10")
        .body(Body::empty())
        .unwrap();
    let resp = d.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("data: GET / 200"));
    assert!(text.contains("data: GET /health 200"));
}

#[tokio::test]
async fn background_worker_converges_without_draining() {
    let d = daemon();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(d.worker.clone().run(d.jobs, shutdown_rx));

    let router = d.router.clone();
    let call = |method: &'static str, uri: &'static str, body: Option<Value>| {
        let router = router.clone();
        async move {
            let builder = Request::builder().method(method).uri(uri);
            let req = match body {
                Some(b) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&b).unwrap()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let resp = router.oneshot(req).await.unwrap();
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            serde_json::from_slice::<Value>(&bytes).unwrap()
        }
    };

    call("POST", "/api/v1/apps", Some(json!({ "name": "shop" }))).await;
    call("POST", "/api/v1/apps/shop/releases", Some(json!({ "image": "img:1" }))).await;

    let mut status = Value::Null;
    for _ in 0..100 {
        let body = call("GET", "/api/v1/apps/shop/releases/1", None).await;
        status = body["data"]["status"].clone();
        if status == "active" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "active");

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}

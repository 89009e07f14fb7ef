//! HTTP surface of the health reporter, driven through the router without a socket.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use stratd::config::{FastStoreConfig, PersistenceConfig, RecoveryConfig, SupervisorConfig};
use stratd::domain::{StaticCatalog, StrategyCatalog, StrategyConfig, Timeframe};
use stratd::persistence::{MissedDataTracker, StatePersistenceService};
use stratd::recovery::RecoveryService;
use stratd::services::{health::router, ControlPlane, HealthReporter};
use stratd::store::{MemoryDurableStore, MemoryFastStore};
use stratd::supervisor::{LoggingOrderSink, Supervisor};
use stratd::worker::{IdleRunnerFactory, TaskTransport};

struct TestContext {
    app: Router,
    control: Arc<ControlPlane>,
    recovery: Arc<RecoveryService>,
}

impl TestContext {
    fn new() -> Self {
        let durable = MemoryDurableStore::new();
        let persistence = Arc::new(StatePersistenceService::new(
            Arc::new(MemoryFastStore::new()),
            Arc::new(durable.clone()),
            &FastStoreConfig::default(),
            &PersistenceConfig::default(),
        ));
        let tracker = Arc::new(MissedDataTracker::new(
            Arc::new(durable),
            &RecoveryConfig::default(),
        ));
        let catalog: Arc<dyn StrategyCatalog> = Arc::new(StaticCatalog::new(vec![StrategyConfig {
            id: "macd-sol".into(),
            name: "MACD SOL".into(),
            active: true,
            symbol: "SOLUSDT".into(),
            timeframe: Timeframe::H1,
            risk: Default::default(),
            params: serde_json::Value::Null,
        }]));

        let (supervisor, handle) = Supervisor::new(
            SupervisorConfig::default(),
            persistence.clone(),
            catalog.clone(),
            Arc::new(TaskTransport::new(Arc::new(IdleRunnerFactory))),
            Arc::new(LoggingOrderSink),
        );
        tokio::spawn(supervisor.run());

        let recovery = Arc::new(RecoveryService::new(
            persistence.clone(),
            tracker.clone(),
            catalog,
            handle.clone(),
        ));
        let reporter = HealthReporter::new(
            persistence.clone(),
            tracker,
            handle.clone(),
            recovery.clone(),
            &PersistenceConfig::default(),
        );
        let control = Arc::new(ControlPlane::new(
            handle,
            persistence,
            reporter,
            recovery.completion_flag(),
        ));

        Self {
            app: router(control.clone()),
            control,
            recovery,
        }
    }

    async fn get(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build request");
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router request failed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get(uri).await;
        let json = serde_json::from_str(&body)
            .unwrap_or_else(|e| panic!("{} returned non-json body {:?}: {}", uri, body, e));
        (status, json)
    }
}

#[tokio::test]
async fn liveness_always_ok() {
    let ctx = TestContext::new();
    let (status, _) = ctx.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_recovery_and_workers() {
    let ctx = TestContext::new();

    let (status, body) = ctx.get_json("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "NO_STRATEGIES");
    assert_eq!(body["recovery_complete"], false);

    ctx.recovery.recover().await.unwrap();
    assert!(ctx.control.start("macd-sol").await.success);

    let (status, body) = ctx.get_json("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "EXCELLENT");
    assert_eq!(body["recovery_complete"], true);
    assert_eq!(body["workers"]["total"], 1);
}

#[tokio::test]
async fn strategy_endpoints() {
    let ctx = TestContext::new();
    ctx.recovery.recover().await.unwrap();

    let (status, body) = ctx.get("/health/macd-sol").await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);
    assert!(body.contains("macd-sol"));

    assert!(ctx.control.start("macd-sol").await.success);

    let (status, body) = ctx.get_json("/health/macd-sol").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_running"], true);
    assert_eq!(body["current_phase"], "ENTRY");

    let (status, body) = ctx.get_json("/status/macd-sol").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restart_count"], 0);
    assert!(body["worker_info"].is_object());
}

#[tokio::test]
async fn diagnostics_clean_after_start() {
    let ctx = TestContext::new();
    ctx.recovery.recover().await.unwrap();
    assert!(ctx.control.start("macd-sol").await.success);

    let (status, body) = ctx.get_json("/diagnostics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consistency"]["inconsistent"], 0);
    assert_eq!(body["recommendations"].as_array().map(Vec::len), Some(0));
}

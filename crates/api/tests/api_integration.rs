//! Integration tests for the API server.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use api::routes::sagas::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::InstanceId;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::order_fulfillment::{STEP_CHARGE_PAYMENT, STEP_SCHEDULE_SHIPPING};
use saga::{CoordinatorConfig, InMemoryStepInvoker};
use saga_log::InMemorySagaLog;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup_with_invoker(
    invoker: InMemoryStepInvoker,
) -> (axum::Router, Arc<AppState<InMemorySagaLog>>) {
    let config = CoordinatorConfig {
        log_append_attempts: 3,
        log_retry_delay: Duration::from_millis(1),
    };
    let state = api::create_default_state(InMemorySagaLog::new(), invoker, config).unwrap();
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> axum::Router {
    setup_with_invoker(InMemoryStepInvoker::new()).0
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn start_order(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/sagas",
            serde_json::json!({
                "saga_type": "order-fulfillment",
                "input": { "order_id": "ORD-1", "amount_cents": 2500 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    json["instance_id"].as_str().unwrap().to_string()
}

async fn settle(state: &AppState<InMemorySagaLog>, id: &str) {
    let instance_id: InstanceId = id.parse().unwrap();
    state
        .coordinator
        .wait_for_terminal(instance_id, Duration::from_secs(5))
        .await
        .unwrap();
}

// ============================================================================
// Health, definitions, metrics
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active_instances"], 0);
}

#[tokio::test]
async fn test_list_definitions() {
    let app = setup();

    let response = app.oneshot(get("/definitions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let definitions = json.as_array().unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0]["saga_type"], "order-fulfillment");

    let steps: Vec<&str> = definitions[0]["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        steps,
        vec!["reserveInventory", "chargePayment", "scheduleShipping"]
    );
    assert_eq!(definitions[0]["steps"][1]["timeout_ms"], 15_000);
    assert_eq!(definitions[0]["steps"][1]["max_attempts"], 3);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_metrics_count_started_sagas() {
    let (app, state) = setup_with_invoker(InMemoryStepInvoker::new());
    let id = start_order(&app).await;
    settle(&state, &id).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_started_total"));
}

// ============================================================================
// Starting and inspecting sagas
// ============================================================================

#[tokio::test]
async fn test_start_saga_returns_created() {
    let app = setup();

    let response = app
        .oneshot(post_json(
            "/sagas",
            serde_json::json!({ "saga_type": "order-fulfillment", "input": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["state"], "Pending");
    assert!(json["instance_id"].as_str().unwrap().parse::<InstanceId>().is_ok());
}

#[tokio::test]
async fn test_start_unknown_saga_type() {
    let app = setup();

    let response = app
        .oneshot(post_json(
            "/sagas",
            serde_json::json!({ "saga_type": "travel-booking" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("travel-booking"));
}

#[tokio::test]
async fn test_start_without_saga_type_is_rejected() {
    let app = setup();

    let response = app
        .oneshot(post_json("/sagas", serde_json::json!({ "input": {} })))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_saga_runs_to_completion() {
    let (app, state) = setup_with_invoker(InMemoryStepInvoker::new());
    let id = start_order(&app).await;
    settle(&state, &id).await;

    let response = app.oneshot(get(&format!("/sagas/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["instance_id"], id);
    assert_eq!(json["saga_type"], "order-fulfillment");
    assert_eq!(json["state"], "Completed");
    assert!(json["step_index"].is_null());

    let outcomes = json["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o["result"] == "success"));
    assert!(json["failure_reason"].is_null());
}

#[tokio::test]
async fn test_failed_payment_is_compensated() {
    let invoker = InMemoryStepInvoker::new();
    invoker.fail_permanently(STEP_CHARGE_PAYMENT, "card declined");
    let (app, state) = setup_with_invoker(invoker);

    let id = start_order(&app).await;
    settle(&state, &id).await;

    let json = body_json(app.oneshot(get(&format!("/sagas/{id}"))).await.unwrap()).await;
    assert_eq!(json["state"], "Compensated");
    assert!(
        json["failure_reason"]
            .as_str()
            .unwrap()
            .contains("card declined")
    );

    let last = json["outcomes"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["step_name"], "reserveInventory");
    assert_eq!(last["kind"], "compensate");
}

#[tokio::test]
async fn test_get_saga_with_malformed_id() {
    let app = setup();

    let response = app.oneshot(get("/sagas/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_saga() {
    let app = setup();

    let response = app
        .oneshot(get(&format!("/sagas/{}", InstanceId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_saga_log_entries() {
    let (app, state) = setup_with_invoker(InMemoryStepInvoker::new());
    let id = start_order(&app).await;
    settle(&state, &id).await;

    let response = app.oneshot(get(&format!("/sagas/{id}/log"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let entries = json.as_array().unwrap();
    assert_eq!(entries.first().unwrap()["entry_type"], "SagaStarted");
    assert_eq!(entries.first().unwrap()["sequence"], 1);
    assert_eq!(entries.last().unwrap()["entry_type"], "SagaCompleted");
    assert_eq!(entries.last().unwrap()["terminal"], true);

    let sequences: Vec<i64> = entries
        .iter()
        .map(|e| e["sequence"].as_i64().unwrap())
        .collect();
    let expected: Vec<i64> = (1..=entries.len() as i64).collect();
    assert_eq!(sequences, expected);
}

#[tokio::test]
async fn test_log_of_unknown_saga() {
    let app = setup();

    let response = app
        .oneshot(get(&format!("/sagas/{}/log", InstanceId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Abandon
// ============================================================================

#[tokio::test]
async fn test_abandon_running_saga() {
    let invoker = InMemoryStepInvoker::new();
    invoker.hang(STEP_SCHEDULE_SHIPPING);
    let (app, _state) = setup_with_invoker(invoker.clone());

    let id = start_order(&app).await;
    for _ in 0..200 {
        if invoker.invoked(STEP_SCHEDULE_SHIPPING) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/sagas/{id}/abandon"),
            serde_json::json!({ "reason": "shipping handled manually" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["state"], "Abandoned");
    assert_eq!(json["abandon_reason"], "shipping handled manually");

    let json = body_json(app.oneshot(get(&format!("/sagas/{id}"))).await.unwrap()).await;
    assert_eq!(json["state"], "Abandoned");
}

#[tokio::test]
async fn test_abandon_without_body_uses_default_reason() {
    let invoker = InMemoryStepInvoker::new();
    invoker.hang(STEP_SCHEDULE_SHIPPING);
    let (app, _state) = setup_with_invoker(invoker);

    let id = start_order(&app).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/sagas/{id}/abandon"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["state"], "Abandoned");
    assert_eq!(json["abandon_reason"], "abandoned by operator");
}

#[tokio::test]
async fn test_abandon_completed_saga_conflicts() {
    let (app, state) = setup_with_invoker(InMemoryStepInvoker::new());
    let id = start_order(&app).await;
    settle(&state, &id).await;

    let response = app
        .oneshot(post_json(
            &format!("/sagas/{id}/abandon"),
            serde_json::json!({ "reason": "too late" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_abandon_unknown_saga() {
    let app = setup();

    let response = app
        .oneshot(post_json(
            &format!("/sagas/{}/abandon", InstanceId::new()),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

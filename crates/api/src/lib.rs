//! HTTP API server for the saga coordinator.
//!
//! Provides REST endpoints to start, inspect and abandon saga instances,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    CoordinatorConfig, DefinitionRegistry, InMemoryStepInvoker, SagaCoordinator, SagaError,
    order_fulfillment,
};
use saga_log::SagaLog;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L: SagaLog + 'static>(
    state: Arc<AppState<L>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<L>))
        .route("/definitions", get(routes::definitions::list::<L>))
        .route("/sagas", post(routes::sagas::start::<L>))
        .route("/sagas/{id}", get(routes::sagas::get::<L>))
        .route("/sagas/{id}/abandon", post(routes::sagas::abandon::<L>))
        .route("/sagas/{id}/log", get(routes::sagas::log::<L>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state with the built-in saga definitions.
///
/// Must be called within a tokio runtime.
pub fn create_default_state<L: SagaLog + 'static>(
    log: L,
    invoker: InMemoryStepInvoker,
    config: CoordinatorConfig,
) -> Result<Arc<AppState<L>>, SagaError> {
    let registry = DefinitionRegistry::new().with(order_fulfillment::definition())?;
    let coordinator = SagaCoordinator::with_config(Arc::new(registry), log, invoker, config);
    Ok(Arc::new(AppState { coordinator }))
}

/// Registers descriptions for the coordinator's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("saga_started_total", "Saga instances started");
    metrics::describe_counter!("saga_recovered_total", "Instances resumed from the saga log");
    metrics::describe_counter!("saga_step_attempts_total", "Step action invocations");
    metrics::describe_counter!("saga_step_retries_total", "Scheduled step retries");
    metrics::describe_counter!("saga_step_timeouts_total", "Step attempts that timed out");
    metrics::describe_counter!("saga_completed_total", "Instances that completed");
    metrics::describe_counter!("saga_compensated_total", "Instances rolled back");
    metrics::describe_counter!(
        "saga_compensation_failed_total",
        "Instances stuck in CompensationFailed"
    );
    metrics::describe_counter!("saga_abandoned_total", "Instances abandoned by an operator");
    metrics::describe_counter!(
        "saga_log_append_failures_total",
        "Failed saga log append attempts"
    );
    metrics::describe_counter!(
        "saga_log_sequence_conflicts_total",
        "PostgreSQL appends that lost a race for a sequence number"
    );
    metrics::describe_histogram!(
        "saga_log_append_seconds",
        metrics::Unit::Seconds,
        "PostgreSQL saga log append latency"
    );
    metrics::describe_histogram!(
        "saga_duration_seconds",
        metrics::Unit::Seconds,
        "Time from start to terminal state"
    );
}

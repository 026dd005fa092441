//! API server entry point.

use std::time::Duration;

use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::InMemoryStepInvoker;
use saga_log::{InMemorySagaLog, PostgresSagaLog, SagaLog};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Recovers unfinished instances, then serves until a shutdown signal.
async fn serve<L: SagaLog + 'static>(log: L, config: &Config, metrics_handle: PrometheusHandle) {
    // Demo invoker: every action succeeds after a short delay.
    let invoker = InMemoryStepInvoker::with_latency(Duration::from_millis(50));
    let state = api::create_default_state(log, invoker, config.coordinator_config())
        .expect("failed to register saga definitions");

    let resumed = state
        .coordinator
        .recover()
        .await
        .expect("failed to recover saga instances");
    tracing::info!(count = resumed.len(), "recovered unfinished saga instances");

    let app = api::create_app(state.clone(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    state.coordinator.shutdown().await;
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::describe_metrics();

    // 3. Pick the saga log backend and serve
    match &config.database_url {
        Some(url) => {
            let log = PostgresSagaLog::connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            log.run_migrations()
                .await
                .expect("failed to run saga log migrations");
            tracing::info!("using PostgreSQL saga log");
            serve(log, &config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga log is kept in memory");
            serve(InMemorySagaLog::new(), &config, metrics_handle).await;
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, StatusCode};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use laminar_api::config::ServerConfig;
use laminar_api::gateway::Gateway;
use laminar_api::{background, routes, state};
use laminar_core::executor::EchoExecutor;
use laminar_core::ComputeEngine;

use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "laminar_api=debug,laminar_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Compute engine ---
    let executor =
        EchoExecutor::with_service_time(Duration::from_millis(config.simulated_service_ms));
    let engine = Arc::new(
        ComputeEngine::start(config.engine.clone(), executor)
            .expect("Failed to start compute engine"),
    );

    // --- Gateway tier ---
    let gateway = Arc::new(Gateway::new(Arc::clone(&engine), config.gateway.clone()));
    tracing::info!(
        cache_ttl_ms = config.gateway.cache_ttl.as_millis() as u64,
        engine_timeout_ms = config.gateway.engine_timeout.as_millis() as u64,
        "Gateway tier ready"
    );

    // --- Cache janitor ---
    let janitor_cancel = tokio_util::sync::CancellationToken::new();
    let janitor_handle = tokio::spawn(background::cache_janitor::run(
        Arc::clone(&gateway),
        Duration::from_secs(config.cache_janitor_interval_secs),
        janitor_cancel.clone(),
    ));

    // --- CORS ---
    let cors = build_cors_layer(&config);

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        engine: Arc::clone(&engine),
        gateway,
    };

    // --- Request ID header name ---
    let request_id_header = HeaderName::from_static("x-request-id");

    // --- Router ---
    let app = Router::new()
        // Health check at root level (not under /api/v1).
        .merge(routes::health::router())
        // API v1 routes.
        .nest("/api/v1", routes::api_routes())
        // -- Middleware stack (applied bottom-up) --
        // Panic recovery: catch panics and return 500 JSON.
        .layer(CatchPanicLayer::new())
        // Request timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        // Propagate request ID to response.
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        // Structured request/response tracing.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Set request ID on incoming requests.
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid,
        ))
        // CORS.
        .layer(cors)
        // Shared state.
        .with_state(state);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the janitor; it holds the last gateway reference.
    janitor_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), janitor_handle).await;
    tracing::info!("Cache janitor stopped");

    // Close shard queues and wait for workers to drain.
    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            let drain = tokio::task::spawn_blocking(move || engine.shutdown());
            let timeout = Duration::from_secs(config.shutdown_timeout_secs);
            if tokio::time::timeout(timeout, drain).await.is_err() {
                tracing::warn!(
                    timeout_secs = config.shutdown_timeout_secs,
                    "Shard workers did not drain in time"
                );
            }
        }
        Err(_) => {
            tracing::warn!("Compute engine still referenced; shard workers left to exit on their own");
        }
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Build the CORS middleware layer from server configuration.
///
/// Panics at startup if any configured origin is invalid.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse()
                .unwrap_or_else(|e| panic!("Invalid CORS origin '{o}': {e}"))
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(3600))
}

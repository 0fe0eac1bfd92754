use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use blockrelay_engine::{LogReader, ReaderConfig, ToolLoopCoordinator};

use crate::{handlers, streams};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound on one blocking log read while following a stream.
    pub read_block_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9091,
            read_block_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ToolLoopCoordinator>,
    pub reader: LogReader,
}

impl AppState {
    pub fn new(coordinator: Arc<ToolLoopCoordinator>, config: &ServerConfig) -> Self {
        let reader = LogReader::new(
            Arc::clone(coordinator.log()),
            ReaderConfig {
                block_timeout: config.read_block_timeout,
                ..ReaderConfig::default()
            },
        );
        Self { coordinator, reader }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/queries", post(handlers::submit_query))
        .route("/v1/queries/{query_id}/tool-responses", post(handlers::submit_tool_responses))
        .route("/v1/sessions/{session_id}/cancel", post(handlers::cancel_session))
        .route("/v1/streams/{stream_id}", get(streams::follow_stream))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, coordinator: Arc<ToolLoopCoordinator>) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState::new(coordinator, &config));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "blockrelay server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests. Open SSE
    /// followers are cut off once their current read returns.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.server).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "server did not stop in time, aborting");
            self.server.abort();
        }
    }
}

use crate::config::ApiConfig;
use crate::router::EventRouter;
use crate::worker::PartitionStats;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/partitions", get(list_partitions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

/// State of every partition this instance is processing
async fn list_partitions(
    State(state): State<AppState>,
) -> Result<Json<Vec<PartitionStats>>, (StatusCode, Json<ErrorResponse>)> {
    state.router.stats().await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to collect partition stats");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "PARTITION_UNAVAILABLE".to_string(),
            }),
        )
    })
}

/// Serve the admin API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting admin API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::{CleanupDispatcher, MockCleanupService};
    use crate::worker::WorkerSettings;
    use axum::body::Body;
    use axum::http::Request;
    use friendlink_pipeline::{IncomingMessage, MessageHandler, MessageMetadata, TopicConfig};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let (dispatcher, _handle) = CleanupDispatcher::start(Arc::new(MockCleanupService::new()), 4, 1);
        let settings = WorkerSettings {
            sweep_interval: Duration::from_secs(3600),
            flush_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(1),
            channel_capacity: 8,
        };
        let router = EventRouter::new(
            TopicConfig::default(),
            dir.path().to_path_buf(),
            settings,
            dispatcher,
            CancellationToken::new(),
        );
        (
            dir,
            AppState {
                router: Arc::new(router),
            },
        )
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = state();
        let (status, body) = get_body(create_router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_partitions_lists_worker_state() {
        let (_dir, state) = state();
        let topics = TopicConfig::default();

        state
            .router
            .handle(IncomingMessage {
                payload: br#"{"friendCode":"code","clickedAt":1}"#.to_vec(),
                metadata: MessageMetadata {
                    topic: topics.clicks.clone(),
                    partition: 3,
                    offset: 10,
                    key: Some(b"code".to_vec()),
                    timestamp: None,
                    headers: HashMap::new(),
                },
            })
            .await
            .unwrap();

        let (status, body) = get_body(create_router(state.clone()), "/partitions").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "partition": 3,
                "expiryEntries": 0,
                "pendingCounters": 1,
                "inflightExpiries": 0,
                "inflightFlushes": 0
            }])
        );

        state.router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_partitions_empty_before_first_record() {
        let (_dir, state) = state();
        let (status, body) = get_body(create_router(state), "/partitions").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }
}

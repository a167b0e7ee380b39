//! Read-only HTTP control server.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /health` | [HealthResponse], `503` while the relayer is stopped |
//! | `GET /status` | [StatusResponse] |
//! | `GET /finality/{chain_id}/{height}` | [FinalityResponse], `404` if unknown |
//! | `GET /checkpoint` | [CheckpointResponse] |
//! | `GET /pending` | [PendingResponse] |
//! | `GET /stats` | [FinalityStoreStats] of the source chain |
//! | `GET /metrics` | OpenMetrics text |
//!
//! Failures are reported as an [ErrorResponse].

use crate::{
    checkpoint::Checkpoint,
    config::{format_duration, RpcConfig},
    finality_store::FinalityStore,
    metrics,
    service::StatusHandle,
    types::{FinalityInfo, FinalityStoreStats, PendingAttestation, RelayerStatus},
    Error,
};
use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::Instant};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Content type of the metrics endpoint.
pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Everything the handlers read.
#[derive(Clone)]
pub struct AppState {
    status: StatusHandle,
    store: Arc<FinalityStore>,
    checkpoint: Arc<Checkpoint>,
    registry: Arc<Registry>,
    chain_id: String,
    started_at: Instant,
}

impl AppState {
    /// State serving the relayer of `chain_id`.
    pub fn new(
        status: StatusHandle,
        store: Arc<FinalityStore>,
        checkpoint: Arc<Checkpoint>,
        registry: Arc<Registry>,
        chain_id: &str,
    ) -> Self {
        Self {
            status,
            store,
            checkpoint,
            registry,
            chain_id: chain_id.to_string(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: RelayerStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalityResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finality_info: Option<FinalityInfo>,
    pub found: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointResponse {
    pub last_finality_height: u64,
    pub pending_attestations: BTreeMap<String, PendingAttestation>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A failed request.
struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(error: &'static str, message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
            message: message.to_string(),
        }
    }

    fn internal(err: Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal error",
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error.to_string(),
            code: self.status.as_u16(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.get();
    let code = if status.running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let uptime = Duration::from_secs(state.started_at.elapsed().as_secs());
    let body = HealthResponse {
        healthy: status.running,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: format_duration(uptime),
        last_error: status.last_error,
        timestamp: Utc::now(),
    };
    (code, Json(body))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.status.get(),
        timestamp: Utc::now(),
    })
}

async fn finality(
    State(state): State<AppState>,
    Path((chain_id, height)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let height: u64 = height
        .parse()
        .map_err(|e| ApiError::bad_request("invalid height parameter", e))?;
    let info = state
        .store
        .get(&chain_id, height)
        .map_err(ApiError::internal)?;
    let code = if info.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    let body = FinalityResponse {
        found: info.is_some(),
        finality_info: info,
    };
    Ok((code, Json(body)).into_response())
}

async fn checkpoint(State(state): State<AppState>) -> Json<CheckpointResponse> {
    let snapshot = state.checkpoint.state();
    Json(CheckpointResponse {
        last_finality_height: snapshot.last_finality_block_height,
        pending_attestations: snapshot.pending_attestations,
        timestamp: Utc::now(),
    })
}

async fn pending(State(state): State<AppState>) -> Json<PendingResponse> {
    Json(PendingResponse {
        count: state.checkpoint.pending_attestations().len(),
        timestamp: Utc::now(),
    })
}

async fn stats(State(state): State<AppState>) -> Result<Json<FinalityStoreStats>, ApiError> {
    let stats = state
        .store
        .stats(&state.chain_id)
        .map_err(ApiError::internal)?;
    Ok(Json(stats))
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = metrics::render(&state.registry).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        error: "failed to encode metrics",
        message: e.to_string(),
    })?;
    Ok(([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response())
}

/// Routes of the control server.
pub fn router(state: AppState, config: &RpcConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/finality/{chain_id}/{height}", get(finality))
        .route("/checkpoint", get(checkpoint))
        .route("/pending", get(pending))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(config.write_timeout))
        .layer(RequestBodyTimeoutLayer::new(config.read_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the control API on `config.listen_addr` until `shutdown` fires.
pub async fn serve(
    state: AppState,
    config: &RpcConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| Error::ConfigInvalid(format!("listen_addr {}: {e}", config.listen_addr)))?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "control server listening");
    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("control server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const CHAIN: &str = "cronos_777-1";

    struct Setup {
        router: Router,
        status: StatusHandle,
        store: Arc<FinalityStore>,
        checkpoint: Arc<Checkpoint>,
        metrics: Metrics,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        let metrics = Metrics::register(&mut registry);
        let status = StatusHandle::new(CHAIN, "attestation-1");
        let store = Arc::new(FinalityStore::open(&cronos_kv::Config::memory()).unwrap());
        let checkpoint = Arc::new(Checkpoint::open(dir.path().join("cp.json"), metrics.clone()));
        let state = AppState::new(
            status.clone(),
            store.clone(),
            checkpoint.clone(),
            Arc::new(registry),
            CHAIN,
        );
        Setup {
            router: router(state, &RpcConfig::default()),
            status,
            store,
            checkpoint,
            metrics,
            _dir: dir,
        }
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(router: &Router, uri: &str) -> (StatusCode, T) {
        let (status, body) = get(router, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let s = setup();
        let (code, body): (_, HealthResponse) = get_json(&s.router, "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.healthy);

        s.status.update(|status| status.running = true);
        s.status
            .record_error(&Error::RpcUnavailable("connection refused".into()));
        let (code, body): (_, HealthResponse) = get_json(&s.router, "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.healthy);
        assert!(body.last_error.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_status() {
        let s = setup();
        s.status.update(|status| status.last_block_forwarded = 12);
        let (code, body): (_, serde_json::Value) = get_json(&s.router, "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"]["last_block_forwarded"], 12);
        assert_eq!(body["status"]["source_chain_id"], CHAIN);
    }

    #[tokio::test]
    async fn test_finality() {
        let s = setup();
        s.store
            .save(&FinalityInfo {
                attestation_id: 3,
                chain_id: CHAIN.into(),
                block_height: 10,
                finalized: true,
                finalized_at: 1,
                ..Default::default()
            })
            .unwrap();

        let (code, body): (_, FinalityResponse) =
            get_json(&s.router, &format!("/finality/{CHAIN}/10")).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.found);
        assert_eq!(body.finality_info.unwrap().attestation_id, 3);

        let (code, body): (_, FinalityResponse) =
            get_json(&s.router, &format!("/finality/{CHAIN}/11")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(!body.found);

        let (code, body): (_, ErrorResponse) =
            get_json(&s.router, &format!("/finality/{CHAIN}/abc")).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, 400);
        assert_eq!(body.error, "invalid height parameter");
    }

    #[tokio::test]
    async fn test_checkpoint_and_pending() {
        let s = setup();
        s.checkpoint.update_last_finality_block_height(8);
        s.checkpoint.add_pending_attestation(PendingAttestation {
            tx_hash: "TX".into(),
            chain_id: CHAIN.into(),
            block_height: 9,
            start_height: 9,
            end_height: 9,
            submitted_at: Utc::now(),
            ..Default::default()
        });
        let (_, body): (_, CheckpointResponse) = get_json(&s.router, "/checkpoint").await;
        assert_eq!(body.last_finality_height, 8);
        assert!(body.pending_attestations.contains_key("TX"));

        let (_, body): (_, PendingResponse) = get_json(&s.router, "/pending").await;
        assert_eq!(body.count, 1);
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let s = setup();
        let (code, body): (_, FinalityStoreStats) = get_json(&s.router, "/stats").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.chain_id, CHAIN);
        assert_eq!(body.total_blocks, 0);

        s.metrics.blocks_forwarded.inc_by(5);
        let (code, body) = get(&s.router, "/metrics").await;
        assert_eq!(code, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("blocks_forwarded_total 5"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let s = setup();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/status")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        let response = s.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let s = setup();
        let (code, _) = get(&s.router, "/nope").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}

//! Admin HTTP API
//!
//! Read-only view of the node's local state for operators:
//! - `GET /health`: liveness and identity
//! - `GET /stats`: peer and content totals, local capacity
//! - `GET /peers`: known peers
//! - `GET /content`: every tracked content id with its replica count
//! - `GET /content/:content_id`: one content record and its holders
//! - `GET /metrics`: Prometheus text format

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::capacity::CapacityEstimator;
use crate::common::{Error, NodeMetrics};
use crate::state::{PeerRecord, StateStore};

#[derive(Clone)]
pub struct AdminState {
    pub state: Arc<dyn StateStore>,
    pub estimator: Arc<CapacityEstimator>,
    pub metrics: Arc<NodeMetrics>,
    pub target_replication_factor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer_id: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub peer_id: String,
    pub known_peers: usize,
    pub known_content: usize,
    pub under_replicated: usize,
    pub target_replication_factor: usize,
    pub available_capacity_gb: f64,
    /// Sum of the free capacity peers last announced
    pub network_free_capacity_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub content_id: String,
    pub replicas: usize,
    pub under_replicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDetail {
    pub content_id: String,
    pub declared_size_gb: f64,
    pub last_held_at: u64,
    pub holders: Vec<String>,
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/peers", get(peers))
        .route("/content", get(content_list))
        .route("/content/:content_id", get(content_get))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    let status = match e {
        Error::ContentNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, axum::Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        peer_id: state.state.local_peer_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.metrics.uptime_seconds(),
    })
}

async fn stats(State(state): State<AdminState>) -> Response {
    let counts = match state.state.list_content_with_replica_counts() {
        Ok(counts) => counts,
        Err(e) => return error_response(e),
    };
    let peers = match state.state.list_peers() {
        Ok(peers) => peers,
        Err(e) => return error_response(e),
    };

    let target = state.target_replication_factor;
    axum::Json(StatsResponse {
        peer_id: state.state.local_peer_id().to_string(),
        known_peers: peers.len(),
        known_content: counts.len(),
        under_replicated: counts.iter().filter(|(_, n)| *n < target).count(),
        target_replication_factor: target,
        available_capacity_gb: state.estimator.available_capacity().await,
        network_free_capacity_gb: peers.iter().map(|p| p.free_capacity_gb).sum(),
    })
    .into_response()
}

async fn peers(State(state): State<AdminState>) -> Response {
    match state.state.list_peers() {
        Ok(peers) => axum::Json::<Vec<PeerRecord>>(peers).into_response(),
        Err(e) => error_response(e),
    }
}

async fn content_list(State(state): State<AdminState>) -> Response {
    let target = state.target_replication_factor;
    match state.state.list_content_with_replica_counts() {
        Ok(counts) => {
            let summaries: Vec<ContentSummary> = counts
                .into_iter()
                .map(|(content_id, replicas)| ContentSummary {
                    content_id,
                    replicas,
                    under_replicated: replicas < target,
                })
                .collect();
            axum::Json(summaries).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn content_get(
    State(state): State<AdminState>,
    Path(content_id): Path<String>,
) -> Response {
    let record = match state.state.get_content(&content_id) {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(Error::ContentNotFound(content_id)),
        Err(e) => return error_response(e),
    };
    match state.state.holders_of(&content_id) {
        Ok(holders) => axum::Json(ContentDetail {
            content_id: record.content_id,
            declared_size_gb: record.declared_size_gb,
            last_held_at: record.last_held_at,
            holders,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::state::MemoryStateStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let state = Arc::new(MemoryStateStore::new("self"));
        state
            .apply_announcement("A", 40.0, 100, &["cidX".to_string(), "cidY".to_string()])
            .unwrap();
        state
            .apply_announcement("B", 2.0, 100, &["cidX".to_string()])
            .unwrap();
        let content = Arc::new(MemoryContentStore::standalone(8 * 1024 * 1024 * 1024));
        create_router(AdminState {
            state,
            estimator: Arc::new(CapacityEstimator::new(content, None)),
            metrics: Arc::new(NodeMetrics::new()),
            target_replication_factor: 2,
        })
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_stats() {
        let (status, body) = get(router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: StatsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.peer_id, "self");
        assert_eq!(stats.known_peers, 2);
        assert_eq!(stats.known_content, 2);
        assert_eq!(stats.under_replicated, 1);
        assert_eq!(stats.available_capacity_gb, 8.0);
        assert_eq!(stats.network_free_capacity_gb, 42.0);
    }

    #[tokio::test]
    async fn test_content_endpoints() {
        let (status, body) = get(router(), "/content").await;
        assert_eq!(status, StatusCode::OK);
        let list: Vec<ContentSummary> = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            list,
            vec![
                ContentSummary {
                    content_id: "cidX".into(),
                    replicas: 2,
                    under_replicated: false
                },
                ContentSummary {
                    content_id: "cidY".into(),
                    replicas: 1,
                    under_replicated: true
                },
            ]
        );

        let (status, body) = get(router(), "/content/cidX").await;
        assert_eq!(status, StatusCode::OK);
        let detail: ContentDetail = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail.holders, vec!["A".to_string(), "B".to_string()]);

        let (status, _) = get(router(), "/content/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (status, body) = get(router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.peer_id, "self");

        let (status, body) = get(router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("tnet_known_peers"));
    }
}

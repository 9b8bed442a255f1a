// =============================================================================
// SYNAPSE NODE : api.rs
// Read-only HTTP status surface (served only when api.port is set)
// =============================================================================

use crate::constants::VERSION;
use crate::error::{NetworkError, Result};
use crate::network::{Network, NetworkStatus};
use crate::pool::PeerSnapshot;
use crate::topology::NetworkMetrics;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub const BEST_PEERS_SHOWN: usize = 5;

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub network: NetworkStatus,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct TopologyResponse {
    pub topology_type: String,
    pub best_peers: Vec<String>,
    pub metrics: NetworkMetrics,
}

async fn status_handler(State(net): State<Arc<Network>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        network: net.status(),
        version: VERSION.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn peers_handler(State(net): State<Arc<Network>>) -> Json<serde_json::Value> {
    let peers: Vec<PeerSnapshot> = net.peers();
    Json(serde_json::json!({
        "peers": peers.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
        "count": peers.len(),
        "details": peers,
    }))
}

async fn topology_handler(State(net): State<Arc<Network>>) -> Json<TopologyResponse> {
    let topology = net.topology();
    Json(TopologyResponse {
        topology_type: topology.topology_type().to_string(),
        best_peers: topology.get_best_peers(BEST_PEERS_SHOWN),
        metrics: topology.network_metrics(),
    })
}

pub fn router(net: Arc<Network>) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/peers", get(peers_handler))
        .route("/v1/topology", get(topology_handler))
        .with_state(net)
}

/// Serve until the network's shutdown token fires.
pub async fn serve(net: Arc<Network>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("📊 Status API on http://{}/v1/status", listener.local_addr()?);

    let shutdown = net.shutdown_token();
    axum::serve(listener, router(net))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(NetworkError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::test_keys;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn network() -> Arc<Network> {
        let id = uuid::Uuid::new_v4().to_string();
        Network::new(&id, &Config::default(), Arc::new(test_keys::identity(0))).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_route() {
        let net = network();
        let json = get_json(router(net.clone()), "/v1/status").await;
        assert_eq!(json["node_id"], net.node_id());
        assert_eq!(json["listening"], false);
        assert_eq!(json["total_peers"], 0);
        assert!(json["unhealthy_peers"].as_array().unwrap().is_empty());
        assert_eq!(json["version"], VERSION);
        assert!(json["stats"]["messages_sent"].is_u64());
    }

    #[tokio::test]
    async fn test_peers_route_empty() {
        let json = get_json(router(network()), "/v1/peers").await;
        assert_eq!(json["count"], 0);
        assert!(json["peers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topology_route() {
        let net = network();
        for id in ["a", "b", "c", "d"] {
            net.topology().add_peer(id, "10.0.0.1:9000");
        }
        net.topology().update_peer_reputation("c", 1.0);

        let json = get_json(router(net), "/v1/topology").await;
        assert_eq!(json["topology_type"], "full-mesh");
        assert_eq!(json["best_peers"][0], "c");
        assert_eq!(json["metrics"]["total_peers"], 4);
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let resp = router(network())
            .oneshot(Request::builder().uri("/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

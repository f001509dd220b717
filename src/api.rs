//! Admin API

use axum::{extract::State, routing::get, Json, Router};
use portway_control::{HttpTunnelRelay, TcpTunnelRelay, TcpTunnelSummary, TunnelSummary};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct AdminState {
    pub http: Arc<HttpTunnelRelay>,
    pub tcp: Arc<TcpTunnelRelay>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_tunnels: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelList {
    pub http: Vec<TunnelSummary>,
    pub tcp: Vec<TcpTunnelSummary>,
    pub total: usize,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/tunnels", get(list_tunnels))
        .with_state(state)
}

async fn health_check(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tunnels: state.http.tunnel_count() + state.tcp.tunnel_count(),
    })
}

async fn list_tunnels(State(state): State<AdminState>) -> Json<TunnelList> {
    debug!("Listing tunnels");

    let http = state.http.active_tunnels();
    let tcp = state.tcp.active_tunnels();
    let total = http.len() + tcp.len();
    Json(TunnelList { http, tcp, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use portway_control::{ControlChannel, RegisterOptions, RelayConfig};
    use portway_relay_db::MemoryTunnelStore;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let config = RelayConfig {
            domain: "tunnel.test".to_string(),
            ..RelayConfig::default()
        };
        AdminState {
            http: Arc::new(HttpTunnelRelay::new(
                config.clone(),
                Arc::new(MemoryTunnelStore::new()),
            )),
            tcp: Arc::new(TcpTunnelRelay::new(config)),
        }
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let body = get_json(router(state()), "/api/health").await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_tunnels"], 0);
    }

    #[tokio::test]
    async fn test_list_tunnels() {
        let state = state();
        let (channel, _rx) = ControlChannel::new(None, 4);
        state
            .http
            .register(
                channel,
                RegisterOptions {
                    subdomain: Some("listed".to_string()),
                    local_port: 3000,
                    ..RegisterOptions::default()
                },
            )
            .await
            .unwrap();

        let body = get_json(router(state), "/api/tunnels").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["http"][0]["subdomain"], "listed");
        assert_eq!(body["http"][0]["public_url"], "http://listed.tunnel.test");
        assert_eq!(body["http"][0]["state"], "active");
    }
}

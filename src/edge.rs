//! Public HTTP edge
//!
//! Routes `Host: <subdomain>.<domain>` requests into HTTP tunnels.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use portway_control::{error::ceil_secs, HttpRequestDescriptor, HttpTunnelRelay, RelayError};
use portway_proto::{Headers, HttpResponsePayload};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EdgeState {
    relay: Arc<HttpTunnelRelay>,
}

impl EdgeState {
    pub fn new(relay: Arc<HttpTunnelRelay>) -> Self {
        Self { relay }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub fn router(state: EdgeState) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

/// Subdomain label from a Host header, if it belongs to `domain`
pub fn subdomain_from_host<'a>(host: &'a str, domain: &str) -> Option<&'a str> {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let label = host
        .strip_suffix(domain)?
        .strip_suffix('.')
        .filter(|label| !label.is_empty() && !label.contains('.'))?;
    Some(label)
}

/// Password part of an HTTP Basic `Authorization` header
pub fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

async fn proxy(State(state): State<EdgeState>, request: Request) -> Response {
    let config = state.relay.config();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let Some(subdomain) = subdomain_from_host(&host, &config.domain).map(str::to_string) else {
        debug!("No tunnel for host '{}'", host);
        return error_response(RelayError::NotFound(host));
    };

    // allow-list first so denied addresses cannot probe passwords
    match state.relay.admit_visitor(&subdomain, client_ip).await {
        Ok(true) => {
            let Some(password) = basic_auth_password(request.headers()) else {
                return auth_challenge("This tunnel is password protected");
            };
            match state
                .relay
                .verify_tunnel_password(&subdomain, &password, client_ip)
                .await
            {
                Ok(()) => {}
                Err(RelayError::Forbidden(_)) => return auth_challenge("Invalid tunnel password"),
                Err(e) => return error_response(e),
            }
        }
        Ok(false) => {}
        Err(e) => return error_response(e),
    }

    let (parts, body) = request.into_parts();
    let limit = config.max_body_bytes;
    let bytes = match to_bytes(body, limit.saturating_add(1)).await {
        Ok(bytes) if bytes.len() <= limit => bytes,
        Ok(bytes) => {
            return error_response(RelayError::PayloadTooLarge {
                size: bytes.len(),
                limit,
            })
        }
        Err(e) => {
            debug!("Failed to read request body for '{}': {}", subdomain, e);
            return error_response(RelayError::PayloadTooLarge {
                size: limit.saturating_add(1),
                limit,
            });
        }
    };

    let mut headers = Headers::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }

    let descriptor = HttpRequestDescriptor {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |p| p.as_str().to_string()),
        headers,
        body: (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).into_owned()),
        client_ip,
    };

    match state.relay.forward_request(&subdomain, descriptor).await {
        Ok(response) => tunnel_response(response),
        Err(e) => error_response(e),
    }
}

fn tunnel_response(payload: HttpResponsePayload) -> Response {
    let status = StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(payload.body.unwrap_or_default()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in payload.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
                    headers.insert(name, value);
                }
            }
            _ => warn!("Dropping invalid response header '{}'", name),
        }
    }
    response
}

fn auth_challenge(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"portway\"")],
        Json(ErrorResponse {
            error: message.to_string(),
            code: "UNAUTHORIZED".to_string(),
        }),
    )
        .into_response()
}

pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::InvalidSubdomain(_) | RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Expired(_) => StatusCode::GONE,
        RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
        RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RelayError::TunnelClosed | RelayError::Upstream(_) | RelayError::Channel(_) => {
            StatusCode::BAD_GATEWAY
        }
        RelayError::Overloaded(_) | RelayError::AllocationExhausted(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: RelayError) -> Response {
    let status = status_for(&error);
    let body = Json(ErrorResponse {
        error: error.to_string(),
        code: error.code().to_string(),
    });

    match error {
        RelayError::RateLimited { retry_after } => (
            status,
            [(header::RETRY_AFTER, ceil_secs(retry_after).to_string())],
            body,
        )
            .into_response(),
        _ => (status, body).into_response(),
    }
}

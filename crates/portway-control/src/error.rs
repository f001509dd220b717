//! Relay error taxonomy

use portway_auth::{IpFilterError, PasswordError};
use portway_proto::ErrorPayload;
use portway_relay_db::StoreError;
use portway_router::SubdomainError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(#[from] SubdomainError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0} is already in use")]
    Conflict(String),

    #[error("No active tunnel for '{0}'")]
    NotFound(String),

    #[error("Tunnel '{0}' has expired")]
    Expired(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Too many failed attempts, retry in {}s", ceil_secs(*retry_after))]
    RateLimited { retry_after: Duration },

    #[error("Timed out after {0:?} waiting for the tunnel to respond")]
    Timeout(Duration),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Tunnel client could not reach the local service: {0}")]
    Upstream(String),

    #[error("Tunnel '{0}' has too many requests in flight")]
    Overloaded(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("No free TCP port after {0} attempts")]
    AllocationExhausted(u32),

    #[error("Control channel error: {0}")]
    Channel(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Stable code sent to clients in `ERROR` payloads
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidSubdomain(_) | RelayError::Validation(_) => "VALIDATION_ERROR",
            RelayError::Conflict(_) => "CONFLICT",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::Expired(_) => "EXPIRED",
            RelayError::Forbidden(_) => "FORBIDDEN",
            RelayError::RateLimited { .. } => "RATE_LIMITED",
            RelayError::Timeout(_) => "TIMEOUT",
            RelayError::TunnelClosed => "TUNNEL_CLOSED",
            RelayError::Upstream(_) => "UPSTREAM_ERROR",
            RelayError::Overloaded(_) => "OVERLOADED",
            RelayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            RelayError::AllocationExhausted(_) => "ALLOCATION_EXHAUSTED",
            RelayError::Channel(_) => "CHANNEL_ERROR",
            RelayError::Store(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error should tear the whole tunnel down
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Channel(_))
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let mut payload = ErrorPayload::new(self.code(), self.to_string());
        if let RelayError::RateLimited { retry_after } = self {
            payload.retry_after_secs = Some(ceil_secs(*retry_after));
        }
        payload
    }
}

/// Whole seconds to wait, rounded up and never zero
pub fn ceil_secs(duration: Duration) -> u64 {
    (duration.as_secs() + u64::from(duration.subsec_nanos() > 0)).max(1)
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(subdomain) => RelayError::Conflict(format!("Subdomain '{subdomain}'")),
            other => RelayError::Store(other.to_string()),
        }
    }
}

impl From<IpFilterError> for RelayError {
    fn from(err: IpFilterError) -> Self {
        RelayError::Validation(format!("IP allow-list: {err}"))
    }
}

impl From<PasswordError> for RelayError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::TooLong => RelayError::Validation(err.to_string()),
            other => RelayError::Store(other.to_string()),
        }
    }
}

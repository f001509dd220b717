//! Tunnel registration store abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

use crate::entities::tunnel_registration;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Subdomain '{0}' is already claimed by an active tunnel")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Durable tunnel metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelRegistration {
    pub subdomain: String,
    pub tunnel_id: String,
    pub local_port: u16,
    pub local_host: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub ip_allow_list: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub inspect: bool,
    pub total_requests: u64,
    pub is_active: bool,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TunnelRegistration {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_password_protected(&self) -> bool {
        self.password_hash.is_some()
    }
}

impl TryFrom<tunnel_registration::Model> for TunnelRegistration {
    type Error = StoreError;

    fn try_from(model: tunnel_registration::Model) -> Result<Self, StoreError> {
        let local_port = u16::try_from(model.local_port).map_err(|_| {
            StoreError::InvalidRecord(format!(
                "local_port {} out of range for '{}'",
                model.local_port, model.subdomain
            ))
        })?;

        Ok(Self {
            subdomain: model.subdomain,
            tunnel_id: model.tunnel_id,
            local_port,
            local_host: model.local_host,
            password_hash: model.password_hash,
            ip_allow_list: model.ip_allow_list,
            expires_at: model.expires_at,
            inspect: model.inspect,
            total_requests: u64::try_from(model.total_requests).unwrap_or(0),
            is_active: model.is_active,
            last_active_at: model.last_active_at,
            created_at: model.created_at,
        })
    }
}

/// Fields supplied when claiming a subdomain
#[derive(Debug, Clone, PartialEq)]
pub struct NewRegistration {
    pub subdomain: String,
    pub tunnel_id: String,
    pub local_port: u16,
    pub local_host: String,
    pub password_hash: Option<String>,
    pub ip_allow_list: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub inspect: bool,
}

impl NewRegistration {
    pub fn new(subdomain: impl Into<String>, tunnel_id: impl Into<String>, local_port: u16) -> Self {
        Self {
            subdomain: subdomain.into(),
            tunnel_id: tunnel_id.into(),
            local_port,
            local_host: "localhost".to_string(),
            password_hash: None,
            ip_allow_list: None,
            expires_at: None,
            inspect: false,
        }
    }

    pub(crate) fn into_registration(self, now: DateTime<Utc>) -> TunnelRegistration {
        TunnelRegistration {
            subdomain: self.subdomain,
            tunnel_id: self.tunnel_id,
            local_port: self.local_port,
            local_host: self.local_host,
            password_hash: self.password_hash,
            ip_allow_list: self.ip_allow_list,
            expires_at: self.expires_at,
            inspect: self.inspect,
            total_requests: 0,
            is_active: true,
            last_active_at: now,
            created_at: now,
        }
    }
}

/// Persistence collaborator used by the relays
///
/// `claim` is the only operation that decides subdomain ownership and must be
/// atomic: when several callers race for the same subdomain, at most one may
/// succeed. A claim succeeds when the subdomain is unknown, when its row is
/// inactive, or when the active row has not been touched within the store's
/// stale window.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn claim(&self, registration: NewRegistration) -> Result<TunnelRegistration, StoreError>;

    async fn find_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<TunnelRegistration>, StoreError>;

    /// Refresh `last_active_at` and add `requests` to the request counter
    async fn record_activity(&self, subdomain: &str, requests: u64) -> Result<(), StoreError>;

    /// Mark the registration inactive if `tunnel_id` still owns it
    async fn deactivate(&self, subdomain: &str, tunnel_id: &str) -> Result<bool, StoreError>;

    async fn list_active(&self) -> Result<Vec<TunnelRegistration>, StoreError>;
}

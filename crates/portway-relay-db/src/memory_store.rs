//! In-memory tunnel store for tests and single-process deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::db_store::{to_chrono, DEFAULT_STALE_AFTER};
use crate::store::{NewRegistration, StoreError, TunnelRegistration, TunnelStore};

#[derive(Clone)]
pub struct MemoryTunnelStore {
    registrations: Arc<Mutex<HashMap<String, TunnelRegistration>>>,
    stale_after: chrono::Duration,
}

impl MemoryTunnelStore {
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(Mutex::new(HashMap::new())),
            stale_after: to_chrono(DEFAULT_STALE_AFTER),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = to_chrono(stale_after);
        self
    }

    /// Replace a stored registration wholesale
    pub async fn put(&self, registration: TunnelRegistration) {
        self.registrations
            .lock()
            .await
            .insert(registration.subdomain.clone(), registration);
    }
}

impl Default for MemoryTunnelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelStore for MemoryTunnelStore {
    async fn claim(&self, new: NewRegistration) -> Result<TunnelRegistration, StoreError> {
        let now = Utc::now();
        let mut registrations = self.registrations.lock().await;

        let stale_before = now
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let total_requests = match registrations.get(&new.subdomain) {
            Some(existing) if existing.is_active && existing.last_active_at >= stale_before =>
            {
                return Err(StoreError::Conflict(new.subdomain));
            }
            Some(existing) => existing.total_requests,
            None => 0,
        };

        let created_at = registrations
            .get(&new.subdomain)
            .map_or(now, |existing| existing.created_at);
        let mut registration = new.into_registration(now);
        registration.total_requests = total_requests;
        registration.created_at = created_at;

        registrations.insert(registration.subdomain.clone(), registration.clone());
        Ok(registration)
    }

    async fn find_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<TunnelRegistration>, StoreError> {
        Ok(self.registrations.lock().await.get(subdomain).cloned())
    }

    async fn record_activity(&self, subdomain: &str, requests: u64) -> Result<(), StoreError> {
        if let Some(registration) = self.registrations.lock().await.get_mut(subdomain) {
            registration.total_requests = registration.total_requests.saturating_add(requests);
            registration.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn deactivate(&self, subdomain: &str, tunnel_id: &str) -> Result<bool, StoreError> {
        let mut registrations = self.registrations.lock().await;
        match registrations.get_mut(subdomain) {
            Some(registration) if registration.tunnel_id == tunnel_id && registration.is_active => {
                registration.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<TunnelRegistration>, StoreError> {
        Ok(self
            .registrations
            .lock()
            .await
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }
}

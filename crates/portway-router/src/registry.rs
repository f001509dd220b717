//! Route registry mapping public identifiers to live tunnels

use crate::RouteKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Route target information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub tunnel_id: String,
    /// Local service on the client side (e.g. "localhost:3000")
    pub target_addr: String,
}

impl RouteTarget {
    pub fn new(tunnel_id: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            target_addr: target_addr.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Route not found: {0}")]
    RouteNotFound(RouteKey),

    #[error("Route already exists: {0}")]
    RouteAlreadyExists(RouteKey),
}

/// Concurrent route table
///
/// Cloning is cheap and clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Arc<DashMap<RouteKey, RouteTarget>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route; fails if the key is already taken
    pub fn register(&self, key: RouteKey, target: RouteTarget) -> Result<(), RouteError> {
        match self.routes.entry(key) {
            Entry::Occupied(existing) => Err(RouteError::RouteAlreadyExists(existing.key().clone())),
            Entry::Vacant(slot) => {
                trace!("Registering route {} -> {}", slot.key(), target.tunnel_id);
                slot.insert(target);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, key: &RouteKey) -> Result<RouteTarget, RouteError> {
        self.routes
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouteError::RouteNotFound(key.clone()))
    }

    pub fn unregister(&self, key: &RouteKey) -> Result<RouteTarget, RouteError> {
        self.routes
            .remove(key)
            .map(|(_, target)| target)
            .ok_or_else(|| RouteError::RouteNotFound(key.clone()))
    }

    /// Remove the route only while it still points at `tunnel_id`
    pub fn unregister_owned(&self, key: &RouteKey, tunnel_id: &str) -> bool {
        self.routes
            .remove_if(key, |_, target| target.tunnel_id == tunnel_id)
            .is_some()
    }

    pub fn exists(&self, key: &RouteKey) -> bool {
        self.routes.contains_key(key)
    }

    pub fn all_routes(&self) -> Vec<(RouteKey, RouteTarget)> {
        self.routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = RouteRegistry::new();
        let key = RouteKey::Subdomain("my-app".to_string());
        registry
            .register(key.clone(), RouteTarget::new("t-1", "localhost:3000"))
            .unwrap();

        let found = registry.lookup(&key).unwrap();
        assert_eq!(found.tunnel_id, "t-1");
        assert_eq!(found.target_addr, "localhost:3000");
        assert!(registry.exists(&key));
    }

    #[test]
    fn test_duplicate_key_keeps_first_owner() {
        let registry = RouteRegistry::new();
        let key = RouteKey::TcpPort(10042);
        registry
            .register(key.clone(), RouteTarget::new("t-1", "localhost:5432"))
            .unwrap();

        let err = registry
            .register(key.clone(), RouteTarget::new("t-2", "localhost:5432"))
            .unwrap_err();
        assert_eq!(err, RouteError::RouteAlreadyExists(key.clone()));
        assert_eq!(registry.lookup(&key).unwrap().tunnel_id, "t-1");
    }

    #[test]
    fn test_unregister_owned_ignores_other_tunnels() {
        let registry = RouteRegistry::new();
        let key = RouteKey::Subdomain("shared".to_string());
        registry
            .register(key.clone(), RouteTarget::new("new-owner", "localhost:80"))
            .unwrap();

        assert!(!registry.unregister_owned(&key, "old-owner"));
        assert!(registry.exists(&key));
        assert!(registry.unregister_owned(&key, "new-owner"));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_missing_route() {
        let registry = RouteRegistry::new();
        let key = RouteKey::TcpPort(8080);
        assert_eq!(
            registry.lookup(&key).unwrap_err(),
            RouteError::RouteNotFound(key.clone())
        );
        assert!(registry.unregister(&key).is_err());
    }

    #[test]
    fn test_clones_share_table() {
        let registry = RouteRegistry::new();
        let other = registry.clone();
        registry
            .register(RouteKey::TcpPort(1), RouteTarget::new("t", "x"))
            .unwrap();
        assert_eq!(other.count(), 1);
        assert_eq!(other.all_routes().len(), 1);
    }
}

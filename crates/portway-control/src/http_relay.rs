//! HTTP tunnel relay
//!
//! Maps subdomains to live control channels, forwards HTTP requests as
//! `REQUEST` messages and correlates the `RESPONSE`s that come back.
//!
//! Each tunnel moves through `Registering → Active → Closed`. Inbound traffic
//! from the transport enters through [`HttpTunnelRelay::handle_channel_event`]
//! one event at a time, and [`HttpTunnelRelay::unregister`] is the single
//! teardown path.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portway_auth::{
    hash_password_with, is_allowed, parse_allow_list, verify_password, IpFilter, RateLimiter,
};
use portway_proto::{
    Headers, HttpRequestPayload, HttpResponsePayload, RegisterPayload, TunnelMessage,
};
use portway_relay_db::{NewRegistration, StoreError, TunnelRegistration, TunnelStore};
use portway_router::{RouteKey, RouteRegistry, RouteTarget, SubdomainAllocator};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ControlChannel};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pending_requests::PendingRequests;

/// Options for opening an HTTP tunnel
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Requested subdomain; one is generated when absent
    pub subdomain: Option<String>,
    pub local_port: u16,
    pub local_host: Option<String>,
    pub password: Option<String>,
    pub ip_allow_list: Option<String>,
    pub expires_in: Option<Duration>,
    pub inspect: bool,
}

impl From<RegisterPayload> for RegisterOptions {
    fn from(payload: RegisterPayload) -> Self {
        Self {
            subdomain: payload.subdomain,
            local_port: payload.local_port,
            local_host: payload.local_host,
            password: payload.password,
            ip_allow_list: payload.ip_allow_list,
            expires_in: payload.expires_in_secs.map(Duration::from_secs),
            inspect: payload.inspect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
}

/// An HTTP request arriving at the public edge
#[derive(Debug, Clone, Default)]
pub struct HttpRequestDescriptor {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Registering,
    Active,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Registering,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

/// Live HTTP tunnel bound to one control channel
pub struct TunnelConnection {
    id: String,
    subdomain: String,
    channel: ControlChannel,
    state: AtomicU8,
    pending: PendingRequests,
    connected_at: DateTime<Utc>,
}

impl TunnelConnection {
    fn new(subdomain: String, channel: ControlChannel, max_in_flight: usize) -> Self {
        Self {
            id: channel.id().to_string(),
            subdomain,
            channel,
            state: AtomicU8::new(ConnectionState::Registering as u8),
            pending: PendingRequests::new(max_in_flight),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }
}

/// Snapshot of an active tunnel for listings
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    pub state: ConnectionState,
    pub pending_requests: usize,
    pub connected_at: DateTime<Utc>,
}

fn check_allow_list(
    registration: &TunnelRegistration,
    client_ip: Option<IpAddr>,
) -> Result<(), RelayError> {
    if let (Some(ip), Some(raw)) = (client_ip, registration.ip_allow_list.as_deref()) {
        if !is_allowed(ip, &parse_allow_list(raw)) {
            warn!("🚫 {} denied by allow-list of '{}'", ip, registration.subdomain);
            return Err(RelayError::Forbidden(format!(
                "{} is not allowed to access this tunnel",
                ip
            )));
        }
    }
    Ok(())
}

/// Rate-limiter key for password attempts
pub fn password_attempt_key(subdomain: &str, client_ip: Option<IpAddr>) -> String {
    match client_ip {
        Some(ip) => format!("{}|{}", subdomain, portway_auth::normalize_ip(ip)),
        None => subdomain.to_string(),
    }
}

pub struct HttpTunnelRelay {
    config: RelayConfig,
    store: Arc<dyn TunnelStore>,
    allocator: SubdomainAllocator,
    rate_limiter: Arc<RateLimiter>,
    /// Tunnel id -> connection
    connections: DashMap<String, Arc<TunnelConnection>>,
    /// Subdomain -> tunnel id
    routes: RouteRegistry,
}

impl HttpTunnelRelay {
    pub fn new(config: RelayConfig, store: Arc<dyn TunnelStore>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        Self {
            config,
            store,
            allocator: SubdomainAllocator::new(),
            rate_limiter,
            connections: DashMap::new(),
            routes: RouteRegistry::new(),
        }
    }

    pub fn with_allocator(mut self, allocator: SubdomainAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Claim a subdomain for `channel` and bring the tunnel up
    pub async fn register(
        &self,
        channel: ControlChannel,
        options: RegisterOptions,
    ) -> Result<Registration, RelayError> {
        let tunnel_id = channel.id().to_string();
        if self.connections.contains_key(&tunnel_id) {
            return Err(RelayError::Validation(
                "This channel already has a tunnel".to_string(),
            ));
        }

        let requested = options
            .subdomain
            .as_deref()
            .map(|s| self.allocator.validate(s))
            .transpose()?;

        let ip_allow_list = match options.ip_allow_list.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                IpFilter::parse(raw)?;
                Some(raw.to_string())
            }
            _ => None,
        };

        let password_hash = match options.password {
            Some(password) if !password.is_empty() => Some(self.hash(password).await?),
            _ => None,
        };

        let expires_at = options.expires_in.map(|ttl| {
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(36_500))
        });

        let local_host = options
            .local_host
            .unwrap_or_else(|| "localhost".to_string());
        let template = NewRegistration {
            subdomain: String::new(),
            tunnel_id: tunnel_id.clone(),
            local_port: options.local_port,
            local_host: local_host.clone(),
            password_hash,
            ip_allow_list,
            expires_at,
            inspect: options.inspect,
        };

        let registration = match requested {
            Some(subdomain) => self.claim_requested(subdomain, template).await?,
            None => self.claim_generated(template).await?,
        };
        let subdomain = registration.subdomain.clone();

        let connection = Arc::new(TunnelConnection::new(
            subdomain.clone(),
            channel,
            self.config.max_in_flight_per_tunnel,
        ));

        let target = RouteTarget::new(
            tunnel_id.clone(),
            format!("{}:{}", local_host, options.local_port),
        );
        if self
            .routes
            .register(RouteKey::Subdomain(subdomain.clone()), target)
            .is_err()
        {
            // Another local tunnel still routes this subdomain; give the claim back.
            self.spawn_deactivate(subdomain.clone(), tunnel_id);
            return Err(RelayError::Conflict(format!("Subdomain '{}'", subdomain)));
        }

        self.connections.insert(tunnel_id.clone(), Arc::clone(&connection));
        connection.set_state(ConnectionState::Active);

        let public_url = self.config.http_public_url(&subdomain);
        info!(
            "✅ HTTP tunnel registered: {} -> {}:{} (tunnel {})",
            public_url, local_host, options.local_port, tunnel_id
        );

        Ok(Registration {
            tunnel_id,
            subdomain,
            public_url,
        })
    }

    async fn hash(&self, password: String) -> Result<String, RelayError> {
        let params = self.config.password_hashing;
        tokio::task::spawn_blocking(move || hash_password_with(&password, &params))
            .await
            .map_err(|e| RelayError::Store(format!("password hashing task failed: {e}")))?
            .map_err(RelayError::from)
    }

    async fn claim_requested(
        &self,
        subdomain: String,
        template: NewRegistration,
    ) -> Result<TunnelRegistration, RelayError> {
        if self.routes.exists(&RouteKey::Subdomain(subdomain.clone())) {
            return Err(RelayError::Conflict(format!("Subdomain '{}'", subdomain)));
        }

        Ok(self
            .store
            .claim(NewRegistration {
                subdomain,
                ..template
            })
            .await?)
    }

    async fn claim_generated(
        &self,
        template: NewRegistration,
    ) -> Result<TunnelRegistration, RelayError> {
        let attempts = self.config.subdomain_claim_attempts.max(1);
        for attempt in 1..=attempts {
            let candidate = self.allocator.generate();
            if self.routes.exists(&RouteKey::Subdomain(candidate.clone())) {
                debug!("Generated subdomain '{}' is routed locally, retrying", candidate);
                continue;
            }

            match self
                .store
                .claim(NewRegistration {
                    subdomain: candidate.clone(),
                    ..template.clone()
                })
                .await
            {
                Ok(registration) => return Ok(registration),
                Err(StoreError::Conflict(_)) => {
                    debug!(
                        "Generated subdomain '{}' already claimed ({}/{}), retrying",
                        candidate, attempt, attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Could not find a free subdomain after {} attempts", attempts);
        Err(RelayError::Conflict(format!(
            "No free subdomain after {} attempts",
            attempts
        )))
    }

    fn active_connection(&self, subdomain: &str) -> Result<Arc<TunnelConnection>, RelayError> {
        let target = self
            .routes
            .lookup(&RouteKey::Subdomain(subdomain.to_string()))
            .map_err(|_| RelayError::NotFound(subdomain.to_string()))?;

        self.connections
            .get(&target.tunnel_id)
            .map(|c| Arc::clone(c.value()))
            .filter(|c| c.state() == ConnectionState::Active)
            .ok_or_else(|| RelayError::NotFound(subdomain.to_string()))
    }

    /// Send an HTTP request through the tunnel and wait for its response
    pub async fn forward_request(
        &self,
        subdomain: &str,
        request: HttpRequestDescriptor,
    ) -> Result<HttpResponsePayload, RelayError> {
        let connection = self.active_connection(subdomain)?;

        let registration = self
            .store
            .find_by_subdomain(subdomain)
            .await?
            .filter(|r| r.is_active && r.tunnel_id == connection.id)
            .ok_or_else(|| RelayError::NotFound(subdomain.to_string()))?;

        if registration.is_expired_at(Utc::now()) {
            debug!("Rejecting request for expired tunnel '{}'", subdomain);
            return Err(RelayError::Expired(subdomain.to_string()));
        }

        check_allow_list(&registration, request.client_ip)?;

        let body_len = request.body.as_ref().map_or(0, String::len);
        if body_len > self.config.max_body_bytes {
            return Err(RelayError::PayloadTooLarge {
                size: body_len,
                limit: self.config.max_body_bytes,
            });
        }

        let timeout = self.config.request_timeout;
        let (request_id, response_rx) = connection
            .pending
            .register(timeout)
            .ok_or_else(|| RelayError::Overloaded(subdomain.to_string()))?;

        let started = Instant::now();
        let (method, path) = (request.method.clone(), request.path.clone());
        let message = TunnelMessage::Request {
            request_id: request_id.clone(),
            payload: HttpRequestPayload {
                method: request.method,
                path: request.path,
                headers: request.headers,
                body: request.body,
            },
        };

        if let Err(e) = connection.channel.send(message).await {
            connection.pending.cancel(&request_id);
            error!(
                "Failed to send request to tunnel '{}': {}",
                subdomain, e
            );
            self.unregister(&connection.id);
            return Err(e);
        }

        let outcome = response_rx.await.unwrap_or(Err(RelayError::TunnelClosed));

        match &outcome {
            Ok(response) => {
                self.spawn_record_activity(subdomain.to_string(), 1);
                if registration.inspect {
                    info!(
                        subdomain,
                        request_id = %request_id,
                        method = %method,
                        path = %path,
                        status = response.status_code,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Inspected request"
                    );
                }
            }
            Err(e) => debug!("Request {} for '{}' failed: {}", request_id, subdomain, e),
        }

        outcome
    }

    /// Dispatch one inbound event from the tunnel's control channel
    pub async fn handle_channel_event(&self, connection_id: &str, event: ChannelEvent) {
        let Some(connection) = self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
        else {
            debug!("Ignoring event for unknown tunnel {}", connection_id);
            return;
        };

        match event {
            ChannelEvent::Message(TunnelMessage::Response {
                request_id,
                payload,
            }) => {
                if !connection.pending.resolve(&request_id, payload) {
                    debug!(
                        "Ignoring RESPONSE for unknown or settled request {} on '{}'",
                        request_id, connection.subdomain
                    );
                }
            }
            ChannelEvent::Message(TunnelMessage::Error {
                request_id: Some(request_id),
                payload,
            }) => {
                connection
                    .pending
                    .reject(&request_id, RelayError::Upstream(payload.message));
            }
            ChannelEvent::Message(TunnelMessage::Ping { timestamp }) => {
                self.spawn_record_activity(connection.subdomain.clone(), 0);
                if let Err(e) = connection
                    .channel
                    .send(TunnelMessage::Pong { timestamp })
                    .await
                {
                    warn!("Failed to answer PING on '{}': {}", connection.subdomain, e);
                    self.unregister(connection_id);
                }
            }
            ChannelEvent::Message(TunnelMessage::Pong { .. }) => {}
            ChannelEvent::Message(other) => {
                warn!(
                    "Dropping unexpected {} message on HTTP tunnel '{}'",
                    other.kind(),
                    connection.subdomain
                );
            }
            ChannelEvent::Malformed(reason) => {
                warn!(
                    "Dropping malformed message on '{}': {}",
                    connection.subdomain, reason
                );
            }
            ChannelEvent::Closed => {
                debug!("Control channel for '{}' closed", connection.subdomain);
                self.unregister(connection_id);
            }
            ChannelEvent::Error(reason) => {
                error!(
                    "Control channel for '{}' failed: {}",
                    connection.subdomain, reason
                );
                self.unregister(connection_id);
            }
        }
    }

    /// Tear a tunnel down
    ///
    /// Every pending request is rejected with [`RelayError::TunnelClosed`]
    /// and the route removed before this returns. Returns false if the
    /// tunnel was already gone.
    pub fn unregister(&self, connection_id: &str) -> bool {
        match self.detach(connection_id) {
            Some(connection) => {
                self.spawn_deactivate(connection.subdomain.clone(), connection.id.clone());
                true
            }
            None => false,
        }
    }

    /// Tear a tunnel down and wait until the store has released its subdomain
    ///
    /// Used by the transport once the channel is gone, so a client that
    /// reconnects right away can claim the same subdomain again.
    pub async fn release(&self, connection_id: &str, subdomain: &str) {
        self.detach(connection_id);
        match self.store.deactivate(subdomain, connection_id).await {
            Ok(true) => debug!("Registration '{}' marked inactive", subdomain),
            Ok(false) => debug!("Registration '{}' already released", subdomain),
            Err(e) => warn!("Failed to deactivate '{}': {}", subdomain, e),
        }
    }

    fn detach(&self, connection_id: &str) -> Option<Arc<TunnelConnection>> {
        let (_, connection) = self.connections.remove(connection_id)?;

        connection.set_state(ConnectionState::Closed);
        let rejected = connection.pending.reject_all(RelayError::TunnelClosed);
        self.routes
            .unregister_owned(&RouteKey::Subdomain(connection.subdomain.clone()), &connection.id);
        connection.channel.close();

        info!(
            "🔌 HTTP tunnel '{}' closed (tunnel {}, {} pending rejected)",
            connection.subdomain, connection.id, rejected
        );
        Some(connection)
    }

    /// Tear down every tunnel
    pub fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.unregister(id)).count()
    }

    /// Check a visitor's password for a protected tunnel
    pub async fn verify_tunnel_password(
        &self,
        subdomain: &str,
        password: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<(), RelayError> {
        let key = password_attempt_key(subdomain, client_ip);
        // reserved before verifying so concurrent guesses share one budget
        let attempt = self
            .rate_limiter
            .try_begin_attempt(&key)
            .map_err(|status| RelayError::RateLimited {
                retry_after: status.wait_time,
            })?;

        let registration = self
            .store
            .find_by_subdomain(subdomain)
            .await?
            .ok_or_else(|| RelayError::NotFound(subdomain.to_string()))?;

        let Some(hash) = registration.password_hash else {
            return Ok(());
        };

        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| RelayError::Store(format!("password verification task failed: {e}")))?;

        match verified {
            Ok(true) => {
                attempt.succeed();
                Ok(())
            }
            Ok(false) => {
                let status = attempt.fail();
                warn!(
                    "🔑 Wrong password for '{}' from {:?} ({} failures{})",
                    subdomain,
                    client_ip,
                    self.rate_limiter.failure_count(&key),
                    if status.allowed { "" } else { ", locked" }
                );
                Err(RelayError::Forbidden("Invalid tunnel password".to_string()))
            }
            Err(e) => {
                error!("Stored password hash for '{}' is unusable: {}", subdomain, e);
                Err(e.into())
            }
        }
    }

    /// Apply the tunnel's allow-list to a visitor
    ///
    /// Returns whether the tunnel also requires a password. Unknown
    /// subdomains are admitted here and rejected by [`forward_request`](Self::forward_request).
    pub async fn admit_visitor(
        &self,
        subdomain: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<bool, RelayError> {
        match self.store.find_by_subdomain(subdomain).await? {
            Some(registration) => {
                check_allow_list(&registration, client_ip)?;
                Ok(registration.is_password_protected())
            }
            None => Ok(false),
        }
    }

    pub async fn is_password_protected(&self, subdomain: &str) -> Result<bool, RelayError> {
        Ok(self
            .store
            .find_by_subdomain(subdomain)
            .await?
            .is_some_and(|r| r.is_password_protected()))
    }

    pub fn active_tunnels(&self) -> Vec<TunnelSummary> {
        let mut tunnels: Vec<TunnelSummary> = self
            .connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Active)
            .map(|c| TunnelSummary {
                tunnel_id: c.id.clone(),
                subdomain: c.subdomain.clone(),
                public_url: self.config.http_public_url(&c.subdomain),
                state: c.state(),
                pending_requests: c.pending_count(),
                connected_at: c.connected_at,
            })
            .collect();
        tunnels.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        tunnels
    }

    pub fn tunnel_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Active)
            .count()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<TunnelConnection>> {
        self.connections
            .get(connection_id)
            .map(|c| Arc::clone(c.value()))
    }

    fn spawn_record_activity(&self, subdomain: String, requests: u64) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.record_activity(&subdomain, requests).await {
                warn!("Failed to record activity for '{}': {}", subdomain, e);
            }
        });
    }

    fn spawn_deactivate(&self, subdomain: String, tunnel_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to deactivate '{}'; it will be reclaimable once stale",
                subdomain
            );
            return;
        };
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            match store.deactivate(&subdomain, &tunnel_id).await {
                Ok(true) => debug!("Registration '{}' marked inactive", subdomain),
                Ok(false) => debug!("Registration '{}' already released", subdomain),
                Err(e) => warn!("Failed to deactivate '{}': {}", subdomain, e),
            }
        });
    }
}

//! TCP tunnel relay
//!
//! Each TCP tunnel owns a public listening port. Accepted sockets are
//! multiplexed over the tunnel's control channel by connection id: bytes read
//! from a socket go out as `TCP_DATA`, and `TCP_DATA` coming back is written
//! to the matching socket.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portway_auth::IpFilter;
use portway_proto::{TcpConnectPayload, TcpDataPayload, TunnelMessage};
use portway_router::{RouteKey, RouteRegistry, RouteTarget, SubdomainAllocator};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelEvent, ControlChannel};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::port_allocator::PortAllocator;

/// Largest chunk read from a public socket per `TCP_DATA` message
pub const TCP_CHUNK_SIZE: usize = 16 * 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct TcpTunnelOptions {
    /// Requested subdomain; one is generated when absent
    pub subdomain: Option<String>,
    pub local_port: u16,
    pub ip_allow_list: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRegistration {
    pub tunnel_id: String,
    pub subdomain: String,
    pub port: u16,
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpTunnelSummary {
    pub tunnel_id: String,
    pub subdomain: String,
    pub port: u16,
    pub public_url: String,
    pub open_connections: usize,
    pub connected_at: DateTime<Utc>,
}

/// One accepted public socket
struct SocketHandle {
    /// Bytes queued for the socket's writer
    outbound: mpsc::Sender<Vec<u8>>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl SocketHandle {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Live TCP tunnel bound to one control channel and one public port
pub struct TcpTunnelConnection {
    id: String,
    subdomain: String,
    port: u16,
    local_port: u16,
    channel: ControlChannel,
    filter: IpFilter,
    socket_buffer: usize,
    sockets: DashMap<String, SocketHandle>,
    accept_task: Mutex<Option<AbortHandle>>,
    connected_at: DateTime<Utc>,
}

impl TcpTunnelConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!(
            "TCP tunnel '{}' listening on port {} (tunnel {})",
            self.subdomain, self.port, self.id
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if !self.filter.is_socket_allowed(&peer_addr) {
                        warn!(
                            "🚫 Rejected TCP connection from {} to port {} (not in allow-list)",
                            peer_addr, self.port
                        );
                        continue;
                    }
                    Arc::clone(&self).open_socket(stream, peer_addr);
                }
                Err(e) => {
                    warn!("Failed to accept on port {}: {}", self.port, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn open_socket(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let connection_id = Uuid::new_v4().to_string();
        debug!(
            "New TCP connection {} from {} on port {}",
            connection_id, peer_addr, self.port
        );

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(self.socket_buffer.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader = tokio::spawn(Arc::clone(&self).pump_to_channel(
            connection_id.clone(),
            read_half,
            peer_addr,
            ready_rx,
        ))
        .abort_handle();
        let writer = tokio::spawn(Arc::clone(&self).pump_to_socket(
            connection_id.clone(),
            write_half,
            outbound_rx,
        ))
        .abort_handle();

        self.sockets.insert(
            connection_id,
            SocketHandle {
                outbound,
                reader,
                writer,
            },
        );
        let _ = ready_tx.send(());
    }

    /// Socket → channel
    async fn pump_to_channel(
        self: Arc<Self>,
        connection_id: String,
        mut read_half: OwnedReadHalf,
        peer_addr: SocketAddr,
        ready: oneshot::Receiver<()>,
    ) {
        if ready.await.is_err() {
            return;
        }

        let connect = TunnelMessage::TcpConnect {
            connection_id: connection_id.clone(),
            payload: TcpConnectPayload {
                remote_address: peer_addr.ip().to_string(),
                remote_port: peer_addr.port(),
                local_port: self.local_port,
            },
        };
        if let Err(e) = self.channel.send(connect).await {
            debug!("Dropping TCP connection {}: {}", connection_id, e);
            self.abort_socket(&connection_id);
            return;
        }

        let mut buffer = vec![0u8; TCP_CHUNK_SIZE];
        loop {
            match read_half.read(&mut buffer).await {
                Ok(0) => {
                    debug!("Client closed TCP connection {}", connection_id);
                    break;
                }
                Ok(n) => {
                    let data = TunnelMessage::TcpData {
                        connection_id: connection_id.clone(),
                        payload: TcpDataPayload::from_bytes(&buffer[..n]),
                    };
                    if let Err(e) = self.channel.send(data).await {
                        debug!("Dropping TCP connection {}: {}", connection_id, e);
                        self.abort_socket(&connection_id);
                        return;
                    }
                }
                Err(e) => {
                    debug!("Read error on TCP connection {}: {}", connection_id, e);
                    break;
                }
            }
        }

        // The writer still drains what was already queued.
        if self.sockets.remove(&connection_id).is_some() {
            let _ = self
                .channel
                .send(TunnelMessage::TcpClose { connection_id })
                .await;
        }
    }

    /// Channel → socket
    async fn pump_to_socket(
        self: Arc<Self>,
        connection_id: String,
        mut write_half: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(chunk) = outbound.recv().await {
            if let Err(e) = write_half.write_all(&chunk).await {
                debug!("Write error on TCP connection {}: {}", connection_id, e);
                if let Some((_, handle)) = self.sockets.remove(&connection_id) {
                    handle.reader.abort();
                    let _ = self
                        .channel
                        .send(TunnelMessage::TcpClose { connection_id })
                        .await;
                }
                return;
            }
        }
        let _ = write_half.shutdown().await;
    }

    /// Queue bytes for a socket without waiting on it
    ///
    /// A socket whose queue is full is not reading; it is dropped and the
    /// client is told with `TCP_CLOSE` so other connections keep flowing.
    async fn write(&self, connection_id: &str, bytes: Vec<u8>) {
        let queued = match self.sockets.get(connection_id) {
            Some(handle) => handle.outbound.try_send(bytes),
            None => return,
        };

        match queued {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "TCP connection {} on port {} is not reading, closing it",
                    connection_id, self.port
                );
                self.abort_socket(connection_id);
                let _ = self
                    .channel
                    .send(TunnelMessage::TcpClose {
                        connection_id: connection_id.to_string(),
                    })
                    .await;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("TCP connection {} is no longer writable", connection_id);
            }
        }
    }

    /// Close one socket once its queued bytes are written
    fn close_socket(&self, connection_id: &str) -> bool {
        match self.sockets.remove(connection_id) {
            Some((_, handle)) => {
                handle.reader.abort();
                debug!("Closed TCP connection {}", connection_id);
                true
            }
            None => false,
        }
    }

    fn abort_socket(&self, connection_id: &str) {
        if let Some((_, handle)) = self.sockets.remove(connection_id) {
            handle.abort();
        }
    }

    fn shutdown(&self) -> usize {
        if let Some(accept) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            accept.abort();
        }

        let ids: Vec<String> = self.sockets.iter().map(|s| s.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.sockets.remove(id))
            .map(|(_, handle)| handle.abort())
            .count()
    }
}

pub struct TcpTunnelRelay {
    config: RelayConfig,
    allocator: SubdomainAllocator,
    ports: PortAllocator,
    /// Tunnel id -> connection
    tunnels: DashMap<String, Arc<TcpTunnelConnection>>,
    routes: RouteRegistry,
}

impl TcpTunnelRelay {
    pub fn new(config: RelayConfig) -> Self {
        let ports = PortAllocator::new(
            config.tcp_bind_addr,
            config.tcp_port_range.clone(),
            config.port_allocation_attempts,
        );
        Self {
            config,
            allocator: SubdomainAllocator::new(),
            ports,
            tunnels: DashMap::new(),
            routes: RouteRegistry::new(),
        }
    }

    pub fn with_allocator(mut self, allocator: SubdomainAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    /// Allocate a public port for `channel` and start accepting on it
    pub async fn create_tcp_tunnel(
        &self,
        channel: ControlChannel,
        options: TcpTunnelOptions,
    ) -> Result<TcpRegistration, RelayError> {
        let tunnel_id = channel.id().to_string();
        if self.tunnels.contains_key(&tunnel_id) {
            return Err(RelayError::Validation(
                "This channel already has a tunnel".to_string(),
            ));
        }

        let filter = match options.ip_allow_list.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => IpFilter::parse(raw)?,
            _ => IpFilter::new(),
        };

        let subdomain = self.claim_subdomain(&tunnel_id, options.subdomain.as_deref())?;
        let subdomain_key = RouteKey::Subdomain(subdomain.clone());

        let (port, listener) = match self.ports.allocate().await {
            Ok(allocated) => allocated,
            Err(e) => {
                self.routes.unregister_owned(&subdomain_key, &tunnel_id);
                return Err(e);
            }
        };

        let target = RouteTarget::new(tunnel_id.clone(), format!("localhost:{}", options.local_port));
        if self.routes.register(RouteKey::TcpPort(port), target).is_err() {
            error!("Port {} is routed but was not allocated", port);
            self.routes.unregister_owned(&subdomain_key, &tunnel_id);
            self.ports.release(port);
            return Err(RelayError::Conflict(format!("Port {}", port)));
        }

        let connection = Arc::new(TcpTunnelConnection {
            id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            port,
            local_port: options.local_port,
            channel,
            filter,
            socket_buffer: self.config.channel_buffer,
            sockets: DashMap::new(),
            accept_task: Mutex::new(None),
            connected_at: Utc::now(),
        });

        let accept = tokio::spawn(Arc::clone(&connection).accept_loop(listener)).abort_handle();
        *connection
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(accept);
        self.tunnels.insert(tunnel_id.clone(), connection);

        let public_url = self.config.tcp_public_url(port);
        info!(
            "✅ TCP tunnel registered: {} -> localhost:{} ('{}', tunnel {})",
            public_url, options.local_port, subdomain, tunnel_id
        );

        Ok(TcpRegistration {
            tunnel_id,
            subdomain,
            port,
            public_url,
        })
    }

    fn claim_subdomain(
        &self,
        tunnel_id: &str,
        requested: Option<&str>,
    ) -> Result<String, RelayError> {
        let target = || RouteTarget::new(tunnel_id, String::new());

        if let Some(requested) = requested {
            let subdomain = self.allocator.validate(requested)?;
            return self
                .routes
                .register(RouteKey::Subdomain(subdomain.clone()), target())
                .map(|_| subdomain.clone())
                .map_err(|_| RelayError::Conflict(format!("Subdomain '{}'", subdomain)));
        }

        let attempts = self.config.subdomain_claim_attempts.max(1);
        for _ in 0..attempts {
            let candidate = self.allocator.generate();
            if self
                .routes
                .register(RouteKey::Subdomain(candidate.clone()), target())
                .is_ok()
            {
                return Ok(candidate);
            }
            debug!("Generated subdomain '{}' taken, retrying", candidate);
        }
        Err(RelayError::Conflict(format!(
            "No free subdomain after {} attempts",
            attempts
        )))
    }

    /// Dispatch one inbound event from the tunnel's control channel
    pub async fn handle_channel_event(&self, connection_id: &str, event: ChannelEvent) {
        let Some(tunnel) = self.tunnels.get(connection_id).map(|t| Arc::clone(t.value())) else {
            debug!("Ignoring event for unknown TCP tunnel {}", connection_id);
            return;
        };

        match event {
            ChannelEvent::Message(TunnelMessage::TcpData {
                connection_id,
                payload,
            }) => match payload.to_bytes() {
                Ok(bytes) => tunnel.write(&connection_id, bytes).await,
                Err(e) => warn!(
                    "Dropping TCP_DATA with invalid base64 for connection {}: {}",
                    connection_id, e
                ),
            },
            ChannelEvent::Message(TunnelMessage::TcpClose { connection_id }) => {
                tunnel.close_socket(&connection_id);
            }
            ChannelEvent::Message(TunnelMessage::TcpError {
                connection_id,
                payload,
            }) => {
                if tunnel.close_socket(&connection_id) {
                    debug!(
                        "Tunnel client reported error on TCP connection {}: {}",
                        connection_id, payload.message
                    );
                }
            }
            ChannelEvent::Message(TunnelMessage::Ping { timestamp }) => {
                if let Err(e) = tunnel.channel.send(TunnelMessage::Pong { timestamp }).await {
                    warn!("Failed to answer PING on TCP tunnel '{}': {}", tunnel.subdomain, e);
                    self.close_tunnel(&tunnel.id);
                }
            }
            ChannelEvent::Message(TunnelMessage::Pong { .. }) => {}
            ChannelEvent::Message(other) => {
                warn!(
                    "Dropping unexpected {} message on TCP tunnel '{}'",
                    other.kind(),
                    tunnel.subdomain
                );
            }
            ChannelEvent::Malformed(reason) => {
                warn!(
                    "Dropping malformed message on TCP tunnel '{}': {}",
                    tunnel.subdomain, reason
                );
            }
            ChannelEvent::Closed => {
                debug!("Control channel for TCP tunnel '{}' closed", tunnel.subdomain);
                self.close_tunnel(&tunnel.id);
            }
            ChannelEvent::Error(reason) => {
                error!(
                    "Control channel for TCP tunnel '{}' failed: {}",
                    tunnel.subdomain, reason
                );
                self.close_tunnel(&tunnel.id);
            }
        }
    }

    /// Tear a TCP tunnel down
    ///
    /// Aborts the accept loop and every socket task, then releases the port
    /// and routes. Returns false if the tunnel was already gone.
    pub fn close_tunnel(&self, connection_id: &str) -> bool {
        let Some((_, tunnel)) = self.tunnels.remove(connection_id) else {
            return false;
        };

        let sockets = tunnel.shutdown();
        self.routes
            .unregister_owned(&RouteKey::TcpPort(tunnel.port), &tunnel.id);
        self.routes
            .unregister_owned(&RouteKey::Subdomain(tunnel.subdomain.clone()), &tunnel.id);
        self.ports.release(tunnel.port);
        tunnel.channel.close();

        info!(
            "🔌 TCP tunnel '{}' closed, port {} released ({} connections dropped)",
            tunnel.subdomain, tunnel.port, sockets
        );
        true
    }

    pub fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.tunnels.iter().map(|t| t.key().clone()).collect();
        ids.iter().filter(|id| self.close_tunnel(id)).count()
    }

    pub fn active_tunnels(&self) -> Vec<TcpTunnelSummary> {
        let mut tunnels: Vec<TcpTunnelSummary> = self
            .tunnels
            .iter()
            .map(|t| TcpTunnelSummary {
                tunnel_id: t.id.clone(),
                subdomain: t.subdomain.clone(),
                port: t.port,
                public_url: self.config.tcp_public_url(t.port),
                open_connections: t.socket_count(),
                connected_at: t.connected_at,
            })
            .collect();
        tunnels.sort_by_key(|t| t.port);
        tunnels
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn tunnel(&self, connection_id: &str) -> Option<Arc<TcpTunnelConnection>> {
        self.tunnels.get(connection_id).map(|t| Arc::clone(t.value()))
    }

    pub fn tunnel_for_port(&self, port: u16) -> Option<Arc<TcpTunnelConnection>> {
        let target = self.routes.lookup(&RouteKey::TcpPort(port)).ok()?;
        self.tunnel(&target.tunnel_id)
    }
}

//! Control channel handler
//!
//! Drives one client connection: reads the `REGISTER` handshake, opens an
//! HTTP or TCP tunnel, then pumps frames between the socket and the relay.

use futures::{SinkExt, StreamExt};
use portway_proto::{
    Frame, RegisterPayload, RegisteredPayload, TunnelCodec, TunnelKind, TunnelMessage,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ControlChannel};
use crate::error::RelayError;
use crate::http_relay::{HttpTunnelRelay, RegisterOptions};
use crate::tcp_relay::{TcpTunnelOptions, TcpTunnelRelay};

/// Handles control connections from tunnel clients
#[derive(Clone)]
pub struct TunnelHandler {
    http: Arc<HttpTunnelRelay>,
    tcp: Arc<TcpTunnelRelay>,
}

impl TunnelHandler {
    pub fn new(http: Arc<HttpTunnelRelay>, tcp: Arc<TcpTunnelRelay>) -> Self {
        Self { http, tcp }
    }

    pub fn http(&self) -> &Arc<HttpTunnelRelay> {
        &self.http
    }

    pub fn tcp(&self) -> &Arc<TcpTunnelRelay> {
        &self.tcp
    }

    /// Serve a control connection until either side closes it
    pub async fn handle_connection<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.http.config();
        let idle_timeout = config.channel_idle_timeout;
        info!("New tunnel connection from {}", peer_addr);

        let framed = Framed::new(stream, TunnelCodec::new(config.max_frame_bytes));
        let (mut sink, mut frames) = framed.split();

        let rejection = match timeout(idle_timeout, frames.next()).await {
            Ok(Some(Ok(Frame::Message(TunnelMessage::Register { payload })))) => {
                return self
                    .serve_tunnel(payload, sink, frames, peer_addr)
                    .await;
            }
            Ok(Some(Ok(Frame::Message(other)))) => {
                error!("Unexpected first message from {}: {}", peer_addr, other.kind());
                RelayError::Validation(format!(
                    "Expected REGISTER as first message, got {}",
                    other.kind()
                ))
            }
            Ok(Some(Ok(Frame::Malformed(reason)))) => {
                error!("Malformed first message from {}: {}", peer_addr, reason);
                RelayError::Validation(format!("Malformed REGISTER message: {}", reason))
            }
            Ok(Some(Err(e))) => {
                error!("Failed to read first message from {}: {}", peer_addr, e);
                return;
            }
            Ok(None) => {
                debug!("Connection from {} closed before first message", peer_addr);
                return;
            }
            Err(_) => {
                warn!("No REGISTER from {} within {:?}", peer_addr, idle_timeout);
                RelayError::Timeout(idle_timeout)
            }
        };

        let _ = sink
            .send(TunnelMessage::Error {
                request_id: None,
                payload: rejection.to_payload(),
            })
            .await;
        let _ = sink.close().await;
    }

    async fn serve_tunnel<S>(
        &self,
        register: RegisterPayload,
        mut sink: futures::stream::SplitSink<Framed<S, TunnelCodec>, TunnelMessage>,
        mut frames: futures::stream::SplitStream<Framed<S, TunnelCodec>>,
        peer_addr: SocketAddr,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.http.config();
        let idle_timeout = config.channel_idle_timeout;
        let kind = register.tunnel_type;
        let (channel, mut outbound) = ControlChannel::new(Some(peer_addr), config.channel_buffer);
        let connection_id = channel.id().to_string();

        let registered = match self.open_tunnel(channel.clone(), register).await {
            Ok(registered) => registered,
            Err(e) => {
                warn!("Registration from {} rejected: {}", peer_addr, e);
                let _ = sink
                    .send(TunnelMessage::Error {
                        request_id: None,
                        payload: e.to_payload(),
                    })
                    .await;
                let _ = sink.close().await;
                return;
            }
        };

        let subdomain = registered.subdomain.clone();

        // REGISTERED goes out before the writer starts draining the queue.
        if let Err(e) = sink
            .send(TunnelMessage::Registered {
                payload: registered,
            })
            .await
        {
            error!("Failed to send REGISTERED to {}: {}", peer_addr, e);
            self.teardown(kind, &connection_id, &subdomain).await;
            return;
        }

        let writer_channel = channel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = outbound.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                error!("Failed to write to control channel {}: {}", writer_channel.id(), e);
                                writer_channel.close();
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = writer_channel.closed() => {
                        while let Ok(msg) = outbound.try_recv() {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        loop {
            let event = tokio::select! {
                _ = channel.closed() => break,
                next = timeout(idle_timeout, frames.next()) => match next {
                    Ok(Some(Ok(Frame::Message(msg)))) => ChannelEvent::Message(msg),
                    Ok(Some(Ok(Frame::Malformed(reason)))) => ChannelEvent::Malformed(reason),
                    Ok(Some(Err(e))) => ChannelEvent::Error(e.to_string()),
                    Ok(None) => ChannelEvent::Closed,
                    Err(_) => ChannelEvent::Error(format!("no traffic for {:?}", idle_timeout)),
                },
            };

            let terminal = event.is_terminal();
            match kind {
                TunnelKind::Http => self.http.handle_channel_event(&connection_id, event).await,
                TunnelKind::Tcp => self.tcp.handle_channel_event(&connection_id, event).await,
            }
            if terminal {
                break;
            }
        }

        self.teardown(kind, &connection_id, &subdomain).await;
        channel.close();
        let _ = writer.await;
        info!("Tunnel connection from {} closed", peer_addr);
    }

    async fn open_tunnel(
        &self,
        channel: ControlChannel,
        register: RegisterPayload,
    ) -> Result<RegisteredPayload, RelayError> {
        match register.tunnel_type {
            TunnelKind::Http => {
                let registration = self
                    .http
                    .register(channel, RegisterOptions::from(register))
                    .await?;
                Ok(RegisteredPayload {
                    tunnel_id: registration.tunnel_id,
                    subdomain: registration.subdomain,
                    public_url: registration.public_url,
                    tcp_port: None,
                })
            }
            TunnelKind::Tcp => {
                let options = TcpTunnelOptions {
                    subdomain: register.subdomain,
                    local_port: register.local_port,
                    ip_allow_list: register.ip_allow_list,
                };
                let registration = self.tcp.create_tcp_tunnel(channel, options).await?;
                Ok(RegisteredPayload {
                    tunnel_id: registration.tunnel_id,
                    subdomain: registration.subdomain,
                    public_url: registration.public_url,
                    tcp_port: Some(registration.port),
                })
            }
        }
    }

    async fn teardown(&self, kind: TunnelKind, connection_id: &str, subdomain: &str) {
        match kind {
            TunnelKind::Http => self.http.release(connection_id, subdomain).await,
            TunnelKind::Tcp => {
                self.tcp.close_tunnel(connection_id);
            }
        }
    }
}

//! Control listener

use portway_control::TunnelHandler;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Accept tunnel clients and hand each connection to the handler
pub async fn run_control_listener(listener: TcpListener, handler: TunnelHandler) {
    match listener.local_addr() {
        Ok(addr) => info!("Tunnel control listening on {}", addr),
        Err(e) => error!("Control listener has no local address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("Accepted control connection from {}", peer_addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.handle_connection(stream, peer_addr).await;
                });
            }
            Err(e) => {
                error!("Failed to accept control connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use portway_control::{HttpTunnelRelay, RelayConfig, TcpTunnelRelay};
    use portway_proto::{Frame, RegisterPayload, TunnelCodec, TunnelMessage};
    use portway_relay_db::MemoryTunnelStore;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_register_over_tcp() {
        let config = RelayConfig {
            domain: "tunnel.test".to_string(),
            ..RelayConfig::default()
        };
        let handler = TunnelHandler::new(
            Arc::new(HttpTunnelRelay::new(
                config.clone(),
                Arc::new(MemoryTunnelStore::new()),
            )),
            Arc::new(TcpTunnelRelay::new(config)),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(run_control_listener(listener, handler.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, TunnelCodec::default());
        client
            .send(TunnelMessage::Register {
                payload: RegisterPayload {
                    subdomain: Some("wired".to_string()),
                    local_port: 8080,
                    ..RegisterPayload::default()
                },
            })
            .await
            .unwrap();

        match client.next().await {
            Some(Ok(Frame::Message(TunnelMessage::Registered { payload }))) => {
                assert_eq!(payload.public_url, "http://wired.tunnel.test");
            }
            other => panic!("expected REGISTERED, got {:?}", other),
        }
        assert_eq!(handler.http().tunnel_count(), 1);
        server.abort();
    }
}

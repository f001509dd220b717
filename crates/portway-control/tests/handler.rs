//! End-to-end control channel tests over an in-memory duplex stream

use futures::{SinkExt, StreamExt};
use portway_auth::HashParams;
use portway_control::{
    HttpRequestDescriptor, HttpTunnelRelay, RelayConfig, RelayError, TcpTunnelRelay,
    TunnelHandler,
};
use portway_proto::{
    Frame, Headers, HttpResponsePayload, RegisterPayload, TunnelCodec, TunnelKind, TunnelMessage,
};
use portway_relay_db::{MemoryTunnelStore, TunnelStore};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

type Client = Framed<DuplexStream, TunnelCodec>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn handler(port_range: std::ops::RangeInclusive<u16>) -> TunnelHandler {
    handler_with_store(port_range).0
}

fn handler_with_store(
    port_range: std::ops::RangeInclusive<u16>,
) -> (TunnelHandler, MemoryTunnelStore) {
    let store = MemoryTunnelStore::new();
    let config = RelayConfig {
        domain: "tunnel.test".to_string(),
        public_host: "relay.test".to_string(),
        tcp_bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        tcp_port_range: port_range,
        password_hashing: HashParams::minimal(),
        ..RelayConfig::default()
    };
    let http = HttpTunnelRelay::new(config.clone(), Arc::new(store.clone()));
    let tcp = TcpTunnelRelay::new(config);
    (TunnelHandler::new(Arc::new(http), Arc::new(tcp)), store)
}

fn connect(handler: &TunnelHandler) -> (Client, JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    let handler = handler.clone();
    let task = tokio::spawn(async move { handler.handle_connection(server, peer).await });
    (Framed::new(client, TunnelCodec::default()), task)
}

async fn recv(client: &mut Client) -> TunnelMessage {
    match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
        Ok(Some(Ok(Frame::Message(msg)))) => msg,
        other => panic!("expected a message, got {:?}", other),
    }
}

fn register_http(subdomain: &str) -> TunnelMessage {
    TunnelMessage::Register {
        payload: RegisterPayload {
            subdomain: Some(subdomain.to_string()),
            local_port: 3000,
            ..RegisterPayload::default()
        },
    }
}

#[tokio::test]
async fn test_http_tunnel_end_to_end() {
    init_tracing();
    let handler = handler(44000..=44049);
    let (mut client, _task) = connect(&handler);

    client.send(register_http("my-app")).await.unwrap();
    let registered = match recv(&mut client).await {
        TunnelMessage::Registered { payload } => payload,
        other => panic!("expected REGISTERED, got {:?}", other),
    };
    assert_eq!(registered.subdomain, "my-app");
    assert_eq!(registered.public_url, "http://my-app.tunnel.test");
    assert_eq!(registered.tcp_port, None);

    let http = Arc::clone(handler.http());
    let forward = tokio::spawn(async move {
        http.forward_request(
            "my-app",
            HttpRequestDescriptor {
                method: "GET".to_string(),
                path: "/".to_string(),
                ..HttpRequestDescriptor::default()
            },
        )
        .await
    });

    let request_id = match recv(&mut client).await {
        TunnelMessage::Request {
            request_id,
            payload,
        } => {
            assert_eq!(payload.method, "GET");
            assert_eq!(payload.path, "/");
            request_id
        }
        other => panic!("expected REQUEST, got {:?}", other),
    };

    let response = HttpResponsePayload {
        status_code: 200,
        headers: Headers::new(),
        body: Some("ok".to_string()),
    };
    client
        .send(TunnelMessage::Response {
            request_id,
            payload: response.clone(),
        })
        .await
        .unwrap();

    assert_eq!(forward.await.unwrap(), Ok(response));
}

#[tokio::test]
async fn test_ping_pong_over_channel() {
    let handler = handler(44050..=44099);
    let (mut client, _task) = connect(&handler);

    client.send(register_http("pinger")).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        TunnelMessage::Registered { .. }
    ));

    client
        .send(TunnelMessage::Ping { timestamp: Some(42) })
        .await
        .unwrap();
    assert_eq!(
        recv(&mut client).await,
        TunnelMessage::Pong { timestamp: Some(42) }
    );
}

#[tokio::test]
async fn test_first_message_must_be_register() {
    let handler = handler(44100..=44149);
    let (mut client, task) = connect(&handler);

    client
        .send(TunnelMessage::Ping { timestamp: None })
        .await
        .unwrap();
    match recv(&mut client).await {
        TunnelMessage::Error { payload, .. } => assert_eq!(payload.code, "VALIDATION_ERROR"),
        other => panic!("expected ERROR, got {:?}", other),
    }
    task.await.unwrap();
}

#[tokio::test]
async fn test_registration_conflict_sent_as_error() {
    let handler = handler(44150..=44199);
    let (mut first, _first_task) = connect(&handler);
    first.send(register_http("taken")).await.unwrap();
    assert!(matches!(
        recv(&mut first).await,
        TunnelMessage::Registered { .. }
    ));

    let (mut second, second_task) = connect(&handler);
    second.send(register_http("taken")).await.unwrap();
    match recv(&mut second).await {
        TunnelMessage::Error { request_id, payload } => {
            assert_eq!(request_id, None);
            assert_eq!(payload.code, "CONFLICT");
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    second_task.await.unwrap();
    assert_eq!(handler.http().tunnel_count(), 1);
}

#[tokio::test]
async fn test_disconnect_unregisters_and_rejects_pending() {
    init_tracing();
    let handler = handler(44200..=44249);
    let (mut client, task) = connect(&handler);
    client.send(register_http("flaky")).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        TunnelMessage::Registered { .. }
    ));

    let http = Arc::clone(handler.http());
    let forward = tokio::spawn(async move {
        http.forward_request("flaky", HttpRequestDescriptor::default())
            .await
    });
    assert!(matches!(
        recv(&mut client).await,
        TunnelMessage::Request { .. }
    ));

    drop(client);
    task.await.unwrap();

    assert_eq!(forward.await.unwrap(), Err(RelayError::TunnelClosed));
    assert_eq!(handler.http().tunnel_count(), 0);
}

#[tokio::test]
async fn test_reconnect_reclaims_subdomain() {
    let (handler, store) = handler_with_store(44400..=44449);
    let (mut client, task) = connect(&handler);
    client.send(register_http("comeback")).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        TunnelMessage::Registered { .. }
    ));

    drop(client);
    task.await.unwrap();

    // released in the store by the time the connection task finishes
    let row = store.find_by_subdomain("comeback").await.unwrap().unwrap();
    assert!(!row.is_active);

    let (mut again, _task) = connect(&handler);
    again.send(register_http("comeback")).await.unwrap();
    match recv(&mut again).await {
        TunnelMessage::Registered { payload } => assert_eq!(payload.subdomain, "comeback"),
        other => panic!("expected REGISTERED, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_tunnel_registration() {
    init_tracing();
    let handler = handler(44250..=44299);
    let (mut client, task) = connect(&handler);

    client
        .send(TunnelMessage::Register {
            payload: RegisterPayload {
                tunnel_type: TunnelKind::Tcp,
                subdomain: Some("postgres".to_string()),
                local_port: 5432,
                ..RegisterPayload::default()
            },
        })
        .await
        .unwrap();

    let registered = match recv(&mut client).await {
        TunnelMessage::Registered { payload } => payload,
        other => panic!("expected REGISTERED, got {:?}", other),
    };
    let port = registered.tcp_port.expect("tcp tunnels report their port");
    assert!((44250..=44299).contains(&port));
    assert_eq!(registered.public_url, format!("tcp://relay.test:{}", port));
    assert_eq!(handler.tcp().tunnel_count(), 1);

    drop(client);
    task.await.unwrap();
    assert_eq!(handler.tcp().tunnel_count(), 0);
    assert!(!handler.tcp().ports().is_allocated(port));
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_dropped() {
    let handler = handler(44300..=44349);
    let (mut client, task) = connect(&handler);

    // no client-side deadline: paused time jumps straight to the idle timeout
    match client.next().await {
        Some(Ok(Frame::Message(TunnelMessage::Error { payload, .. }))) => {
            assert_eq!(payload.code, "TIMEOUT")
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    task.await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_closes_channel() {
    let handler = handler(44350..=44399);
    let (mut client, task) = connect(&handler);
    client.send(register_http("bulky")).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        TunnelMessage::Registered { .. }
    ));

    // length prefix far above the frame limit
    let stream = client.get_mut();
    tokio::io::AsyncWriteExt::write_all(stream, &u32::MAX.to_be_bytes())
        .await
        .unwrap();

    task.await.unwrap();
    assert_eq!(handler.http().tunnel_count(), 0);
}

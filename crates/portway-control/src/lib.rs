//! Tunnel relay engine
//!
//! Maps public identifiers (subdomains and TCP ports) to live client control
//! channels, and forwards HTTP requests and raw TCP streams through them.

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod http_relay;
pub mod pending_requests;
pub mod port_allocator;
pub mod tcp_relay;

pub use channel::{ChannelEvent, ControlChannel};
pub use config::{parse_port_range, RelayConfig};
pub use error::RelayError;
pub use handler::TunnelHandler;
pub use http_relay::{
    password_attempt_key, ConnectionState, HttpRequestDescriptor, HttpTunnelRelay,
    RegisterOptions, Registration, TunnelConnection, TunnelSummary,
};
pub use pending_requests::{PendingRequests, RequestOutcome};
pub use port_allocator::PortAllocator;
pub use tcp_relay::{
    TcpRegistration, TcpTunnelConnection, TcpTunnelOptions, TcpTunnelRelay, TcpTunnelSummary,
};

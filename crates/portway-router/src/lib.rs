//! Public identifiers and routing for tunnels
//!
//! Generates and validates subdomains, and maps subdomains and TCP ports to
//! the tunnel currently serving them.

pub mod registry;
pub mod subdomain;

pub use registry::{RouteError, RouteRegistry, RouteTarget};
pub use subdomain::{SubdomainAllocator, SubdomainError};

/// Route key for identifying tunnels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// Routing by public TCP port
    TcpPort(u16),
    /// Routing by subdomain label (without the tunnel domain)
    Subdomain(String),
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteKey::TcpPort(port) => write!(f, "port {}", port),
            RouteKey::Subdomain(subdomain) => write!(f, "subdomain '{}'", subdomain),
        }
    }
}

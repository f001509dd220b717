//! Relay configuration

use portway_auth::{HashParams, RateLimitConfig};
use portway_proto::TunnelCodec;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Tunables shared by the HTTP and TCP relays
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tunnel domain; HTTP tunnels are published at `<subdomain>.<domain>`
    pub domain: String,
    /// Host name advertised in `tcp://` URLs
    pub public_host: String,
    /// Scheme for HTTP public URLs
    pub public_scheme: String,
    /// How long `forward_request` waits for a RESPONSE
    pub request_timeout: Duration,
    pub max_in_flight_per_tunnel: usize,
    pub max_body_bytes: usize,
    /// Largest control frame accepted or sent
    pub max_frame_bytes: usize,
    /// Outbound messages buffered per control channel
    pub channel_buffer: usize,
    /// A channel silent for this long is torn down
    pub channel_idle_timeout: Duration,
    /// Fresh candidates tried when a generated subdomain collides
    pub subdomain_claim_attempts: u32,
    pub tcp_bind_addr: IpAddr,
    pub tcp_port_range: RangeInclusive<u16>,
    pub port_allocation_attempts: u32,
    pub rate_limit: RateLimitConfig,
    pub password_hashing: HashParams,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            public_host: "localhost".to_string(),
            public_scheme: "http".to_string(),
            request_timeout: Duration::from_secs(30),
            max_in_flight_per_tunnel: 100,
            max_body_bytes: 10 * 1024 * 1024,
            max_frame_bytes: TunnelCodec::MAX_FRAME_BYTES,
            channel_buffer: 256,
            channel_idle_timeout: Duration::from_secs(90),
            subdomain_claim_attempts: 8,
            tcp_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port_range: 10000..=20000,
            port_allocation_attempts: 32,
            rate_limit: RateLimitConfig::default(),
            password_hashing: HashParams::default(),
        }
    }
}

impl RelayConfig {
    pub fn http_public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.public_scheme, subdomain, self.domain)
    }

    pub fn tcp_public_url(&self, port: u16) -> String {
        format!("tcp://{}:{}", self.public_host, port)
    }
}

/// Parse a port range like `"10000-20000"`
pub fn parse_port_range(range: &str) -> Result<RangeInclusive<u16>, String> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("Invalid port range '{}', expected START-END", range))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid start port in '{}'", range))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("Invalid end port in '{}'", range))?;

    if start == 0 || start > end {
        return Err(format!("Invalid port range '{}'", range));
    }
    Ok(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls() {
        let config = RelayConfig {
            domain: "tunnel.example.com".to_string(),
            public_host: "relay.example.com".to_string(),
            ..RelayConfig::default()
        };
        assert_eq!(
            config.http_public_url("my-app"),
            "http://my-app.tunnel.example.com"
        );
        assert_eq!(config.tcp_public_url(10042), "tcp://relay.example.com:10042");
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("10000-20000"), Ok(10000..=20000));
        assert_eq!(parse_port_range(" 5000 - 5000 "), Ok(5000..=5000));
        assert!(parse_port_range("20000-10000").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("10000").is_err());
        assert!(parse_port_range("a-b").is_err());
    }
}

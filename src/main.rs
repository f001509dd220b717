//! Portway relay
//!
//! Accepts tunnel clients on the control listener and publishes their local
//! services as `<subdomain>.<domain>` HTTP tunnels or public TCP ports.

mod api;
mod edge;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use portway_auth::{HashParams, RateLimitConfig, RateLimiter};
use portway_control::{
    parse_port_range, HttpTunnelRelay, RelayConfig, TcpTunnelRelay, TunnelHandler,
};
use portway_relay_db::DbTunnelStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tunnel relay - publishes local services through client control channels
#[derive(Parser, Debug)]
#[command(name = "portway")]
#[command(about = "Run a Portway tunnel relay", long_about = None)]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Tunnel control listener address
    #[arg(long, env = "PORTWAY_CONTROL_ADDR", default_value = "0.0.0.0:4443")]
    control_addr: SocketAddr,

    /// Public HTTP edge address
    #[arg(long, env = "PORTWAY_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Admin API address
    #[arg(long, env = "PORTWAY_API_ADDR", default_value = "127.0.0.1:3080")]
    api_addr: SocketAddr,

    /// Disable the admin API
    #[arg(long)]
    no_api: bool,

    /// Tunnel domain; HTTP tunnels are published at {subdomain}.{domain}
    #[arg(long, env = "PORTWAY_DOMAIN", default_value = "localhost")]
    domain: String,

    /// Host name advertised in tcp:// URLs (defaults to the domain)
    #[arg(long, env = "PORTWAY_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Scheme used in HTTP public URLs
    #[arg(long, default_value = "http")]
    public_scheme: String,

    /// Database URL (sqlite::memory:, sqlite://./portway.db?mode=rwc, postgres://...)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,

    /// Active registrations untouched for this many seconds can be reclaimed
    #[arg(long, default_value = "300")]
    stale_after_secs: u64,

    /// Port range for TCP tunnels (e.g. "10000-20000")
    #[arg(long, env = "PORTWAY_TCP_PORT_RANGE", default_value = "10000-20000")]
    tcp_port_range: String,

    /// Seconds to wait for a tunnel client to answer a request
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Maximum concurrent requests per HTTP tunnel
    #[arg(long, default_value = "100")]
    max_in_flight: usize,

    /// Maximum HTTP request body size in bytes
    #[arg(long, default_value = "10485760")]
    max_body_bytes: usize,

    /// Maximum control frame size in bytes
    #[arg(long, default_value = "16777216")]
    max_frame_bytes: usize,

    /// Close control channels silent for this many seconds
    #[arg(long, default_value = "90")]
    idle_timeout_secs: u64,

    /// Failed password attempts before a lockout
    #[arg(long, default_value = "5")]
    rate_limit_attempts: u32,

    /// First lockout in seconds; doubles with each further failure
    #[arg(long, default_value = "30")]
    lockout_secs: u64,

    /// Longest lockout in seconds
    #[arg(long, default_value = "3600")]
    max_lockout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn relay_config(&self) -> Result<RelayConfig> {
        let tcp_port_range = parse_port_range(&self.tcp_port_range)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid --tcp-port-range")?;

        Ok(RelayConfig {
            domain: self.domain.clone(),
            public_host: self
                .public_host
                .clone()
                .unwrap_or_else(|| self.domain.clone()),
            public_scheme: self.public_scheme.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_in_flight_per_tunnel: self.max_in_flight,
            max_body_bytes: self.max_body_bytes,
            max_frame_bytes: self.max_frame_bytes,
            channel_idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            tcp_port_range,
            rate_limit: RateLimitConfig {
                max_attempts: self.rate_limit_attempts,
                base_lockout: Duration::from_secs(self.lockout_secs),
                max_lockout: Duration::from_secs(self.max_lockout_secs),
                ..RateLimitConfig::default()
            },
            password_hashing: HashParams::default(),
            ..RelayConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.relay_config()?;

    info!("🚀 Starting Portway relay");
    info!("Tunnel control: {}", cli.control_addr);
    info!("HTTP endpoint: {}", cli.http_addr);
    info!("Subdomains will be: {{name}}.{}", config.domain);
    info!(
        "TCP port range: {}-{}",
        config.tcp_port_range.start(),
        config.tcp_port_range.end()
    );

    info!("Connecting to database: {}", cli.database_url);
    let db = portway_relay_db::connect(&cli.database_url)
        .await
        .context("Failed to connect to database")?;
    portway_relay_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;
    let store =
        DbTunnelStore::new(db).with_stale_after(Duration::from_secs(cli.stale_after_secs));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
    let sweeper = rate_limiter.spawn_sweeper();

    let http = Arc::new(
        HttpTunnelRelay::new(config.clone(), Arc::new(store))
            .with_rate_limiter(Arc::clone(&rate_limiter)),
    );
    let tcp = Arc::new(TcpTunnelRelay::new(config));
    let handler = TunnelHandler::new(Arc::clone(&http), Arc::clone(&tcp));

    let control_listener = TcpListener::bind(cli.control_addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", cli.control_addr))?;
    let control_handle = tokio::spawn(server::run_control_listener(control_listener, handler));

    let http_listener = TcpListener::bind(cli.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP edge on {}", cli.http_addr))?;
    let edge = edge::router(edge::EdgeState::new(Arc::clone(&http)));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            http_listener,
            edge.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("HTTP edge stopped: {}", e);
        }
    });

    let api_handle = if cli.no_api {
        None
    } else {
        let api_listener = TcpListener::bind(cli.api_addr)
            .await
            .with_context(|| format!("Failed to bind admin API on {}", cli.api_addr))?;
        let api = api::router(api::AdminState {
            http: Arc::clone(&http),
            tcp: Arc::clone(&tcp),
        });
        info!("Admin API: {}", cli.api_addr);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api).await {
                error!("Admin API stopped: {}", e);
            }
        }))
    };

    info!("✅ Portway relay is running");
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping servers..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    control_handle.abort();
    http_handle.abort();
    if let Some(handle) = api_handle {
        handle.abort();
    }
    sweeper.abort();

    let closed = http.shutdown() + tcp.shutdown();
    info!("✅ Portway relay stopped ({} tunnels closed)", closed);

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["portway"]).unwrap();
        assert_eq!(cli.control_addr, "0.0.0.0:4443".parse::<SocketAddr>().unwrap());
        assert_eq!(cli.http_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());

        let config = cli.relay_config().unwrap();
        assert_eq!(config.public_host, "localhost");
        assert_eq!(config.tcp_port_range, 10000..=20000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.max_attempts, 5);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "portway",
            "--domain",
            "tunnel.example.com",
            "--tcp-port-range",
            "30000-30010",
            "--request-timeout-secs",
            "5",
        ])
        .unwrap();
        let config = cli.relay_config().unwrap();
        assert_eq!(config.public_host, "tunnel.example.com");
        assert_eq!(
            config.http_public_url("app"),
            "http://app.tunnel.example.com"
        );
        assert_eq!(config.tcp_port_range, 30000..=30010);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_port_range() {
        let cli = Cli::try_parse_from(["portway", "--tcp-port-range", "9-1"]).unwrap();
        assert!(cli.relay_config().is_err());
    }
}

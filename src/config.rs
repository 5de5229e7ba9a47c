//! wsdns configuration

use crate::error::TunnelError;
use crate::supervisor::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// Main configuration, as loaded from a TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WsdnsConfig {
    /// Client role configuration
    #[serde(default)]
    pub client: Option<ClientConfig>,

    /// Server role configuration
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Tunnel session tuning, shared by both roles
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging options
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging options handed to every component at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log every tunneled query with its question name
    pub debug: bool,
}

/// Tunnel session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between keepalive pings
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Deadline for a single ping
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Deadline for a single message write (and for the final close)
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Deadline for the WebSocket opening handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Pending outbound messages before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            queue_capacity: 512,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("session.queue_capacity must be greater than 0".to_string());
        }

        if self.keepalive_interval.is_zero()
            || self.ping_timeout.is_zero()
            || self.write_timeout.is_zero()
            || self.handshake_timeout.is_zero()
        {
            return Err("session timeouts must be non-zero".to_string());
        }

        if self.ping_timeout >= self.keepalive_interval {
            return Err("session.ping_timeout must be shorter than keepalive_interval".to_string());
        }

        Ok(())
    }
}

/// One configured (local port, remote endpoint) entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    /// Tunnel endpoint URL (`ws://` or `wss://`)
    pub server: String,

    /// Local UDP port to listen on
    pub port: u16,
}

/// Fully resolved pairing: where to listen and where to tunnel to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    /// Local UDP listen address
    pub bind: SocketAddr,

    /// Tunnel endpoint URL
    pub server: String,
}

impl std::fmt::Display for PairingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.bind, self.server)
    }
}

/// Client role configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local address every pairing binds to
    #[serde(default = "default_bind_ip")]
    pub bind_addr: IpAddr,

    /// Configured pairings
    #[serde(default)]
    pub pairings: Vec<PairingEntry>,

    /// Restart policy for failed pairings
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl ClientConfig {
    /// Build a client configuration from comma-separated server URLs and ports.
    ///
    /// Both lists must have the same number of entries.
    /// `bind_addr` must be an IP literal; host names are resolved by the caller.
    pub fn from_lists(servers: &str, bind_addr: &str, ports: &str) -> Result<Self, TunnelError> {
        let bind_addr: IpAddr = bind_addr
            .trim()
            .parse()
            .map_err(|_| TunnelError::InvalidConfig(format!("wrong binding address: {}", bind_addr)))?;

        let servers: Vec<&str> = servers.split(',').map(str::trim).collect();
        let ports: Vec<&str> = ports.split(',').map(str::trim).collect();

        if servers.len() != ports.len() {
            return Err(TunnelError::InvalidConfig(format!(
                "number of servers ({}) and binding ports ({}) not matched",
                servers.len(),
                ports.len()
            )));
        }

        let pairings = servers
            .into_iter()
            .zip(ports)
            .map(|(server, port)| {
                let port = port
                    .parse()
                    .map_err(|_| TunnelError::InvalidConfig(format!("wrong port argument: {}", port)))?;
                Ok(PairingEntry {
                    server: server.to_string(),
                    port,
                })
            })
            .collect::<Result<Vec<_>, TunnelError>>()?;

        Ok(Self {
            bind_addr,
            pairings,
            retry: RetryPolicy::default(),
        })
    }

    /// Resolved pairings in configuration order
    pub fn pairing_configs(&self) -> Vec<PairingConfig> {
        self.pairings
            .iter()
            .map(|entry| PairingConfig {
                bind: SocketAddr::new(self.bind_addr, entry.port),
                server: entry.server.clone(),
            })
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.pairings.is_empty() {
            return Err("at least one server address is required".to_string());
        }

        for entry in &self.pairings {
            validate_server_url(&entry.server)?;
        }

        self.retry.validate()
    }
}

fn validate_server_url(url: &str) -> Result<(), String> {
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(format!("server url must start with ws:// or wss://: {:?}", url));
    }

    url.into_client_request()
        .map(|_| ())
        .map_err(|e| format!("invalid server url {:?}: {}", url, e))
}

/// Server role configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address accepting tunnel connections
    #[serde(default = "default_server_bind")]
    pub bind: SocketAddr,

    /// Upstream DNS resolver
    #[serde(default = "default_upstream")]
    pub upstream: SocketAddr,

    /// Upper bound on concurrent upstream resolutions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long to wait for one upstream reply
    #[serde(default = "default_resolve_timeout", with = "humantime_serde")]
    pub resolve_timeout: Duration,
}

fn default_server_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 5353))
}

fn default_upstream() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53))
}

fn default_max_concurrent() -> usize {
    256
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            upstream: default_upstream(),
            max_concurrent: default_max_concurrent(),
            resolve_timeout: default_resolve_timeout(),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("server.max_concurrent must be greater than 0".to_string());
        }

        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(format!(
                "server.max_concurrent must not exceed {}",
                Semaphore::MAX_PERMITS
            ));
        }

        if self.resolve_timeout.is_zero() {
            return Err("server.resolve_timeout must be non-zero".to_string());
        }

        if self.upstream.port() == 0 {
            return Err("upstream DNS server port must be non-zero".to_string());
        }

        Ok(())
    }
}

impl WsdnsConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TunnelError> {
        self.session.validate().map_err(TunnelError::InvalidConfig)?;

        if let Some(client) = &self.client {
            client.validate().map_err(TunnelError::InvalidConfig)?;
        }

        if let Some(server) = &self.server {
            server.validate().map_err(TunnelError::InvalidConfig)?;
        }

        Ok(())
    }
}

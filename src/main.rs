//! wsdns - DNS over a multiplexed WebSocket tunnel
//!
//! One binary, two roles: `client` listens for local DNS queries and tunnels
//! them, `server` terminates tunnels and resolves against an upstream server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::lookup_host;

use wsdns::supervisor::DEFAULT_RESTART_DELAY;
use wsdns::{ClientConfig, RetryPolicy, ServerConfig, Supervisor, TunnelServer, WsdnsConfig};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "wsdns")]
#[command(version = VERSION)]
#[command(about = "DNS over a multiplexed WebSocket tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for local DNS queries and forward them through tunnels
    Client {
        /// Tunnel server URLs, comma separated (ws:// or wss://)
        #[arg(short = 'c', long = "server", value_name = "URLS")]
        server: Option<String>,

        /// Local address or host name to bind [default: 127.0.0.1]
        #[arg(short, long)]
        bind: Option<String>,

        /// Local ports, comma separated, one per server [default: 0]
        #[arg(short, long)]
        port: Option<String>,

        /// Log every query
        #[arg(short, long)]
        debug: bool,

        /// Delay before a failed tunnel is restarted [default: 5s]
        #[arg(long, value_parser = humantime::parse_duration)]
        restart_delay: Option<Duration>,

        /// Switch to exponential backoff capped at this delay
        #[arg(long, value_parser = humantime::parse_duration)]
        backoff_max: Option<Duration>,
    },

    /// Accept tunnels and resolve their queries upstream
    Server {
        /// Address or host name to bind [default: 127.0.0.1]
        #[arg(short, long)]
        bind: Option<String>,

        /// Port to bind [default: 5353]
        #[arg(short, long)]
        port: Option<u16>,

        /// Upstream DNS server as HOST:PORT [default: 8.8.8.8:53]
        #[arg(short = 's', long)]
        upstream: Option<String>,

        /// Log every query
        #[arg(short, long)]
        debug: bool,

        /// Concurrent upstream resolutions [default: 256]
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Upstream reply deadline [default: 5s]
        #[arg(long, value_parser = humantime::parse_duration)]
        resolve_timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WsdnsConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => WsdnsConfig::default(),
    };
    apply_cli(&mut config, cli.command).await?;
    config.validate()?;

    // Initialize logger
    let level = if config.log.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    match (&config.client, &config.server) {
        (Some(client), _) => run_client(client, &config).await,
        (None, Some(server)) => run_server(server, &config).await,
        (None, None) => anyhow::bail!("no role configured"),
    }
}

async fn run_client(client: &ClientConfig, config: &WsdnsConfig) -> Result<()> {
    info!("Starting wsdns client {}", VERSION);
    for pairing in client.pairing_configs() {
        info!("Pairing {}", pairing);
    }

    Supervisor::new(client, config.session.clone(), config.log)
        .run()
        .await;
    Ok(())
}

async fn run_server(server: &ServerConfig, config: &WsdnsConfig) -> Result<()> {
    info!("Starting wsdns server {} on {}", VERSION, server.bind);

    let server = TunnelServer::bind(server, config.session.clone(), config.log)
        .await
        .context("failed to start tunnel server")?;
    server.run().await?;
    Ok(())
}

/// Resolve a bind address given as an IP literal or a host name.
///
/// Names are looked up once at startup, like every other startup setting.
async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }

    lookup_host((host, 0))
        .await
        .with_context(|| format!("wrong binding address: {}", host))?
        .map(|addr| addr.ip())
        .next()
        .with_context(|| format!("no address found for {}", host))
}

/// Resolve a `HOST:PORT` endpoint to its first address
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    lookup_host(endpoint)
        .await
        .with_context(|| format!("wrong upstream DNS server address: {}", endpoint))?
        .next()
        .with_context(|| format!("no address found for {}", endpoint))
}

/// Merge command-line flags over the file configuration and pick the role.
async fn apply_cli(config: &mut WsdnsConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Client {
            server,
            bind,
            port,
            debug,
            restart_delay,
            backoff_max,
        } => {
            let mut client = match (server, config.client.take()) {
                (Some(servers), file) => {
                    let bind = match (bind, &file) {
                        (Some(bind), _) => resolve_host(&bind).await?.to_string(),
                        (None, Some(file)) => file.bind_addr.to_string(),
                        (None, None) => "127.0.0.1".to_string(),
                    };
                    let mut client =
                        ClientConfig::from_lists(&servers, &bind, port.as_deref().unwrap_or("0"))?;
                    if let Some(file) = file {
                        client.retry = file.retry;
                    }
                    client
                }
                (None, Some(mut file)) => {
                    if port.is_some() {
                        anyhow::bail!("--port requires --server");
                    }
                    if let Some(bind) = bind {
                        file.bind_addr = resolve_host(&bind).await?;
                    }
                    file
                }
                (None, None) => {
                    anyhow::bail!("no tunnel server given, use --server or a [client] config section")
                }
            };

            if restart_delay.is_some() || backoff_max.is_some() {
                let initial = restart_delay.unwrap_or(DEFAULT_RESTART_DELAY);
                client.retry = match backoff_max {
                    Some(max) => RetryPolicy::Exponential { initial, max },
                    None => RetryPolicy::Fixed(initial),
                };
            }

            config.client = Some(client);
            config.server = None;
            config.log.debug |= debug;
        }
        Commands::Server {
            bind,
            port,
            upstream,
            debug,
            max_concurrent,
            resolve_timeout,
        } => {
            let mut server = config.server.take().unwrap_or_default();
            let ip = match bind {
                Some(bind) => resolve_host(&bind).await?,
                None => server.bind.ip(),
            };
            server.bind = SocketAddr::new(ip, port.unwrap_or(server.bind.port()));
            if let Some(upstream) = upstream {
                server.upstream = resolve_endpoint(&upstream).await?;
            }
            if let Some(max_concurrent) = max_concurrent {
                server.max_concurrent = max_concurrent;
            }
            if let Some(resolve_timeout) = resolve_timeout {
                server.resolve_timeout = resolve_timeout;
            }

            config.server = Some(server);
            config.client = None;
            config.log.debug |= debug;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn merged(file: WsdnsConfig, args: &[&str]) -> Result<WsdnsConfig> {
        let cli = Cli::try_parse_from(args)?;
        let mut config = file;
        apply_cli(&mut config, cli.command).await?;
        Ok(config)
    }

    #[tokio::test]
    async fn test_client_flags() {
        let config = merged(
            WsdnsConfig::default(),
            &[
                "wsdns", "client", "-c", "ws://a/,ws://b/", "-p", "5353,5354", "-d",
                "--restart-delay", "1s", "--backoff-max", "1m",
            ],
        )
        .await
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.pairings.len(), 2);
        assert_eq!(
            client.retry,
            RetryPolicy::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(60),
            }
        );
        assert!(config.log.debug);
    }

    #[tokio::test]
    async fn test_client_requires_server() {
        assert!(merged(WsdnsConfig::default(), &["wsdns", "client"]).await.is_err());
    }

    #[tokio::test]
    async fn test_cli_overrides_file() {
        let file: WsdnsConfig = toml::from_str(
            r#"
            [client]
            retry = { fixed = "2s" }

            [[client.pairings]]
            server = "ws://file/"
            port = 5353

            [server]
            upstream = "1.1.1.1:53"
            "#,
        )
        .unwrap();

        let config = merged(file.clone(), &["wsdns", "client", "-b", "127.0.0.2"]).await.unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.bind_addr, "127.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(client.retry, RetryPolicy::Fixed(Duration::from_secs(2)));
        assert!(config.server.is_none());

        let config = merged(file, &["wsdns", "server", "-p", "8080"]).await.unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.upstream, "1.1.1.1:53".parse().unwrap());
        assert!(config.client.is_none());
    }

    #[tokio::test]
    async fn test_host_names_are_resolved() {
        let config = merged(
            WsdnsConfig::default(),
            &["wsdns", "server", "-b", "localhost", "-s", "localhost:5300"],
        )
        .await
        .unwrap();
        let server = config.server.unwrap();
        assert!(server.bind.ip().is_loopback());
        assert_eq!(server.bind.port(), 5353);
        assert!(server.upstream.ip().is_loopback());
        assert_eq!(server.upstream.port(), 5300);

        let config = merged(
            WsdnsConfig::default(),
            &["wsdns", "client", "-c", "ws://a/", "-b", "localhost"],
        )
        .await
        .unwrap();
        assert!(config.client.unwrap().bind_addr.is_loopback());
    }

    #[tokio::test]
    async fn test_bad_upstream_is_rejected() {
        let result = merged(
            WsdnsConfig::default(),
            &["wsdns", "server", "-s", "no-port-given"],
        )
        .await;
        assert!(result.is_err());
    }
}

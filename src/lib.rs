//! wsdns: DNS over a multiplexed WebSocket tunnel
//!
//! wsdns carries DNS queries from local UDP clients to a remote resolver
//! through one persistent WebSocket connection, so that DNS traffic can cross
//! networks that block raw UDP/53 but still allow HTTP(S).
//!
//! ## Features
//!
//! - **Multiplexing**: many concurrent queries share one connection, each
//!   tagged with the address of the client that sent it
//! - **Keepalive**: dead connections are detected with pings under deadlines
//! - **Self-healing**: failed pairings are rebuilt from scratch after a delay
//! - **Multiple Tunnels**: several independent (port, endpoint) pairings per
//!   client process
//! - **TLS**: `wss://` endpoints through rustls
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use wsdns::{ClientConfig, LogConfig, SessionConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientConfig::from_lists("wss://example.com/dns", "127.0.0.1", "5353")?;
//!     Supervisor::new(&client, SessionConfig::default(), LogConfig::default())
//!         .run()
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Run as client: two local ports, two tunnels
//! wsdns client -c wss://one.example/dns,wss://two.example/dns -p 5353,5354
//!
//! # Run as server
//! wsdns server -b 0.0.0.0 -p 8080 -s 1.1.1.1:53
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ UDP ┌────────────┐  WebSocket  ┌────────────┐ UDP ┌──────────┐
//! │ DNS client │────▶│   wsdns    │════════════▶│   wsdns    │────▶│ upstream │
//! │   (dig)    │◀────│   client   │◀════════════│   server   │◀────│ resolver │
//! └────────────┘     └────────────┘             └────────────┘     └──────────┘
//! ```

pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod framing;
pub mod resolver;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use client::ClientMultiplexer;
pub use config::{ClientConfig, LogConfig, PairingConfig, ServerConfig, SessionConfig, WsdnsConfig};
pub use error::{SubmitError, TunnelError};
pub use framing::FrameError;
pub use resolver::{Resolve, ResolveError, UpstreamResolver};
pub use server::{QueryDispatcher, TunnelServer};
pub use session::{InboundHandler, Outbound, SessionState, TunnelSession};
pub use supervisor::{PairingHandle, PairingState, RetryPolicy, Supervisor, SupervisorHandle};
pub use transport::{MessageSink, MessageStream};

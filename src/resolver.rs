//! Upstream resolver adapter
//!
//! Forwards one opaque DNS query to the configured upstream server over a
//! short-lived UDP socket and returns the first reply datagram.

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Reply buffer size. Longer upstream replies are truncated to this length.
pub const MAX_REPLY_SIZE: usize = 2048;

/// Per-query resolution failures
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The query could not be sent upstream
    #[error("failed to send DNS query to upstream DNS server: {0}")]
    SendFailed(#[source] std::io::Error),

    /// The upstream reply could not be read
    #[error("failed to read DNS response from upstream DNS server: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// No reply arrived in time
    #[error("no DNS response from upstream DNS server within {0:?}")]
    Timeout(Duration),
}

/// Something that can answer an opaque DNS query
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError>;
}

/// Resolver backed by a fixed upstream DNS server
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    upstream: SocketAddr,
    timeout: Duration,
}

impl UpstreamResolver {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Unspecified local address in the upstream's address family
    fn local_addr(&self) -> SocketAddr {
        match self.upstream {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }
}

#[async_trait]
impl Resolve for UpstreamResolver {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let socket = UdpSocket::bind(self.local_addr())
            .await
            .map_err(ResolveError::SendFailed)?;

        // connected socket: replies from anyone but the upstream are filtered
        socket
            .connect(self.upstream)
            .await
            .map_err(ResolveError::SendFailed)?;

        socket.send(query).await.map_err(ResolveError::SendFailed)?;

        let mut reply = vec![0u8; MAX_REPLY_SIZE];
        let n = timeout(self.timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| ResolveError::Timeout(self.timeout))?
            .map_err(ResolveError::ReceiveFailed)?;
        reply.truncate(n);

        log::trace!(
            "Upstream {} answered {} byte query with {} bytes",
            self.upstream,
            query.len(),
            n
        );

        Ok(reply)
    }
}

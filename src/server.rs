//! Tunnel server
//!
//! Accepts WebSocket connections, resolves every tunneled query against the
//! upstream DNS server and sends the reply back over the connection it came
//! from, tagged with the key it arrived with. Each accepted connection is an
//! independent [`TunnelSession`]; connections share only the resolver and the
//! concurrency limit.

use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;

use crate::config::{LogConfig, ServerConfig, SessionConfig};
use crate::dns;
use crate::error::TunnelError;
use crate::framing;
use crate::resolver::{Resolve, UpstreamResolver};
use crate::session::{InboundHandler, Outbound, TunnelSession};

/// Resolves inbound queries and queues the tagged replies
#[derive(Clone)]
pub struct QueryDispatcher {
    resolver: Arc<dyn Resolve>,
    limit: Arc<Semaphore>,
    log: LogConfig,
}

impl QueryDispatcher {
    pub fn new(resolver: Arc<dyn Resolve>, max_concurrent: usize, log: LogConfig) -> Self {
        Self {
            resolver,
            limit: Arc::new(Semaphore::new(max_concurrent)),
            log,
        }
    }
}

#[async_trait]
impl InboundHandler for QueryDispatcher {
    async fn on_inbound(&self, message: Vec<u8>, outbound: &Outbound) {
        let (key, query) = match framing::decode(&message) {
            Ok((key, query)) => (key.to_vec(), query.to_vec()),
            Err(e) => {
                log::warn!("discarding tunneled query: {}", e);
                return;
            }
        };

        // holding the reader here is the backpressure when upstream is slow
        let Ok(permit) = self.limit.clone().acquire_owned().await else {
            return;
        };

        let resolver = self.resolver.clone();
        let outbound = outbound.clone();
        let debug = self.log.debug;

        tokio::spawn(async move {
            let _permit = permit;

            let reply = match resolver.resolve(&query).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!(
                        "query {} for {} failed: {}",
                        dns::describe(&query),
                        String::from_utf8_lossy(&key),
                        e
                    );
                    return;
                }
            };

            if debug {
                log::info!(
                    "resolved {} for {}",
                    dns::describe(&query),
                    String::from_utf8_lossy(&key)
                );
            }

            if let Err(e) = outbound.submit(framing::encode(&key, &reply)) {
                log::warn!(
                    "dropping reply for {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                );
            }
        });
    }
}

/// Accepts tunnel connections
pub struct TunnelServer {
    listener: TcpListener,
    dispatcher: QueryDispatcher,
    session: SessionConfig,
}

impl TunnelServer {
    /// Bind with the upstream resolver from `config`
    pub async fn bind(
        config: &ServerConfig,
        session: SessionConfig,
        log: LogConfig,
    ) -> Result<Self, TunnelError> {
        let resolver = UpstreamResolver::new(config.upstream, config.resolve_timeout);
        log::info!("using upstream DNS server {}", resolver.upstream());

        Self::with_resolver(
            config.bind,
            Arc::new(resolver),
            config.max_concurrent,
            session,
            log,
        )
        .await
    }

    /// Bind with any resolver
    pub async fn with_resolver(
        bind: SocketAddr,
        resolver: Arc<dyn Resolve>,
        max_concurrent: usize,
        session: SessionConfig,
        log: LogConfig,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| TunnelError::Bind { addr: bind, source })?;

        Ok(Self {
            listener,
            dispatcher: QueryDispatcher::new(resolver, max_concurrent, log),
            session,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<(), TunnelError> {
        log::info!("tunnel server listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("failed to accept tunnel connection: {}", e);
                    continue;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let session = self.session.clone();

            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, dispatcher, session).await {
                    log::warn!("{}: {}", peer, e);
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: QueryDispatcher,
    config: SessionConfig,
) -> Result<(), TunnelError> {
    stream.set_nodelay(true)?;

    let ws = timeout(config.handshake_timeout, accept_async(stream))
        .await
        .map_err(|_| {
            TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "websocket handshake timed out",
            ))
        })??;
    log::info!("{}: tunnel connection accepted", peer);

    let (sink, stream) = ws.split();
    let session = TunnelSession::start(peer.to_string(), sink, stream, dispatcher, &config);
    session.closed().await;

    log::info!("{}: tunnel connection closed", peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolveError;
    use std::time::Duration;

    /// Answers `ok` queries with `A:<query>` and fails everything else
    struct ScriptedResolver;

    #[async_trait]
    impl Resolve for ScriptedResolver {
        async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
            if query.starts_with(b"ok") {
                let mut reply = b"A:".to_vec();
                reply.extend_from_slice(query);
                Ok(reply)
            } else {
                Err(ResolveError::Timeout(Duration::from_millis(1)))
            }
        }
    }

    fn dispatcher() -> QueryDispatcher {
        QueryDispatcher::new(Arc::new(ScriptedResolver), 4, LogConfig::default())
    }

    #[tokio::test]
    async fn test_failed_query_does_not_affect_others() {
        let dispatcher = dispatcher();
        let (outbound, mut replies) = Outbound::channel(8);

        dispatcher
            .on_inbound(framing::encode(b"127.0.0.1:1", b"bad"), &outbound)
            .await;
        dispatcher
            .on_inbound(framing::encode(b"127.0.0.1:2", b"ok-2"), &outbound)
            .await;
        dispatcher.on_inbound(b"garbage".to_vec(), &outbound).await;

        let reply = tokio::time::timeout(Duration::from_secs(1), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, framing::encode(b"127.0.0.1:2", b"A:ok-2"));

        // nothing else is produced
        assert!(tokio::time::timeout(Duration::from_millis(100), replies.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reply_keeps_key_verbatim() {
        let dispatcher = dispatcher();
        let (outbound, mut replies) = Outbound::channel(8);

        let key = b"[::1]:53000";
        dispatcher
            .on_inbound(framing::encode(key, b"ok\x00\x00tail"), &outbound)
            .await;

        let reply = tokio::time::timeout(Duration::from_secs(1), replies.recv())
            .await
            .unwrap()
            .unwrap();
        let (reply_key, payload) = framing::decode(&reply).unwrap();
        assert_eq!(reply_key, key);
        assert_eq!(payload, b"A:ok\x00\x00tail");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = TunnelServer::with_resolver(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ScriptedResolver),
            1,
            SessionConfig::default(),
            LogConfig::default(),
        )
        .await
        .unwrap();

        let taken = first.local_addr().unwrap();
        let err = TunnelServer::with_resolver(
            taken,
            Arc::new(ScriptedResolver),
            1,
            SessionConfig::default(),
            LogConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TunnelError::Bind { .. }));
    }
}

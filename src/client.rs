//! Client multiplexer
//!
//! Listens for DNS queries on a local UDP socket, tags each datagram with the
//! address it came from and pushes it through the tunnel session. Replies come
//! back tagged with the same address and are written straight back to it.
//!
//! ```text
//! dig ──UDP──▶ listener ──encode──▶ session ══ WebSocket ══▶ server
//! dig ◀─UDP─── listener ◀─decode─── session ◀═════════════════╝
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use crate::config::{LogConfig, PairingConfig, SessionConfig};
use crate::dns;
use crate::error::{SubmitError, TunnelError};
use crate::framing;
use crate::session::{InboundHandler, Outbound, TunnelSession};
use crate::transport::{MessageSink, MessageStream};

/// Receive buffer for local DNS queries
pub const MAX_QUERY_SIZE: usize = 1500;

/// Routes tunneled replies back to the UDP client named by their key
struct ReplyRouter {
    socket: Arc<UdpSocket>,
    label: Arc<str>,
    log: LogConfig,
}

#[async_trait]
impl InboundHandler for ReplyRouter {
    async fn on_inbound(&self, message: Vec<u8>, _outbound: &Outbound) {
        let (key, payload) = match framing::decode(&message) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("{}: discarding reply: {}", self.label, e);
                return;
            }
        };

        let client = match framing::parse_correlation_key(key) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("{}: discarding reply: {}", self.label, e);
                return;
            }
        };

        let payload = payload.to_vec();
        let socket = self.socket.clone();
        let label = self.label.clone();
        let debug = self.log.debug;

        tokio::spawn(async move {
            match socket.send_to(&payload, client).await {
                Ok(_) if debug => log::info!(
                    "{}: result of {} sent to {}",
                    label,
                    dns::describe(&payload),
                    client
                ),
                Ok(_) => {}
                Err(e) => log::debug!("{}: error sending result back to {}: {}", label, client, e),
            }
        });
    }
}

/// One live pairing: a bound UDP listener wired to one tunnel session
pub struct ClientMultiplexer {
    socket: Arc<UdpSocket>,
    session: TunnelSession,
    log: LogConfig,
}

impl ClientMultiplexer {
    /// Wire a bound listener to an established transport and start the session
    pub fn new<W, R>(
        label: impl Into<String>,
        socket: UdpSocket,
        sink: W,
        stream: R,
        session: &SessionConfig,
        log: LogConfig,
    ) -> Self
    where
        W: MessageSink,
        R: MessageStream,
    {
        let label: Arc<str> = Arc::from(label.into());
        let socket = Arc::new(socket);
        let router = ReplyRouter {
            socket: socket.clone(),
            label: label.clone(),
            log,
        };

        Self {
            socket,
            session: TunnelSession::start(label.to_string(), sink, stream, router, session),
            log,
        }
    }

    /// Bind the pairing's listener, then open its tunnel connection.
    ///
    /// Either failure is fatal to this attempt at the pairing.
    pub async fn connect(
        pairing: &PairingConfig,
        session: &SessionConfig,
        log: LogConfig,
    ) -> Result<Self, TunnelError> {
        let socket = UdpSocket::bind(pairing.bind)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: pairing.bind,
                source,
            })?;
        log::info!("listening on {}", socket.local_addr()?);

        let connect_error = |source: tokio_tungstenite::tungstenite::Error| TunnelError::Connect {
            url: pairing.server.clone(),
            source,
        };
        let (ws, _response) = timeout(session.handshake_timeout, connect_async(pairing.server.as_str()))
            .await
            .map_err(|_| {
                connect_error(
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "websocket handshake timed out")
                        .into(),
                )
            })?
            .map_err(connect_error)?;
        log::info!("connected to {}", pairing.server);

        let (sink, stream) = ws.split();
        Ok(Self::new(pairing.to_string(), socket, sink, stream, session, log))
    }

    /// Address the UDP listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.socket.local_addr()?)
    }

    /// The tunnel session carrying this pairing's traffic
    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    /// Tag a datagram with its source address and queue it for the tunnel.
    ///
    /// A full queue drops the datagram; the DNS client will retry on its own.
    pub fn submit(&self, datagram: &[u8], source: SocketAddr) -> Result<(), SubmitError> {
        if self.log.debug {
            log::info!(
                "{}: querying {} for {}",
                self.session.label(),
                dns::describe(datagram),
                source
            );
        }

        let result = self.session.submit(framing::encode_for(&source, datagram));
        if let Err(SubmitError::QueueFull) = result {
            log::warn!(
                "{}: outbound queue full, dropping query from {}",
                self.session.label(),
                source
            );
        }
        result
    }

    /// Serve queries until the pairing fails, and return why it failed.
    pub async fn run(self) -> TunnelError {
        let closed = self.session.closed();
        tokio::pin!(closed);

        let mut buf = vec![0u8; MAX_QUERY_SIZE];
        loop {
            tokio::select! {
                _ = &mut closed => return TunnelError::SessionClosed,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => {
                        // drops are logged by submit; a closed session ends the loop above
                        let _ = self.submit(&buf[..n], source);
                    }
                    Err(e) => {
                        log::warn!(
                            "{}: error reading client request: {}",
                            self.session.label(),
                            e
                        );
                        self.session.shutdown();
                        (&mut closed).await;
                        return TunnelError::Io(e);
                    }
                }
            }
        }
    }
}

//! Transport Abstraction Layer
//!
//! A tunnel session only needs a reliable, ordered channel of discrete binary
//! messages with an explicit "closed" signal. The two halves of that channel
//! are modelled as traits so that sessions can run over WebSocket in
//! production and over scripted transports in tests.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::TunnelError;

/// Write half of a message transport
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Send one complete binary message
    async fn send_message(&mut self, message: Vec<u8>) -> Result<(), TunnelError>;

    /// Send a transport-level liveness probe
    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), TunnelError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TunnelError>;
}

/// Read half of a message transport
#[async_trait]
pub trait MessageStream: Send + 'static {
    /// Wait for the next binary message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, TunnelError>;
}

#[async_trait]
impl<S> MessageSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_message(&mut self, message: Vec<u8>) -> Result<(), TunnelError> {
        self.send(Message::Binary(message)).await?;
        Ok(())
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.send(Message::Ping(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> MessageStream for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, TunnelError> {
        while let Some(message) = self.next().await {
            match message? {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(frame) => {
                    log::debug!("Peer sent close frame: {:?}", frame);
                    return Ok(None);
                }
                Message::Text(text) => {
                    log::debug!("Ignoring {}-byte text message", text.len());
                }
                // pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(None)
    }
}

//! Loopback fixtures shared by the integration tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use wsdns::{framing, LogConfig, SessionConfig, TunnelServer, UpstreamResolver};

/// Queries seen by a fake upstream, in arrival order
pub type Recorded = Arc<Mutex<Vec<Vec<u8>>>>;

/// Fake upstream DNS server answering `R:<query>`.
///
/// `delay` picks how long to hold each query before answering, which lets a
/// test force replies out of order.
pub async fn fake_upstream<F>(delay: F) -> (SocketAddr, Recorded)
where
    F: Fn(&[u8]) -> Duration + Send + Sync + 'static,
{
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let recorded: Recorded = Arc::default();
    let delay = Arc::new(delay);

    let seen = recorded.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let query = buf[..n].to_vec();
            seen.lock().unwrap().push(query.clone());

            let socket = socket.clone();
            let wait = delay(&query);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let mut reply = b"R:".to_vec();
                reply.extend_from_slice(&query);
                let _ = socket.send_to(&reply, peer).await;
            });
        }
    });

    (addr, recorded)
}

/// Run a real tunnel server in front of `upstream` and return its URL
pub async fn tunnel_server(upstream: SocketAddr) -> String {
    let server = TunnelServer::with_resolver(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(UpstreamResolver::new(upstream, Duration::from_secs(2))),
        16,
        SessionConfig::default(),
        LogConfig::default(),
    )
    .await
    .unwrap();

    let url = format!("ws://{}/dns", server.local_addr().unwrap());
    tokio::spawn(server.run());
    url
}

/// Scripted WebSocket endpoint answering `pong:<payload>` to every frame
pub struct ScriptedEndpoint {
    pub url: String,
    /// Every binary frame received, verbatim
    pub frames: Recorded,
    /// Connections that completed the handshake
    pub accepted: Arc<AtomicUsize>,
    kill: watch::Sender<usize>,
}

impl ScriptedEndpoint {
    /// Drop every live connection without a close frame
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

/// Start an endpoint that drops its first `drop_first` connections right
/// after the handshake.
pub async fn scripted_endpoint(drop_first: usize) -> ScriptedEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let frames: Recorded = Arc::default();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (kill, _) = watch::channel(0usize);

    let seen = frames.clone();
    let count = accepted.clone();
    let killer = kill.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            if count.fetch_add(1, Ordering::SeqCst) < drop_first {
                drop(ws);
                continue;
            }

            let seen = seen.clone();
            let mut killed = killer.subscribe();
            tokio::spawn(async move {
                let (mut write, mut read) = ws.split();
                loop {
                    let message = tokio::select! {
                        _ = killed.changed() => return,
                        message = read.next() => message,
                    };
                    let Some(Ok(message)) = message else {
                        return;
                    };
                    let Message::Binary(frame) = message else {
                        continue;
                    };
                    seen.lock().unwrap().push(frame.clone());

                    let Ok((key, payload)) = framing::decode(&frame) else {
                        continue;
                    };
                    let mut reply = b"pong:".to_vec();
                    reply.extend_from_slice(payload);
                    if write
                        .send(Message::Binary(framing::encode(key, &reply)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    ScriptedEndpoint {
        url,
        frames,
        accepted,
        kill,
    }
}

/// Send `query` to `target` and wait for one reply
pub async fn ask(socket: &UdpSocket, target: SocketAddr, query: &[u8]) -> Vec<u8> {
    socket.send_to(query, target).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no reply within 5s")
        .unwrap();
    assert_eq!(from, target);
    buf.truncate(n);
    buf
}

/// A loopback UDP port that was free a moment ago
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

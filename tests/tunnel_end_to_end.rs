//! Client and server wired together over loopback

mod common;

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_test::assert_ok;

use common::{ask, fake_upstream, scripted_endpoint, tunnel_server};
use wsdns::{ClientMultiplexer, LogConfig, PairingConfig, SessionConfig};

async fn client_pairing(server: String) -> std::net::SocketAddr {
    let pairing = PairingConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        server,
    };
    let mux = assert_ok!(
        ClientMultiplexer::connect(&pairing, &SessionConfig::default(), LogConfig { debug: true })
            .await
    );
    let listen = mux.local_addr().unwrap();
    tokio::spawn(mux.run());
    listen
}

#[tokio::test]
async fn test_tunnel_frame_layout() {
    let endpoint = scripted_endpoint(0).await;
    let listen = client_pairing(endpoint.url.clone()).await;

    let dig = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = ask(&dig, listen, b"Q").await;
    assert_eq!(reply, b"pong:Q");

    let expected = format!("{}\x00\x00Q", dig.local_addr().unwrap());
    assert_eq!(endpoint.frames.lock().unwrap().as_slice(), &[expected.into_bytes()]);
}

#[tokio::test]
async fn test_query_reaches_upstream_unchanged() {
    let (upstream, seen) = fake_upstream(|_| Duration::ZERO).await;
    let listen = client_pairing(tunnel_server(upstream).await).await;

    let dig = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // payload containing the delimiter must survive untouched
    let query = b"Q\x00\x00tail";
    let reply = ask(&dig, listen, query).await;

    assert_eq!(reply, b"R:Q\x00\x00tail");
    assert_eq!(seen.lock().unwrap().as_slice(), &[query.to_vec()]);
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_replies() {
    const CLIENTS: usize = 20;

    // later queries are answered first
    let (upstream, seen) = fake_upstream(|query| {
        let index: u64 = std::str::from_utf8(&query[2..]).unwrap().parse().unwrap();
        Duration::from_millis((CLIENTS as u64 - index) * 10)
    })
    .await;
    let listen = client_pairing(tunnel_server(upstream).await).await;

    let mut tasks = Vec::new();
    for i in 0..CLIENTS {
        tasks.push(tokio::spawn(async move {
            let dig = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let query = format!("q-{}", i);
            let reply = ask(&dig, listen, query.as_bytes()).await;
            (i, reply)
        }));
    }

    let mut replies = HashMap::new();
    for task in tasks {
        let (i, reply) = task.await.unwrap();
        replies.insert(i, reply);
    }

    assert_eq!(replies.len(), CLIENTS);
    for (i, reply) in replies {
        assert_eq!(reply, format!("R:q-{}", i).into_bytes());
    }
    assert_eq!(seen.lock().unwrap().len(), CLIENTS);
}

#[tokio::test]
async fn test_server_serves_several_tunnels() {
    let (upstream, _) = fake_upstream(|_| Duration::from_millis(5)).await;
    let url = tunnel_server(upstream).await;

    let first = client_pairing(url.clone()).await;
    let second = client_pairing(url).await;

    let dig = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(ask(&dig, first, b"one").await, b"R:one");
    assert_eq!(ask(&dig, second, b"two").await, b"R:two");
}

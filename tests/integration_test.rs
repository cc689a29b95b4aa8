//! Integration tests for Burrow
//!
//! Runs a real server and client over loopback TCP:
//! - Tunnel pool establishment
//! - Striped transfer through virtual connections
//! - Half-close propagation
//! - Peer expiry on the server

use burrow::crypto::{CipherKind, MasterKey};
use burrow::protocol::Timeouts;
use burrow::transport::TcpDialer;
use burrow::{ClientPeer, PeerOptions, Server};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn options(password: &str) -> PeerOptions {
    let timeouts = Timeouts {
        dial_backoff: Duration::from_millis(50),
        empty_peer_grace: Duration::from_millis(200),
        handshake: Duration::from_secs(2),
        connect: Duration::from_secs(2),
        ..Timeouts::default()
    };
    PeerOptions {
        key: Arc::new(MasterKey::from_password(CipherKind::ChaCha20Poly1305, password).unwrap()),
        dialer: Arc::new(TcpDialer::new(timeouts.connect)),
        timeouts,
    }
}

/// Echo every accepted connection until the peer half-closes
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Accept one connection and report everything it received before EOF
async fn spawn_sink_server() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });
    (addr, handle)
}

async fn spawn_server(root: &CancellationToken, password: &str) -> (Server, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(options(password), root);

    let serving = server.clone();
    let shutdown = root.child_token();
    tokio::spawn(async move {
        let _ = serving.serve(listener, shutdown).await;
    });
    (server, addr)
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Client fills its pool and the server groups every tunnel under one peer
#[tokio::test]
async fn test_tunnel_pool_established() {
    let root = CancellationToken::new();
    let (server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 3, options("secret"), &root);

    let tunnels = client.peer().tunnel_pool().clone();
    wait_for(|| {
        let tunnels = tunnels.clone();
        async move { tunnels.tunnel_count().await == 3 }
    })
    .await;

    let group = server.group().clone();
    let peer_id = client.peer().id();
    wait_for(|| {
        let group = group.clone();
        async move {
            match group.get(peer_id).await {
                Some(peer) => peer.tunnel_pool().tunnel_count().await == 3,
                None => false,
            }
        }
    })
    .await;
    assert_eq!(server.group().peer_count().await, 1);

    root.cancel();
}

/// Bytes written through a virtual connection come back intact and in order
#[tokio::test]
async fn test_echo_through_tunnels() {
    let root = CancellationToken::new();
    let echo = spawn_echo_server().await;
    let (_server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("secret"), &root);

    let mut stream = client.dial(&echo.to_string()).await.unwrap();
    let data = pattern(130_000);

    let received = {
        let (mut reader, mut writer) = tokio::io::split(&mut stream);
        let send = async {
            writer.write_all(&data).await.unwrap();
            writer.shutdown().await.unwrap();
        };
        let recv = async {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            received
        };
        let (_, received) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(send, recv)
        })
        .await
        .unwrap();
        received
    };

    assert_eq!(received.len(), data.len());
    assert!(received == data);

    stream.close().await;
    root.cancel();
}

/// A client that writes and closes at once still delivers every byte
#[tokio::test]
async fn test_write_then_close() {
    let root = CancellationToken::new();
    let (sink, received) = spawn_sink_server().await;
    let (_server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("secret"), &root);

    let data = pattern(130_000);
    let mut stream = client.dial(&sink.to_string()).await.unwrap();
    stream.write_all(&data).await.unwrap();
    stream.close().await;

    let received = tokio::time::timeout(Duration::from_secs(10), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);

    root.cancel();
}

/// Several connections share the same tunnels without mixing data
#[tokio::test]
async fn test_concurrent_connections() {
    let root = CancellationToken::new();
    let echo = spawn_echo_server().await;
    let (_server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("secret"), &root);

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let client = client.clone();
        let dest = echo.to_string();
        handles.push(tokio::spawn(async move {
            let mut stream = client.dial(&dest).await.unwrap();
            let data = vec![i; 20_000 + i as usize * 1000];

            stream.write_all(&data).await.unwrap();
            stream.shutdown().await.unwrap();

            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            stream.close().await;
            received == data
        }));
    }

    for handle in handles {
        let ok = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ok);
    }

    root.cancel();
}

/// Local connections accepted by the forwarder reach the destination
#[tokio::test]
async fn test_serve_forward() {
    let root = CancellationToken::new();
    let echo = spawn_echo_server().await;
    let (_server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("secret"), &root);

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    let forwarder = client.clone();
    tokio::spawn(async move {
        let _ = forwarder.serve_forward(local, echo.to_string()).await;
    });

    let mut socket = TcpStream::connect(local_addr).await.unwrap();
    socket.write_all(b"hello through the burrow").await.unwrap();
    socket.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), socket.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello through the burrow");

    root.cancel();
}

/// A destination nobody listens on closes the virtual connection
#[tokio::test]
async fn test_unreachable_destination() {
    let root = CancellationToken::new();
    let (_server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 1, options("secret"), &root);

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest = closed.local_addr().unwrap();
    drop(closed);

    let mut stream = client.dial(&dest.to_string()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    root.cancel();
}

/// Once the client goes away the server forgets the peer after the grace
#[tokio::test]
async fn test_peer_expires_after_client_leaves() {
    let root = CancellationToken::new();
    let (server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("secret"), &root);

    let group = server.group().clone();
    wait_for(|| {
        let group = group.clone();
        async move { group.peer_count().await == 1 }
    })
    .await;

    client.close();

    wait_for(|| {
        let group = group.clone();
        async move { group.peer_count().await == 0 }
    })
    .await;

    root.cancel();
}

/// Tunnels keyed with a different password never join a peer
#[tokio::test]
async fn test_wrong_key_rejected() {
    let root = CancellationToken::new();
    let (server, addr) = spawn_server(&root, "secret").await;
    let client = ClientPeer::new(&addr.to_string(), 2, options("not-the-secret"), &root);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.group().peer_count().await, 0);
    assert_eq!(client.peer().tunnel_pool().tunnel_count().await, 0);

    root.cancel();
}

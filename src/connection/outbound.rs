//! Remotely opened connections: dial the requested address and bridge the
//! real socket to the connection's blocks

use super::shared::ConnectionCore;
use crate::protocol::{Block, BlockType, ShutdownType, OUTBOUND_READ_BUFFER};
use crate::transport::{BoxStream, Dialer};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Wait for the Connect block, dial, then run both bridge directions
pub(crate) async fn run_outbound(
    core: Arc<ConnectionCore>,
    mut ordered: mpsc::Receiver<Block>,
    dialer: Arc<dyn Dialer>,
) {
    let connection_id = core.id();
    // The remote may already have closed; its Connect and Data still count
    let abort = core.abort_token().clone();

    let first = tokio::select! {
        _ = abort.cancelled() => return,
        first = ordered.recv() => first,
    };
    let Some(first) = first else {
        return;
    };

    let address = match (first.block_type(), first.address()) {
        (BlockType::Connect, Some(address)) => address.to_string(),
        _ => {
            warn!(
                connection_id,
                block_type = ?first.block_type(),
                "Connection did not start with a valid Connect block"
            );
            core.fail().await;
            return;
        }
    };

    let socket = tokio::select! {
        _ = abort.cancelled() => return,
        socket = dialer.dial(&address) => socket,
    };
    let socket = match socket {
        Ok(socket) => socket,
        Err(e) => {
            warn!(connection_id, address = %address, error = %e, "Outbound dial failed");
            core.fail().await;
            return;
        }
    };
    info!(connection_id, address = %address, "Outbound connection established");

    let (reader, writer) = tokio::io::split(socket);
    tokio::spawn(socket_to_blocks(core.clone(), reader));
    blocks_to_socket(core, ordered, writer).await;
}

/// Socket → Data blocks, until EOF, error, or the remote stops reading
async fn socket_to_blocks(core: Arc<ConnectionCore>, mut reader: ReadHalf<BoxStream>) {
    let connection_id = core.id();
    let stop = core.local_closed().clone();
    let mut buf = vec![0u8; OUTBOUND_READ_BUFFER];

    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(connection_id, "Outbound socket reached EOF");
                if core.shutdown_write().await.is_err() {
                    core.close();
                }
                break;
            }
            Ok(n) => {
                if core.send_data(&buf[..n]).await.is_err() {
                    core.close();
                    break;
                }
            }
            Err(e) => {
                warn!(connection_id, error = %e, "Outbound socket read failed");
                core.fail().await;
                break;
            }
        }
    }
}

/// Ordered blocks → socket, applying half-close to the real socket.
///
/// Runs until the ordering engine hangs up or sends Disconnect(Both), so
/// every block delivered before a clean close reaches the socket.
async fn blocks_to_socket(
    core: Arc<ConnectionCore>,
    mut ordered: mpsc::Receiver<Block>,
    mut writer: WriteHalf<BoxStream>,
) {
    let connection_id = core.id();
    let abort = core.abort_token().clone();

    loop {
        let block = tokio::select! {
            _ = abort.cancelled() => break,
            block = ordered.recv() => block,
        };
        let Some(block) = block else {
            break;
        };

        match (block.block_type(), block.shutdown_type()) {
            (BlockType::Data, _) => {
                let written = tokio::select! {
                    _ = abort.cancelled() => break,
                    written = writer.write_all(block.payload()) => written,
                };
                if let Err(e) = written {
                    warn!(connection_id, error = %e, "Outbound socket write failed");
                    core.fail().await;
                    break;
                }
            }
            (BlockType::Disconnect, Some(ShutdownType::WriteOnly)) => {
                debug!(connection_id, "Remote finished sending");
                let _ = writer.shutdown().await;
            }
            (BlockType::Disconnect, Some(ShutdownType::Both)) => break,
            _ => {}
        }
    }

    let _ = writer.shutdown().await;
    debug!(connection_id, "Outbound connection finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpDialer;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn outbound() -> (
        Arc<ConnectionCore>,
        mpsc::Sender<Block>,
        mpsc::Receiver<Block>,
        mpsc::Receiver<Block>,
    ) {
        let (send_tx, send_rx) = mpsc::channel(64);
        let core = Arc::new(ConnectionCore::new(4, send_tx, &CancellationToken::new()));
        let (ordered_tx, ordered_rx) = mpsc::channel(64);
        (core, ordered_tx, ordered_rx, send_rx)
    }

    #[tokio::test]
    async fn test_dial_failure_sends_single_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (core, ordered_tx, ordered_rx, mut upstream) = outbound();
        ordered_tx.send(Block::connect(4, 0, &addr)).await.unwrap();

        let dialer = Arc::new(TcpDialer::new(Duration::from_secs(2)));
        run_outbound(core.clone(), ordered_rx, dialer).await;

        let block = upstream.recv().await.unwrap();
        assert_eq!(block.shutdown_type(), Some(ShutdownType::Both));
        assert_eq!(block.block_id(), 0);
        assert!(upstream.try_recv().is_err());
        assert!(core.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_flushes_after_remote_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let target = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            request
        });

        // The ordering engine delivered everything, then saw Disconnect(Both)
        let (core, ordered_tx, ordered_rx, mut upstream) = outbound();
        ordered_tx.send(Block::connect(4, 0, &addr)).await.unwrap();
        ordered_tx.send(Block::data(4, 1, Bytes::from_static(b"hello "))).await.unwrap();
        ordered_tx.send(Block::data(4, 2, Bytes::from_static(b"world"))).await.unwrap();
        ordered_tx
            .send(Block::disconnect(4, 3, ShutdownType::Both))
            .await
            .unwrap();
        core.remote_closed();
        drop(ordered_tx);
        assert!(core.token().is_cancelled());

        let dialer = Arc::new(TcpDialer::new(Duration::from_secs(2)));
        tokio::time::timeout(Duration::from_secs(2), run_outbound(core, ordered_rx, dialer))
            .await
            .unwrap();

        assert_eq!(target.await.unwrap(), b"hello world");
        assert!(upstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bridges_socket_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(b"pong:").await.unwrap();
            socket.write_all(&request).await.unwrap();
        });

        let (core, ordered_tx, ordered_rx, mut upstream) = outbound();
        let dialer = Arc::new(TcpDialer::new(Duration::from_secs(2)));
        let bridge = tokio::spawn(run_outbound(core.clone(), ordered_rx, dialer));

        ordered_tx.send(Block::connect(4, 0, &addr)).await.unwrap();
        ordered_tx.send(Block::data(4, 1, Bytes::from_static(b"ping"))).await.unwrap();
        ordered_tx
            .send(Block::disconnect(4, 2, ShutdownType::WriteOnly))
            .await
            .unwrap();

        let mut reply = Vec::new();
        loop {
            let block = upstream.recv().await.unwrap();
            match block.block_type() {
                BlockType::Data => reply.extend_from_slice(block.payload()),
                BlockType::Disconnect => {
                    assert_eq!(block.shutdown_type(), Some(ShutdownType::WriteOnly));
                    break;
                }
                BlockType::Connect => panic!("unexpected Connect"),
            }
        }
        assert_eq!(reply, b"pong:ping");
        server.await.unwrap();

        // Remote closes fully
        ordered_tx
            .send(Block::disconnect(4, 3, ShutdownType::Both))
            .await
            .unwrap();
        drop(ordered_tx);
        bridge.await.unwrap();
    }
}

//! Per-tunnel relay loops
//!
//! Each tunnel runs one outbound loop (shared send queues → socket) and one
//! inbound loop (socket → shared receive queue). Both stop when the
//! tunnel's token is cancelled, and either one cancels it on failure.

use super::pool::BlockQueue;
use super::TunnelError;
use crate::protocol::{Block, BlockCodec};
use futures::{FutureExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

async fn write_block<W>(writer: &mut W, block: &Block, limit: Duration) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, async {
        writer.write_all(&block.pack()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TunnelError::WriteTimeout)??;
    Ok(())
}

/// Drain the retry queue first, then the send queue, onto one tunnel.
///
/// A block that fails to write goes back on the retry queue and the
/// tunnel is cancelled.
pub(crate) async fn outbound_relay<W>(
    tunnel_id: u32,
    mut writer: W,
    send: BlockQueue,
    retry: BlockQueue,
    token: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if token.is_cancelled() {
            break;
        }

        let block = match retry.try_recv() {
            Some(block) => block,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    block = retry.recv() => block,
                    block = send.recv() => block,
                };
                match next {
                    Some(block) => block,
                    None => break,
                }
            }
        };

        if let Err(e) = write_block(&mut writer, &block, write_timeout).await {
            warn!(
                tunnel_id,
                connection_id = block.connection_id(),
                block_id = block.block_id(),
                error = %e,
                "Tunnel write failed, requeueing block"
            );
            token.cancel();
            retry.requeue(block);
            break;
        }

        trace!(
            tunnel_id,
            connection_id = block.connection_id(),
            block_id = block.block_id(),
            "block sent"
        );
    }

    let _ = writer.shutdown().await;
    debug!(tunnel_id, "outbound relay stopped");
}

/// Parse blocks off one tunnel and forward them to the pool's receive queue.
///
/// `closing` is the pool's token: forwarding only gives up once the whole
/// pool is going away.
pub(crate) async fn inbound_relay<R>(
    tunnel_id: u32,
    reader: R,
    recv_tx: mpsc::Sender<Block>,
    token: CancellationToken,
    closing: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, BlockCodec::new());

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(block)) => {
                if !forward(tunnel_id, block, &recv_tx, &closing).await {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(tunnel_id, error = %e, "Tunnel read failed");
                token.cancel();
                return;
            }
            None => {
                debug!(tunnel_id, "Tunnel closed by remote");
                token.cancel();
                return;
            }
        }
    }

    // Blocks that were already buffered when the tunnel was cancelled
    while let Some(Some(Ok(block))) = frames.next().now_or_never() {
        if !forward(tunnel_id, block, &recv_tx, &closing).await {
            return;
        }
    }
    debug!(tunnel_id, "inbound relay stopped");
}

async fn forward(
    tunnel_id: u32,
    block: Block,
    recv_tx: &mpsc::Sender<Block>,
    closing: &CancellationToken,
) -> bool {
    trace!(
        tunnel_id,
        connection_id = block.connection_id(),
        block_id = block.block_id(),
        "block received"
    );
    tokio::select! {
        sent = recv_tx.send(block) => sent.is_ok(),
        _ = closing.cancelled() => false,
    }
}

//! State shared by every task of one virtual connection

use super::state::{AtomicStreamState, StreamState};
use super::ConnectionError;
use crate::protocol::{Block, ShutdownType, BLOCK_ID_ORIGIN};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The part of a connection common to both variants: send-side block
/// numbering, half-close state and the connection's lifetime token.
///
/// The token is cancelled once the state reaches `Closed`; the owning pool
/// removes the connection when that happens. Blocks already delivered
/// before that point are still drained by the bridge loops, which only
/// stop early on `abort`.
pub(crate) struct ConnectionCore {
    id: u32,
    next_block_id: AtomicU32,
    send_tx: mpsc::Sender<Block>,
    state: AtomicStreamState,
    /// Lifetime of the whole connection
    token: CancellationToken,
    /// Cancelled when we may no longer send data
    local_closed: CancellationToken,
    /// Cancelled on faults and pool shutdown, never by a clean close
    abort: CancellationToken,
    reset: AtomicBool,
    disconnect_sent: AtomicBool,
}

impl ConnectionCore {
    /// Create a connection whose lifetime and abort tokens both hang off
    /// `parent`
    pub(crate) fn new(id: u32, send_tx: mpsc::Sender<Block>, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let local_closed = token.child_token();
        let abort = parent.child_token();
        Self {
            id,
            next_block_id: AtomicU32::new(BLOCK_ID_ORIGIN),
            send_tx,
            state: AtomicStreamState::default(),
            token,
            local_closed,
            abort,
            reset: AtomicBool::new(false),
            disconnect_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn local_closed(&self) -> &CancellationToken {
        &self.local_closed
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Block> {
        self.send_tx.clone()
    }

    /// A cancelled connection reads as `Closed` whatever its half-close bits
    pub(crate) fn state(&self) -> StreamState {
        if self.token.is_cancelled() {
            StreamState::Closed
        } else {
            self.state.get()
        }
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Allocate the next send-side block ID
    pub(crate) fn next_block_id(&self) -> u32 {
        self.reserve_block_ids(1)
    }

    /// Allocate `count` consecutive block IDs, returning the first
    fn reserve_block_ids(&self, count: u32) -> u32 {
        self.next_block_id.fetch_add(count, Ordering::AcqRel)
    }

    async fn send(&self, block: Block) -> Result<(), ConnectionError> {
        self.send_tx
            .send(block)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    pub(crate) async fn send_connect(&self, address: &str) -> Result<(), ConnectionError> {
        self.send(Block::connect(self.id, self.next_block_id(), address))
            .await
    }

    /// Chunk `data` into consecutive Data blocks and queue them
    pub(crate) async fn send_data(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }
        let first = self.reserve_block_ids(Block::data_block_count(data.len()) as u32);
        for block in Block::data_blocks(self.id, first, data) {
            self.send(block).await?;
        }
        Ok(())
    }

    /// Half-close: tell the remote we will send no more data
    pub(crate) async fn shutdown_write(&self) -> Result<(), ConnectionError> {
        if !self.state().can_send() {
            return Ok(());
        }
        self.send(Block::disconnect(
            self.id,
            self.next_block_id(),
            ShutdownType::WriteOnly,
        ))
        .await?;
        self.close_local();
        Ok(())
    }

    /// Claim the single Disconnect(Both) this connection may emit
    fn claim_disconnect(&self) -> bool {
        !self.disconnect_sent.swap(true, Ordering::AcqRel)
    }

    /// Emit Disconnect(Both) at most once over the connection's lifetime
    pub(crate) async fn send_disconnect_once(&self) {
        if self.claim_disconnect() {
            let block = Block::disconnect(self.id, self.next_block_id(), ShutdownType::Both);
            let _ = self.send(block).await;
        }
    }

    /// Non-async variant for `Drop` paths
    pub(crate) fn disconnect_now(&self) {
        if !self.claim_disconnect() {
            return;
        }
        let block = Block::disconnect(self.id, self.next_block_id(), ShutdownType::Both);
        match self.send_tx.try_send(block) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(block)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.send_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(block).await;
                    });
                }
            }
        }
    }

    /// The remote sent Disconnect(Both): tear down without answering
    pub(crate) fn remote_closed(&self) {
        self.disconnect_sent.store(true, Ordering::Release);
        self.close();
    }

    /// Socket or dial failure: one Disconnect(Both), then tear down
    pub(crate) async fn fail(&self) {
        self.send_disconnect_once().await;
        self.abort.cancel();
        self.close();
    }

    /// Ordering fault: readers see `ConnectionReset` once drained
    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.disconnect_now();
        self.abort.cancel();
        self.close();
    }

    pub(crate) fn close_local(&self) {
        self.local_closed.cancel();
        if self.state.close_local() == StreamState::Closed {
            self.finish();
        }
    }

    pub(crate) fn close_remote(&self) {
        if self.state.close_remote() == StreamState::Closed {
            self.finish();
        }
    }

    pub(crate) fn close(&self) {
        self.state.close();
        self.local_closed.cancel();
        self.finish();
    }

    fn finish(&self) {
        if !self.token.is_cancelled() {
            debug!(connection_id = self.id, "Connection closed");
            self.token.cancel();
        } else {
            trace!(connection_id = self.id, "Connection already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> (ConnectionCore, mpsc::Receiver<Block>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionCore::new(7, tx, &CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn test_block_ids_are_shared_across_types() {
        let (core, mut rx) = core();
        core.send_connect("host:80").await.unwrap();
        core.send_data(&vec![1u8; 20_000]).await.unwrap();
        core.shutdown_write().await.unwrap();

        let ids: Vec<u32> = (0..4).map(|_| rx.try_recv().unwrap().block_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(core.state(), StreamState::HalfClosedLocal);
        assert!(core.local_closed().is_cancelled());
        assert!(!core.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_single_disconnect_under_concurrent_failure() {
        let (core, mut rx) = core();
        tokio::join!(core.fail(), core.fail());
        core.disconnect_now();

        let block = rx.try_recv().unwrap();
        assert_eq!(block.shutdown_type(), Some(ShutdownType::Both));
        assert!(rx.try_recv().is_err());
        assert!(core.token().is_cancelled());
        assert!(core.abort_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_both_halves_close_the_connection() {
        let (core, _rx) = core();
        core.close_remote();
        assert!(!core.token().is_cancelled());
        core.close_local();
        assert!(core.token().is_cancelled());
        assert!(!core.abort_token().is_cancelled());
        assert!(!core.is_reset());
    }
}

//! Per-peer tunnel pool
//!
//! Fan-out: any live tunnel may take the next block from the shared send
//! (or retry) queue. Fan-in: every tunnel forwards what it parses into one
//! receive queue.

use super::manager::PoolManager;
use super::relay::{inbound_relay, outbound_relay};
use super::Tunnel;
use crate::protocol::{Block, Timeouts, TUNNEL_RECV_QUEUE_SIZE, TUNNEL_SEND_QUEUE_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A bounded queue with any number of consumers
#[derive(Clone)]
pub(crate) struct BlockQueue {
    tx: mpsc::Sender<Block>,
    rx: Arc<Mutex<mpsc::Receiver<Block>>>,
    /// Pool lifetime; pending requeues are abandoned once it is cancelled
    token: CancellationToken,
}

impl BlockQueue {
    pub(crate) fn new(capacity: usize, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            token,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Block> {
        self.tx.clone()
    }

    pub(crate) async fn recv(&self) -> Option<Block> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking receive; `None` if empty or another consumer holds it
    pub(crate) fn try_recv(&self) -> Option<Block> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Put a block back without ever blocking the caller
    pub(crate) fn requeue(&self, block: Block) {
        match self.tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(block)) => {
                let tx = self.tx.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(
                                connection_id = block.connection_id(),
                                block_id = block.block_id(),
                                "pool closed, dropping requeued block"
                            );
                        }
                        _ = tx.send(block.clone()) => {}
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

struct PoolInner {
    peer_id: u32,
    tunnels: Mutex<HashMap<u32, CancellationToken>>,
    manager: Arc<dyn PoolManager>,
    send: BlockQueue,
    retry: BlockQueue,
    recv_tx: mpsc::Sender<Block>,
    token: CancellationToken,
    timeouts: Timeouts,
}

/// The set of tunnels serving one peer
#[derive(Clone)]
pub struct TunnelPool {
    inner: Arc<PoolInner>,
}

impl TunnelPool {
    /// Create a pool under `parent`. Returns the receive queue carrying
    /// every block parsed from any tunnel.
    pub fn new(
        peer_id: u32,
        manager: Arc<dyn PoolManager>,
        parent: &CancellationToken,
        timeouts: Timeouts,
    ) -> (Self, mpsc::Receiver<Block>) {
        let token = parent.child_token();
        let (recv_tx, recv_rx) = mpsc::channel(TUNNEL_RECV_QUEUE_SIZE);

        let pool = Self {
            inner: Arc::new(PoolInner {
                peer_id,
                tunnels: Mutex::new(HashMap::new()),
                manager,
                send: BlockQueue::new(TUNNEL_SEND_QUEUE_SIZE, token.clone()),
                retry: BlockQueue::new(TUNNEL_SEND_QUEUE_SIZE, token.clone()),
                recv_tx,
                token,
                timeouts,
            }),
        };

        // Initial fill on the client side
        pool.spawn_decrease();
        (pool, recv_rx)
    }

    pub fn peer_id(&self) -> u32 {
        self.inner.peer_id
    }

    /// Producer side of the send queue
    pub fn sender(&self) -> mpsc::Sender<Block> {
        self.inner.send.sender()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn close(&self) {
        self.inner.token.cancel();
    }

    pub async fn tunnel_count(&self) -> usize {
        self.inner.tunnels.lock().await.len()
    }

    /// Register a tunnel and start relaying through it.
    ///
    /// Hands the tunnel back if the pool was cancelled before the manager
    /// saw it, so the caller can place it elsewhere.
    pub async fn add_tunnel(&self, tunnel: Tunnel) -> Result<(), Tunnel> {
        let tunnel_id = tunnel.id();
        let token = self.inner.token.child_token();

        {
            let mut tunnels = self.inner.tunnels.lock().await;
            if self.inner.token.is_cancelled() {
                return Err(tunnel);
            }
            tunnels.insert(tunnel_id, token.clone());
            let count = tunnels.len();
            self.inner.manager.on_change(self, count).await;

            // The manager may have retired the pool while we waited on it
            if self.inner.token.is_cancelled() {
                tunnels.remove(&tunnel_id);
                return Err(tunnel);
            }
            info!(tunnel_id, peer_id = self.inner.peer_id, count, "Tunnel added");
        }

        let (reader, writer) = tunnel.into_split();
        tokio::spawn(outbound_relay(
            tunnel_id,
            writer,
            self.inner.send.clone(),
            self.inner.retry.clone(),
            token.clone(),
            self.inner.timeouts.tunnel_write,
        ));
        tokio::spawn(inbound_relay(
            tunnel_id,
            reader,
            self.inner.recv_tx.clone(),
            token.clone(),
            self.inner.token.clone(),
        ));

        let pool = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            pool.remove_tunnel(tunnel_id).await;
        });
        Ok(())
    }

    /// Remove and cancel a tunnel. Returns `false` if it was already gone.
    pub async fn remove_tunnel(&self, tunnel_id: u32) -> bool {
        {
            let mut tunnels = self.inner.tunnels.lock().await;
            let Some(token) = tunnels.remove(&tunnel_id) else {
                return false;
            };
            token.cancel();
            let count = tunnels.len();
            warn!(tunnel_id, peer_id = self.inner.peer_id, count, "Tunnel removed");
            self.inner.manager.on_change(self, count).await;
        }

        if !self.inner.token.is_cancelled() {
            self.spawn_decrease();
        }
        true
    }

    fn spawn_decrease(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let manager = pool.inner.manager.clone();
            manager.on_decrease(pool).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ShutdownType;
    use crate::tunnel::link::tunnel_pair;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingManager {
        changes: AtomicUsize,
        decreases: AtomicUsize,
    }

    #[async_trait]
    impl PoolManager for CountingManager {
        async fn on_change(&self, _pool: &TunnelPool, _count: usize) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_decrease(&self, _pool: TunnelPool) {
            self.decreases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_blocks_cross_the_pool() {
        let root = CancellationToken::new();
        let (client, _client_rx) =
            TunnelPool::new(9, Arc::new(CountingManager::default()), &root, Timeouts::default());
        let (server, mut server_rx) =
            TunnelPool::new(9, Arc::new(CountingManager::default()), &root, Timeouts::default());

        let (active, passive) = tunnel_pair(9).await;
        assert!(client.add_tunnel(active).await.is_ok());
        assert!(server.add_tunnel(passive).await.is_ok());

        let block = Block::disconnect(3, 0, ShutdownType::WriteOnly);
        client.sender().send(block.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(block));

        root.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_double_remove() {
        let root = CancellationToken::new();
        let manager = Arc::new(CountingManager::default());
        let (pool, _rx) = TunnelPool::new(1, manager.clone(), &root, Timeouts::default());

        let (active, _passive) = tunnel_pair(1).await;
        let tunnel_id = active.id();
        assert!(pool.add_tunnel(active).await.is_ok());
        assert_eq!(pool.tunnel_count().await, 1);

        let (a, b) = tokio::join!(pool.remove_tunnel(tunnel_id), pool.remove_tunnel(tunnel_id));
        assert!(a ^ b);
        assert_eq!(pool.tunnel_count().await, 0);

        // The watcher's own removal is a no-op
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pool.remove_tunnel(tunnel_id).await);

        // add + exactly one successful remove
        assert_eq!(manager.changes.load(Ordering::SeqCst), 2);
        // creation + exactly one successful remove
        assert_eq!(manager.decreases.load(Ordering::SeqCst), 2);
    }

    /// Retires the pool from inside `on_change`, as an expiring peer does
    struct RetiringManager;

    #[async_trait]
    impl PoolManager for RetiringManager {
        async fn on_change(&self, pool: &TunnelPool, count: usize) {
            if count > 0 {
                pool.close();
            }
        }

        async fn on_decrease(&self, _pool: TunnelPool) {}
    }

    #[tokio::test]
    async fn test_retired_pool_hands_tunnel_back() {
        let root = CancellationToken::new();
        let (pool, _rx) = TunnelPool::new(2, Arc::new(RetiringManager), &root, Timeouts::default());

        let (active, _passive) = tunnel_pair(2).await;
        let tunnel_id = active.id();
        let returned = pool.add_tunnel(active).await.err().unwrap();
        assert_eq!(returned.id(), tunnel_id);
        assert_eq!(pool.tunnel_count().await, 0);

        // Once cancelled, nothing gets in
        let (again, _passive) = tunnel_pair(2).await;
        assert!(pool.add_tunnel(again).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_tunnel_is_removed() {
        let root = CancellationToken::new();
        let (pool, _rx) =
            TunnelPool::new(1, Arc::new(CountingManager::default()), &root, Timeouts::default());

        let (active, passive) = tunnel_pair(1).await;
        assert!(pool.add_tunnel(active).await.is_ok());
        drop(passive);

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.tunnel_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

//! Per-peer connection pool
//!
//! Demultiplexes blocks from the tunnel pool by connection ID and funnels
//! every connection's outgoing blocks into the tunnel pool's send queue.

use super::inbound::VirtualStream;
use super::ordering::run_ordering;
use super::outbound::run_outbound;
use super::shared::ConnectionCore;
use super::ConnectionError;
use crate::crypto::random_u32;
use crate::protocol::{
    Block, BlockType, Timeouts, CONNECTION_RECV_QUEUE_SIZE, CONNECTION_SEND_QUEUE_SIZE,
    ORDERED_QUEUE_SIZE,
};
use crate::transport::Dialer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

struct Entry {
    input: mpsc::Sender<Block>,
    token: CancellationToken,
    abort: CancellationToken,
}

struct PoolInner {
    connections: Mutex<HashMap<u32, Entry>>,
    send_tx: mpsc::Sender<Block>,
    dialer: Arc<dyn Dialer>,
    token: CancellationToken,
    timeouts: Timeouts,
}

/// The set of virtual connections for one peer
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool under `parent`, wired to a tunnel pool's send queue
    /// (`tunnel_tx`) and receive queue (`tunnel_rx`)
    pub fn new(
        tunnel_tx: mpsc::Sender<Block>,
        tunnel_rx: mpsc::Receiver<Block>,
        dialer: Arc<dyn Dialer>,
        parent: &CancellationToken,
        timeouts: Timeouts,
    ) -> Self {
        let token = parent.child_token();
        let (send_tx, send_rx) = mpsc::channel(CONNECTION_SEND_QUEUE_SIZE);

        let pool = Self {
            inner: Arc::new(PoolInner {
                connections: Mutex::new(HashMap::new()),
                send_tx,
                dialer,
                token: token.clone(),
                timeouts,
            }),
        };

        tokio::spawn(send_relay(send_rx, tunnel_tx, token));
        tokio::spawn(pool.clone().recv_relay(tunnel_rx));
        pool
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Open a connection to `address` on the remote side
    pub async fn new_inbound_connection(
        &self,
        address: &str,
    ) -> Result<VirtualStream, ConnectionError> {
        if self.inner.token.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        let (core, ordered) = {
            let mut connections = self.inner.connections.lock().await;
            let mut id = random_u32();
            while connections.contains_key(&id) {
                id = random_u32();
            }
            self.register(&mut connections, id)
        };

        debug!(connection_id = core.id(), address, "Opening connection");
        core.send_connect(address).await?;
        Ok(VirtualStream::new(core, ordered))
    }

    /// Route one block from the tunnel pool to its connection, creating an
    /// outbound connection for an unknown ID
    pub async fn dispatch(&self, block: Block) {
        let connection_id = block.connection_id();

        let target = {
            let mut connections = self.inner.connections.lock().await;
            match connections.get(&connection_id) {
                Some(entry) => Some((entry.input.clone(), entry.token.clone())),
                None if block.block_type() == BlockType::Disconnect => None,
                None => {
                    let (core, ordered) = self.register(&mut connections, connection_id);
                    info!(connection_id, "Remote opened connection");
                    tokio::spawn(run_outbound(core, ordered, self.inner.dialer.clone()));
                    connections
                        .get(&connection_id)
                        .map(|entry| (entry.input.clone(), entry.token.clone()))
                }
            }
        };

        let Some((input, token)) = target else {
            trace!(
                connection_id,
                block_id = block.block_id(),
                "Disconnect for unknown connection ignored"
            );
            return;
        };

        tokio::select! {
            _ = token.cancelled() => {
                trace!(connection_id, "connection closed, block dropped");
            }
            _ = input.send(block) => {}
        }
    }

    /// Remove and cancel a connection. Returns `false` if it was already
    /// gone.
    pub async fn remove_connection(&self, connection_id: u32) -> bool {
        match self.inner.connections.lock().await.remove(&connection_id) {
            Some(entry) => {
                entry.abort.cancel();
                entry.token.cancel();
                debug!(connection_id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Create the connection's core and start its ordering engine. The
    /// caller holds the map lock.
    fn register(
        &self,
        connections: &mut HashMap<u32, Entry>,
        connection_id: u32,
    ) -> (Arc<ConnectionCore>, mpsc::Receiver<Block>) {
        let core = Arc::new(ConnectionCore::new(
            connection_id,
            self.inner.send_tx.clone(),
            &self.inner.token,
        ));
        let token = core.token().clone();

        let (input_tx, input_rx) = mpsc::channel(CONNECTION_RECV_QUEUE_SIZE);
        let (ordered_tx, ordered_rx) = mpsc::channel(ORDERED_QUEUE_SIZE);
        tokio::spawn(run_ordering(
            core.clone(),
            input_rx,
            ordered_tx,
            self.inner.timeouts.block_wait,
        ));

        connections.insert(
            connection_id,
            Entry {
                input: input_tx,
                token: token.clone(),
                abort: core.abort_token().clone(),
            },
        );

        let pool = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            pool.remove_closed(connection_id).await;
        });

        (core, ordered_rx)
    }

    /// Remove the entry for `connection_id` only if it is the closed one; a
    /// newer connection may have reused the ID
    async fn remove_closed(&self, connection_id: u32) {
        let mut connections = self.inner.connections.lock().await;
        if connections
            .get(&connection_id)
            .is_some_and(|entry| entry.token.is_cancelled())
        {
            connections.remove(&connection_id);
            debug!(connection_id, "Connection removed");
        }
    }

    async fn recv_relay(self, mut tunnel_rx: mpsc::Receiver<Block>) {
        loop {
            let block = tokio::select! {
                _ = self.inner.token.cancelled() => break,
                block = tunnel_rx.recv() => block,
            };
            match block {
                Some(block) => self.dispatch(block).await,
                None => break,
            }
        }
        debug!("connection pool receive relay stopped");
    }
}

async fn send_relay(
    mut send_rx: mpsc::Receiver<Block>,
    tunnel_tx: mpsc::Sender<Block>,
    token: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            _ = token.cancelled() => break,
            block = send_rx.recv() => block,
        };
        let Some(block) = block else {
            break;
        };
        let sent = tokio::select! {
            _ = token.cancelled() => break,
            sent = tunnel_tx.send(block) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    debug!("connection pool send relay stopped");
}

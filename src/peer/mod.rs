//! Peers: one remote identity, its tunnel pool and its connection pool
//!
//! Provides:
//! - `ClientPeer`, which keeps a fixed number of tunnels to one server and
//!   opens virtual connections through them
//! - `PeerGroup` and `Server`, which accept tunnels and track one peer per
//!   remote peer ID

mod client;
mod server;

pub use client::ClientPeer;
pub use server::{PeerGroup, Server};

use crate::connection::ConnectionPool;
use crate::crypto::MasterKey;
use crate::protocol::Timeouts;
use crate::transport::Dialer;
use crate::tunnel::{PoolManager, TunnelPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Collaborators every peer is built from
#[derive(Clone)]
pub struct PeerOptions {
    /// Pre-shared key for every tunnel
    pub key: Arc<MasterKey>,
    /// Opens tunnel endpoints (client) and outbound targets (both sides)
    pub dialer: Arc<dyn Dialer>,
    pub timeouts: Timeouts,
}

/// Cancellation root binding one tunnel pool to one connection pool.
///
/// Cancelling the peer's token tears down both pools and every tunnel and
/// connection under them.
#[derive(Clone)]
pub struct Peer {
    id: u32,
    tunnel_pool: TunnelPool,
    connection_pool: ConnectionPool,
    token: CancellationToken,
}

impl Peer {
    pub(crate) fn new(
        id: u32,
        manager: Arc<dyn PoolManager>,
        token: CancellationToken,
        options: &PeerOptions,
    ) -> Self {
        let (tunnel_pool, recv_rx) = TunnelPool::new(id, manager, &token, options.timeouts);
        let connection_pool = ConnectionPool::new(
            tunnel_pool.sender(),
            recv_rx,
            options.dialer.clone(),
            &token,
            options.timeouts,
        );

        Self {
            id,
            tunnel_pool,
            connection_pool,
            token,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tunnel_pool(&self) -> &TunnelPool {
        &self.tunnel_pool
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

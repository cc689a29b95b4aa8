//! Tunnel pool policies
//!
//! The client keeps its pool at a fixed size by dialing; the server tears
//! a peer down once its pool has stayed empty for a grace period.

use super::{Tunnel, TunnelError, TunnelPool};
use crate::crypto::MasterKey;
use crate::protocol::Timeouts;
use crate::transport::Dialer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reacts to tunnel pool membership changes
#[async_trait]
pub trait PoolManager: Send + Sync {
    /// Called with the new tunnel count after every add or remove, while
    /// the pool's membership lock is held
    async fn on_change(&self, pool: &TunnelPool, count: usize);

    /// Called in its own task when the pool is created and after every
    /// removal
    async fn on_decrease(&self, pool: TunnelPool);
}

/// Keeps `target` tunnels open to one endpoint
pub struct ClientManager {
    fill_lock: Mutex<()>,
    target: usize,
    endpoint: String,
    key: Arc<MasterKey>,
    dialer: Arc<dyn Dialer>,
    timeouts: Timeouts,
}

impl ClientManager {
    pub fn new(
        target: usize,
        endpoint: impl Into<String>,
        key: Arc<MasterKey>,
        dialer: Arc<dyn Dialer>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            fill_lock: Mutex::new(()),
            target,
            endpoint: endpoint.into(),
            key,
            dialer,
            timeouts,
        }
    }

    async fn open_tunnel(&self, peer_id: u32) -> Result<Tunnel, TunnelError> {
        let raw = self.dialer.dial(&self.endpoint).await?;
        Tunnel::active(raw, self.key.clone(), peer_id, self.timeouts.handshake).await
    }
}

#[async_trait]
impl PoolManager for ClientManager {
    async fn on_change(&self, pool: &TunnelPool, count: usize) {
        debug!(peer_id = pool.peer_id(), count, target = self.target, "tunnel count changed");
    }

    async fn on_decrease(&self, pool: TunnelPool) {
        // One deficit-filling pass at a time
        let _guard = self.fill_lock.lock().await;
        let token = pool.token().clone();

        let deficit = self.target.saturating_sub(pool.tunnel_count().await);
        for _ in 0..deficit {
            loop {
                let attempt = tokio::select! {
                    _ = token.cancelled() => return,
                    attempt = self.open_tunnel(pool.peer_id()) => attempt,
                };

                match attempt {
                    Ok(tunnel) => {
                        if pool.add_tunnel(tunnel).await.is_err() {
                            return;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %self.endpoint,
                            error = %e,
                            "Failed to open tunnel, retrying in {:?}",
                            self.timeouts.dial_backoff
                        );
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(self.timeouts.dial_backoff) => {}
                        }
                    }
                }
            }
        }
    }
}

/// Removes an idle peer after its pool has been empty for `grace`
pub struct ServerManager {
    countdown: Arc<Mutex<Option<CancellationToken>>>,
    grace: Duration,
    remove_peer: Arc<dyn Fn() + Send + Sync>,
}

impl ServerManager {
    pub fn new(grace: Duration, remove_peer: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            countdown: Arc::new(Mutex::new(None)),
            grace,
            remove_peer: Arc::new(remove_peer),
        }
    }
}

#[async_trait]
impl PoolManager for ServerManager {
    async fn on_change(&self, pool: &TunnelPool, count: usize) {
        let mut countdown = self.countdown.lock().await;

        if count > 0 {
            if let Some(pending) = countdown.take() {
                debug!(peer_id = pool.peer_id(), "tunnel arrived, idle countdown cancelled");
                pending.cancel();
            }
            return;
        }

        if countdown.is_some() {
            return;
        }

        let pending = CancellationToken::new();
        *countdown = Some(pending.clone());

        let slot = self.countdown.clone();
        let pool_token = pool.token().clone();
        let remove_peer = self.remove_peer.clone();
        let grace = self.grace;
        let peer_id = pool.peer_id();
        debug!(peer_id, ?grace, "peer has no tunnels, idle countdown started");

        tokio::spawn(async move {
            tokio::select! {
                _ = pending.cancelled() => return,
                _ = pool_token.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }

            // A tunnel may have arrived while the timer was firing. Removing
            // under the slot lock orders this against `on_change`.
            let mut slot = slot.lock().await;
            if pending.is_cancelled() {
                return;
            }
            slot.take();

            info!(peer_id, "Peer idle for {:?}, removing", grace);
            remove_peer();
        });
    }

    async fn on_decrease(&self, _pool: TunnelPool) {}
}

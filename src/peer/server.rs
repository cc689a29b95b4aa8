//! Server side peer registry and accept loop

use super::{Peer, PeerOptions};
use crate::transport::BoxStream;
use crate::tunnel::{ServerManager, Tunnel, TunnelError};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct GroupInner {
    peers: Mutex<HashMap<u32, Peer>>,
    options: PeerOptions,
    token: CancellationToken,
}

/// Every peer currently known to a server, keyed by peer ID
#[derive(Clone)]
pub struct PeerGroup {
    inner: Arc<GroupInner>,
}

impl PeerGroup {
    pub fn new(options: PeerOptions, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                peers: Mutex::new(HashMap::new()),
                options,
                token: parent.child_token(),
            }),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    pub async fn get(&self, peer_id: u32) -> Option<Peer> {
        self.inner.peers.lock().await.get(&peer_id).cloned()
    }

    /// Run the passive handshake on a freshly accepted stream and add the
    /// tunnel to its peer, creating the peer on first sight. Returns the
    /// peer ID.
    pub async fn add_tunnel(&self, raw: BoxStream) -> Result<u32, TunnelError> {
        let options = &self.inner.options;
        let tunnel = Tunnel::passive(raw, options.key.clone(), options.timeouts.handshake).await?;
        self.join_peer(tunnel).await
    }

    /// Place a handshaken tunnel in its peer's pool. A peer that expires
    /// while the tunnel is being added is replaced by a fresh one.
    async fn join_peer(&self, mut tunnel: Tunnel) -> Result<u32, TunnelError> {
        loop {
            if self.inner.token.is_cancelled() {
                return Err(TunnelError::Closed);
            }
            let peer = self.get_or_create(tunnel.peer_id()).await;
            match peer.tunnel_pool().add_tunnel(tunnel).await {
                Ok(()) => return Ok(peer.id()),
                Err(returned) => {
                    debug!(peer_id = peer.id(), "Peer expired while adding tunnel, retrying");
                    tunnel = returned;
                }
            }
        }
    }

    async fn get_or_create(&self, peer_id: u32) -> Peer {
        let mut peers = self.inner.peers.lock().await;
        if let Some(peer) = peers.get(&peer_id) {
            if !peer.token().is_cancelled() {
                return peer.clone();
            }
        }

        let token = self.inner.token.child_token();
        let expire = token.clone();
        let manager = Arc::new(ServerManager::new(
            self.inner.options.timeouts.empty_peer_grace,
            move || expire.cancel(),
        ));
        let peer = Peer::new(peer_id, manager, token.clone(), &self.inner.options);
        peers.insert(peer_id, peer.clone());
        info!(peer_id, "New peer");

        let group = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            group.remove_closed(peer_id).await;
        });

        peer
    }

    /// Forget `peer_id` if its entry is the cancelled one
    async fn remove_closed(&self, peer_id: u32) {
        let mut peers = self.inner.peers.lock().await;
        if peers
            .get(&peer_id)
            .is_some_and(|peer| peer.token().is_cancelled())
        {
            peers.remove(&peer_id);
            info!(peer_id, "Peer removed");
        }
    }
}

/// Accepts raw TCP tunnels into a `PeerGroup`
#[derive(Clone)]
pub struct Server {
    group: PeerGroup,
}

impl Server {
    pub fn new(options: PeerOptions, parent: &CancellationToken) -> Self {
        Self {
            group: PeerGroup::new(options, parent),
        }
    }

    pub fn group(&self) -> &PeerGroup {
        &self.group
    }

    /// Accept until `shutdown` fires. Each handshake runs in its own task.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    debug!("New connection from {}", addr);
                    socket.set_nodelay(true).ok();

                    let group = self.group.clone();
                    tokio::spawn(async move {
                        match group.add_tunnel(Box::new(socket)).await {
                            Ok(peer_id) => debug!(peer_id, "Tunnel accepted from {}", addr),
                            Err(e) => warn!("Tunnel from {} rejected: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        Ok(())
    }
}

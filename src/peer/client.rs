//! Client side peer

use super::{Peer, PeerOptions};
use crate::connection::{ConnectionError, VirtualStream};
use crate::crypto::random_u32;
use crate::tunnel::ClientManager;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A peer that dials `tunnels` links to one server endpoint
#[derive(Clone)]
pub struct ClientPeer {
    peer: Peer,
}

impl ClientPeer {
    /// Start a peer under `parent`. Tunnels are dialed in the background.
    pub fn new(
        endpoint: &str,
        tunnels: usize,
        options: PeerOptions,
        parent: &CancellationToken,
    ) -> Self {
        let peer_id = random_u32();
        let manager = Arc::new(ClientManager::new(
            tunnels,
            endpoint,
            options.key.clone(),
            options.dialer.clone(),
            options.timeouts,
        ));

        info!(peer_id, endpoint, tunnels, "Starting client peer");
        Self {
            peer: Peer::new(peer_id, manager, parent.child_token(), &options),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Open a virtual connection to `address`, reached from the server
    pub async fn dial(&self, address: &str) -> Result<VirtualStream, ConnectionError> {
        self.peer
            .connection_pool()
            .new_inbound_connection(address)
            .await
    }

    /// Forward every connection accepted on `listener` to `dest` through
    /// the peer. Returns when the peer is closed.
    pub async fn serve_forward(&self, listener: TcpListener, dest: String) -> io::Result<()> {
        let token = self.peer.token().clone();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    debug!("Forwarding connection from {}", addr);
                    let client = self.clone();
                    let dest = dest.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.forward(socket, &dest).await {
                            debug!("Forwarded connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn forward(&self, mut socket: TcpStream, dest: &str) -> io::Result<()> {
        socket.set_nodelay(true).ok();
        let mut stream = self
            .dial(dest)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))?;

        let result = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
        stream.close().await;

        let (up, down) = result?;
        debug!(connection_id = stream.id(), up, down, "Forward finished");
        Ok(())
    }

    pub fn close(&self) {
        self.peer.close();
    }
}

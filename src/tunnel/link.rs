//! A single physical tunnel and its peer-ID handshake

use super::TunnelError;
use crate::crypto::{random_u32, MasterKey};
use crate::protocol::PEER_ID_LEN;
use crate::transport::{BoxStream, EncryptedStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

pub(crate) type TunnelReader = ReadHalf<EncryptedStream<BoxStream>>;
pub(crate) type TunnelWriter = WriteHalf<EncryptedStream<BoxStream>>;

/// One encrypted link that has completed its handshake.
///
/// A `Tunnel` only exists in the active state: a failed handshake never
/// produces one.
pub struct Tunnel {
    id: u32,
    peer_id: u32,
    stream: EncryptedStream<BoxStream>,
}

impl Tunnel {
    /// Client side: send our peer ID, then require the remote to echo it
    pub async fn active(
        raw: BoxStream,
        key: Arc<MasterKey>,
        peer_id: u32,
        handshake_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let mut stream = EncryptedStream::new(raw, key)?;

        let remote = tokio::time::timeout(handshake_timeout, async {
            stream.write_all(&peer_id.to_le_bytes()).await?;
            stream.flush().await?;
            read_peer_id(&mut stream).await
        })
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)??;

        if remote != peer_id {
            return Err(TunnelError::PeerIdMismatch {
                local: peer_id,
                remote,
            });
        }

        let tunnel = Self {
            id: random_u32(),
            peer_id,
            stream,
        };
        debug!(tunnel_id = tunnel.id, peer_id, "active handshake complete");
        Ok(tunnel)
    }

    /// Server side: learn the remote peer ID and echo it back
    pub async fn passive(
        raw: BoxStream,
        key: Arc<MasterKey>,
        handshake_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let mut stream = EncryptedStream::new(raw, key)?;

        let peer_id = tokio::time::timeout(handshake_timeout, async {
            let peer_id = read_peer_id(&mut stream).await?;
            stream.write_all(&peer_id.to_le_bytes()).await?;
            stream.flush().await?;
            Ok::<_, std::io::Error>(peer_id)
        })
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)??;

        let tunnel = Self {
            id: random_u32(),
            peer_id,
            stream,
        };
        debug!(tunnel_id = tunnel.id, peer_id, "passive handshake complete");
        Ok(tunnel)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub(crate) fn into_split(self) -> (TunnelReader, TunnelWriter) {
        tokio::io::split(self.stream)
    }
}

async fn read_peer_id(stream: &mut EncryptedStream<BoxStream>) -> std::io::Result<u32> {
    let mut buf = [0u8; PEER_ID_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

/// Two handshaken tunnels joined by an in-memory pipe
#[cfg(test)]
pub(crate) async fn tunnel_pair(peer_id: u32) -> (Tunnel, Tunnel) {
    use crate::crypto::CipherKind;

    let (a, b) = tokio::io::duplex(64 * 1024);
    let key = Arc::new(MasterKey::from_password(CipherKind::ChaCha20Poly1305, "test").unwrap());
    let timeout = Duration::from_secs(2);
    let (active, passive) = tokio::join!(
        Tunnel::active(Box::new(a), key.clone(), peer_id, timeout),
        Tunnel::passive(Box::new(b), key, timeout)
    );
    (active.unwrap(), passive.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;

    fn key() -> Arc<MasterKey> {
        Arc::new(MasterKey::from_password(CipherKind::Aes256Gcm, "test").unwrap())
    }

    #[tokio::test]
    async fn test_handshake_adopts_peer_id() {
        let (active, passive) = tunnel_pair(0xDEADBEEF).await;
        assert_eq!(active.peer_id(), 0xDEADBEEF);
        assert_eq!(passive.peer_id(), 0xDEADBEEF);
        assert_ne!(active.id(), passive.id());
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let (a, b) = tokio::io::duplex(1024);

        // A remote that answers with the wrong ID
        let remote = tokio::spawn(async move {
            let mut stream = EncryptedStream::new(Box::new(b) as BoxStream, key()).unwrap();
            let _ = read_peer_id(&mut stream).await.unwrap();
            stream.write_all(&7u32.to_le_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            stream
        });

        let result = Tunnel::active(Box::new(a), key(), 42, Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(TunnelError::PeerIdMismatch { local: 42, remote: 7 })
        ));
        drop(remote.await.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, _silent) = tokio::io::duplex(1024);

        let result = Tunnel::active(Box::new(a), key(), 42, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TunnelError::HandshakeTimeout)));

        let (b, _silent) = tokio::io::duplex(1024);
        let result = Tunnel::passive(Box::new(b), key(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TunnelError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_handshake_remote_closed() {
        let (a, b) = tokio::io::duplex(1024);
        drop(b);

        let result = Tunnel::passive(Box::new(a), key(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TunnelError::Io(_))));
    }
}

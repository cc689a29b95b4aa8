//! Tunnel layer - pooled encrypted physical links
//!
//! Provides:
//! - The peer-ID handshake over an encrypted stream
//! - Inbound / outbound relay loops with retry on failure
//! - The per-peer tunnel pool and its client / server managers

mod link;
mod manager;
mod pool;
mod relay;

pub use link::Tunnel;
pub use manager::{ClientManager, PoolManager, ServerManager};
pub use pool::TunnelPool;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Peer ID mismatch: local {local:#010x}, remote {remote:#010x}")]
    PeerIdMismatch { local: u32, remote: u32 },

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

//! # Burrow
//!
//! Multiplexes many TCP connections over a pool of encrypted tunnels
//! between a client and a server.
//!
//! ## Features
//!
//! - **Striping**: every connection's data is split into blocks spread over
//!   all live tunnels and reordered on arrival
//! - **Self-healing pools**: the client redials lost tunnels, the server
//!   keeps a peer alive for a grace period after its last tunnel drops
//! - **AEAD encryption** of every tunnel with a pre-shared key
//! - **Half-close** propagation end to end
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Peer                            │
//! │        (one remote identity, one lifetime)           │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Layer                     │
//! │   (virtual streams, block ordering, socket bridge)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │       (tunnel pool, relays, retry, pool policy)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │           (TCP dialer, AEAD encrypted stream)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod crypto;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use peer::{ClientPeer, PeerGroup, PeerOptions, Server};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Connection error: {0}")]
    Connection(#[from] connection::ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),
}

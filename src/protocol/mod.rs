//! Wire protocol definitions and constants
//!
//! Provides:
//! - Block framing (the atomic unit carried by every tunnel)
//! - A `tokio_util` codec for reading blocks off a byte stream
//! - Protocol-wide timing parameters

mod block;
mod codec;

pub use block::{Block, BlockType, ShutdownType, BLOCK_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use codec::BlockCodec;

use std::time::Duration;
use thiserror::Error;

/// Protocol (framing) errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown block type: {0}")]
    UnknownBlockType(u8),

    #[error("Payload too large: {0} > {1}")]
    PayloadTooLarge(usize, usize),

    #[error("Invalid disconnect payload: {0}")]
    InvalidDisconnect(String),

    #[error("Stream truncated: {0}")]
    Truncated(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First block ID of every direction of every connection
pub const BLOCK_ID_ORIGIN: u32 = 0;

/// Length of the peer ID exchanged during the tunnel handshake
pub const PEER_ID_LEN: usize = 4;

/// Maximum number of out-of-order blocks cached per connection
pub const MAX_CACHED_BLOCKS: usize = 1024;

/// Tunnel pool send / retry queue capacity
pub const TUNNEL_SEND_QUEUE_SIZE: usize = 48;

/// Tunnel pool receive queue capacity
pub const TUNNEL_RECV_QUEUE_SIZE: usize = 48;

/// Connection pool send queue capacity
pub const CONNECTION_SEND_QUEUE_SIZE: usize = 48;

/// Per-connection inbound (unordered) queue capacity
pub const CONNECTION_RECV_QUEUE_SIZE: usize = 24;

/// Per-connection ordered output queue capacity
pub const ORDERED_QUEUE_SIZE: usize = 24;

/// Read buffer used when relaying a real socket into blocks
pub const OUTBOUND_READ_BUFFER: usize = 16 * 1024;

/// Timing parameters shared by every component of a peer.
///
/// Built from [`crate::config::TuningConfig`] by the binaries; tests
/// construct it directly with short durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long the ordering engine tolerates an open gap before the
    /// connection is declared dead
    pub block_wait: Duration,
    /// Pause between failed tunnel dial / handshake attempts
    pub dial_backoff: Duration,
    /// A tunnel that cannot write one block within this limit is dead
    pub tunnel_write: Duration,
    /// Grace period before a server peer with no tunnels is destroyed
    pub empty_peer_grace: Duration,
    /// Limit for the peer ID exchange
    pub handshake: Duration,
    /// Limit for establishing a raw TCP connection
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            block_wait: Duration::from_secs(7),
            dial_backoff: Duration::from_secs(3),
            tunnel_write: Duration::from_secs(8),
            empty_peer_grace: Duration::from_secs(60),
            handshake: Duration::from_secs(30),
            connect: Duration::from_secs(10),
        }
    }
}

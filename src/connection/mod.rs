//! Virtual connections
//!
//! Provides:
//! - The shared connection core (block-ID allocation, half-close state)
//! - The ordering engine that turns reordered blocks into a byte stream
//! - `VirtualStream`, the application-facing end of a locally opened
//!   connection
//! - The bridge that dials and pipes remotely opened connections
//! - The per-peer connection pool

mod buffer;
mod inbound;
mod ordering;
mod outbound;
mod pool;
mod shared;
mod state;

pub use inbound::VirtualStream;
pub use ordering::BlockOrderer;
pub use pool::ConnectionPool;
pub use state::StreamState;

use thiserror::Error;

/// Connection layer errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection {connection_id:#010x} waited too long for block {block_id}")]
    OrderingTimeout { connection_id: u32, block_id: u32 },

    #[error("Reorder cache full ({0} blocks)")]
    CacheOverflow(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Dial failed: {0}")]
    Dial(#[from] crate::transport::TransportError),
}

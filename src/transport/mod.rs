//! Transport layer
//!
//! Provides:
//! - The `Dialer` seam for opening raw byte streams
//! - TCP dialing with connect timeout
//! - The AEAD stream wrapper applied to every tunnel

mod encrypted;
mod tcp;

pub use encrypted::{EncryptedStream, MAX_CHUNK_SIZE};
pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Any bidirectional byte stream a tunnel or outbound connection can run on
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Opens raw byte streams to `host:port` addresses
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<BoxStream, TransportError>;
}

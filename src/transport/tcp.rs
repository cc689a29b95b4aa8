//! Raw TCP dialing

use super::{BoxStream, Dialer, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Dials plain TCP connections
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        // Configure TCP options
        stream.set_nodelay(true).ok();
        trace!(addr, "TCP connected");

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = TcpDialer::default().dial(&addr.to_string()).await.unwrap();

        let msg = b"Hello, TCP!";
        stream.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpDialer::new(Duration::from_secs(2))
            .dial(&addr.to_string())
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}

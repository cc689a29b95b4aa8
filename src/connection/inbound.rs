//! Locally opened virtual connections

use super::buffer::ReadBuffer;
use super::shared::ConnectionCore;
use super::StreamState;
use crate::protocol::{Block, BlockType, ShutdownType, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::PollSender;
use tracing::trace;

/// Application end of a virtual connection.
///
/// Reads yield the remote's bytes in order; EOF once the remote half-closes,
/// `ConnectionReset` if the connection was torn down by a fault. Each write
/// becomes one Data block and never waits for delivery.
/// `shutdown` half-closes; `close` (or drop) closes both directions.
pub struct VirtualStream {
    core: Arc<ConnectionCore>,
    ordered: mpsc::Receiver<Block>,
    buffer: ReadBuffer,
    read_closed: bool,
    sender: PollSender<Block>,
    read_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
}

impl VirtualStream {
    pub(crate) fn new(core: Arc<ConnectionCore>, ordered: mpsc::Receiver<Block>) -> Self {
        let sender = PollSender::new(core.sender());
        Self {
            core,
            ordered,
            buffer: ReadBuffer::default(),
            read_closed: false,
            sender,
            read_timeout: None,
            read_deadline: None,
        }
    }

    /// Connection ID shared with the remote
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Bound how long a single read may wait for data. `None` waits forever.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.read_deadline = None;
    }

    /// Close both directions and tell the remote
    pub async fn close(&mut self) {
        if self.core.state() != StreamState::Closed {
            self.core.send_disconnect_once().await;
        }
        self.core.close();
    }

    fn on_block(&mut self, block: Block) {
        match block.block_type() {
            BlockType::Data => self.buffer.push(block.payload().clone()),
            BlockType::Disconnect => match block.shutdown_type() {
                Some(ShutdownType::WriteOnly) | Some(ShutdownType::Both) => {
                    self.read_closed = true;
                }
                _ => {}
            },
            BlockType::Connect => {
                trace!(connection_id = self.core.id(), "unexpected Connect ignored");
            }
        }
    }

    fn closed_read(&self) -> io::Result<()> {
        if self.core.is_reset() {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            ))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.buffer.is_empty() {
                let n = this.buffer.read(buf.initialize_unfilled());
                buf.advance(n);
                this.read_deadline = None;
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                this.read_deadline = None;
                return Poll::Ready(this.closed_read());
            }

            match this.ordered.poll_recv(cx) {
                Poll::Ready(Some(block)) => this.on_block(block),
                Poll::Ready(None) => this.read_closed = true,
                Poll::Pending => {
                    if let Some(limit) = this.read_timeout {
                        let deadline = this
                            .read_deadline
                            .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                        if deadline.as_mut().poll(cx).is_ready() {
                            this.read_deadline = None;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "read timed out",
                            )));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.core.state().can_send() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.sender.poll_reserve(cx))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        let n = buf.len().min(MAX_PAYLOAD_SIZE);
        let block = Block::data(
            this.core.id(),
            this.core.next_block_id(),
            Bytes::copy_from_slice(&buf[..n]),
        );
        this.sender
            .send_item(block)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.core.state().can_send() {
            return Poll::Ready(Ok(()));
        }

        ready!(this.sender.poll_reserve(cx))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let block = Block::disconnect(
            this.core.id(),
            this.core.next_block_id(),
            ShutdownType::WriteOnly,
        );
        this.sender
            .send_item(block)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        this.core.close_local();

        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        if self.core.state() != StreamState::Closed {
            self.core.disconnect_now();
        }
        self.core.close();
    }
}

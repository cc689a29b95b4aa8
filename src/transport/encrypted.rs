//! AEAD-encrypted byte stream
//!
//! Every direction begins with a random salt (one key length). The
//! session key for that direction is `HKDF(salt, master key)`, after which
//! data flows as `seal(len:u16 BE) ∥ seal(payload)` chunks.

use crate::crypto::{
    open_length, random_bytes, seal_length, Cipher, CryptoError, MasterKey, LENGTH_CHUNK_LEN,
    MAX_KEY_LEN, TAG_LEN,
};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::poll_read_buf;

/// Largest plaintext carried by one chunk
pub const MAX_CHUNK_SIZE: usize = 0x3FFF;

fn crypto_error(e: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

struct ReadHalfState {
    /// Set once the remote salt has arrived
    cipher: Option<Cipher>,
    /// Ciphertext not yet opened
    raw: BytesMut,
    /// Opened plaintext not yet handed to the caller
    plain: BytesMut,
    /// Length of the payload chunk we are waiting for
    pending_len: Option<usize>,
    eof: bool,
}

struct WriteHalfState {
    cipher: Cipher,
    /// Sealed bytes not yet accepted by the inner stream
    out: BytesMut,
}

/// Encrypts everything written and decrypts everything read over `S`
pub struct EncryptedStream<S> {
    inner: S,
    key: Arc<MasterKey>,
    reader: ReadHalfState,
    writer: WriteHalfState,
}

impl<S> EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a raw stream. The local salt is queued immediately and goes
    /// out with the first write or flush.
    pub fn new(inner: S, key: Arc<MasterKey>) -> Result<Self, CryptoError> {
        let mut salt = [0u8; MAX_KEY_LEN];
        let salt = &mut salt[..key.salt_len()];
        random_bytes(salt);
        let cipher = key.session_cipher(salt)?;

        let mut out = BytesMut::with_capacity(salt.len() + LENGTH_CHUNK_LEN);
        out.extend_from_slice(salt);

        Ok(Self {
            inner,
            key,
            reader: ReadHalfState {
                cipher: None,
                raw: BytesMut::with_capacity(MAX_CHUNK_SIZE + LENGTH_CHUNK_LEN + TAG_LEN),
                plain: BytesMut::new(),
                pending_len: None,
                eof: false,
            },
            writer: WriteHalfState { cipher, out },
        })
    }

    /// Try to advance the read state machine using buffered ciphertext.
    /// Returns `true` if progress was made.
    fn decode_step(&mut self) -> io::Result<bool> {
        let state = &mut self.reader;

        let cipher = match state.cipher.as_mut() {
            Some(cipher) => cipher,
            None => {
                let salt_len = self.key.salt_len();
                if state.raw.len() < salt_len {
                    return Ok(false);
                }
                let salt = state.raw.split_to(salt_len);
                state.cipher = Some(self.key.session_cipher(&salt).map_err(crypto_error)?);
                return Ok(true);
            }
        };

        match state.pending_len {
            None => {
                if state.raw.len() < LENGTH_CHUNK_LEN {
                    return Ok(false);
                }
                let len = open_length(cipher, &state.raw[..LENGTH_CHUNK_LEN]).map_err(crypto_error)?
                    as usize;
                state.raw.advance(LENGTH_CHUNK_LEN);
                if len == 0 || len > MAX_CHUNK_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid chunk length {}", len),
                    ));
                }
                state.pending_len = Some(len);
                Ok(true)
            }
            Some(len) => {
                if state.raw.len() < len + TAG_LEN {
                    return Ok(false);
                }
                let mut chunk = state.raw.split_to(len + TAG_LEN);
                let n = cipher.open_in_place(&mut chunk).map_err(crypto_error)?;
                chunk.truncate(n);
                state.plain.unsplit(chunk);
                state.pending_len = None;
                Ok(true)
            }
        }
    }

    fn poll_drain_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.writer.out.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.writer.out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.writer.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.reader.plain.is_empty() {
                let n = this.reader.plain.len().min(buf.remaining());
                buf.put_slice(&this.reader.plain[..n]);
                this.reader.plain.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.decode_step()? {
                continue;
            }

            if this.reader.eof {
                if this.reader.raw.is_empty() && this.reader.pending_len.is_none() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "encrypted stream ended mid-chunk",
                )));
            }

            this.reader.raw.reserve(MAX_CHUNK_SIZE);
            let n = ready!(poll_read_buf(
                Pin::new(&mut this.inner),
                cx,
                &mut this.reader.raw
            ))?;
            if n == 0 {
                this.reader.eof = true;
            }
        }
    }
}

impl<S> AsyncWrite for EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // At most one sealed chunk is buffered at a time
        ready!(this.poll_drain_out(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_CHUNK_SIZE);
        let writer = &mut this.writer;
        seal_length(&mut writer.cipher, n as u16, &mut writer.out).map_err(crypto_error)?;

        let mut chunk = BytesMut::with_capacity(n + TAG_LEN);
        chunk.extend_from_slice(&buf[..n]);
        writer.cipher.seal_in_place(&mut chunk).map_err(crypto_error)?;
        writer.out.extend_from_slice(&chunk);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_out(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_out(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

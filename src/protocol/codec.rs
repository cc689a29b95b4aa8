//! Block framing codec for `tokio_util::codec::FramedRead`

use super::{Block, ProtocolError};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Decodes a byte stream into [`Block`]s.
///
/// A stream that ends mid-header or mid-payload yields
/// [`ProtocolError::Truncated`], never a partial block.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockCodec;

impl BlockCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for BlockCodec {
    type Item = Block;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Block::decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(block) => Ok(Some(block)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated(format!(
                "{} bytes left at end of stream",
                src.len()
            ))),
        }
    }
}

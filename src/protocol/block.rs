//! Block encoding/decoding for the tunnel protocol
//!
//! Block format (all integers little-endian):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |       Connection ID (4B)          |
//! +--------+--------+--------+--------+--------+
//! |             Block ID (4B)                  |
//! +--------+--------+--------+--------+--------+
//! |              Length (4B)                   |
//! +--------+--------+--------+--------+--------+
//! |              Payload (Length bytes)        |
//! +--------+--------+--------+--------+--------+
//! ```

use super::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 1 + 4 + 4 + 4;

/// Maximum payload size (16 KB - header)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 - BLOCK_HEADER_SIZE;

/// Block types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// Open a connection; payload is the UTF-8 target address
    Connect = 0,
    /// Half or full close; payload is one [`ShutdownType`] byte
    Disconnect = 1,
    /// Connection data
    Data = 2,
}

impl TryFrom<u8> for BlockType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlockType::Connect),
            1 => Ok(BlockType::Disconnect),
            2 => Ok(BlockType::Data),
            _ => Err(ProtocolError::UnknownBlockType(value)),
        }
    }
}

/// Direction closed by a Disconnect block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShutdownType {
    /// The sender stopped reading: the receiver must stop writing
    ReadOnly = 0,
    /// The sender stopped writing: the receiver reads EOF
    WriteOnly = 1,
    /// Both directions closed
    Both = 2,
}

impl TryFrom<u8> for ShutdownType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ShutdownType::ReadOnly),
            1 => Ok(ShutdownType::WriteOnly),
            2 => Ok(ShutdownType::Both),
            _ => Err(ProtocolError::InvalidDisconnect(format!(
                "Unknown shutdown type: {}",
                value
            ))),
        }
    }
}

/// A protocol block. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    block_type: BlockType,
    connection_id: u32,
    block_id: u32,
    payload: Bytes,
}

impl Block {
    /// Create a connect block carrying the target address
    pub fn connect(connection_id: u32, block_id: u32, address: &str) -> Self {
        Self {
            block_type: BlockType::Connect,
            connection_id,
            block_id,
            payload: Bytes::copy_from_slice(address.as_bytes()),
        }
    }

    /// Create a disconnect block
    pub fn disconnect(connection_id: u32, block_id: u32, shutdown: ShutdownType) -> Self {
        Self {
            block_type: BlockType::Disconnect,
            connection_id,
            block_id,
            payload: Bytes::copy_from_slice(&[shutdown as u8]),
        }
    }

    /// Create a data block. The payload must not exceed [`MAX_PAYLOAD_SIZE`].
    pub fn data(connection_id: u32, block_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            block_type: BlockType::Data,
            connection_id,
            block_id,
            payload,
        }
    }

    /// Chunk `data` into data blocks with consecutive IDs starting at `first_block_id`
    pub fn data_blocks(connection_id: u32, first_block_id: u32, data: &[u8]) -> Vec<Self> {
        data.chunks(MAX_PAYLOAD_SIZE)
            .zip(first_block_id..)
            .map(|(chunk, block_id)| Self::data(connection_id, block_id, Bytes::copy_from_slice(chunk)))
            .collect()
    }

    /// Number of data blocks needed to carry `len` bytes
    pub fn data_block_count(len: usize) -> usize {
        len.div_ceil(MAX_PAYLOAD_SIZE)
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length as carried in the header
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Target address of a connect block
    pub fn address(&self) -> Option<&str> {
        match self.block_type {
            BlockType::Connect => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }

    /// Shutdown type of a disconnect block
    pub fn shutdown_type(&self) -> Option<ShutdownType> {
        match self.block_type {
            BlockType::Disconnect => self
                .payload
                .first()
                .and_then(|b| ShutdownType::try_from(*b).ok()),
            _ => None,
        }
    }

    /// Encoded size of this block on the wire
    pub fn encoded_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.payload.len()
    }

    /// Encode block to wire bytes
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.block_type as u8);
        buf.put_u32_le(self.connection_id);
        buf.put_u32_le(self.block_id);
        buf.put_u32_le(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a block from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole block is buffered; consumes nothing
    /// in that case.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        header.copy_from_slice(&buf[..BLOCK_HEADER_SIZE]);
        let (block_type, connection_id, block_id, length) = parse_header(&header)?;

        if buf.len() < BLOCK_HEADER_SIZE + length {
            buf.reserve(BLOCK_HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(BLOCK_HEADER_SIZE);
        let payload = buf.split_to(length).freeze();
        Self::from_parts(block_type, connection_id, block_id, payload).map(Some)
    }

    /// Read exactly one block from a byte stream: the fixed header first,
    /// then exactly `length` payload bytes.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; BLOCK_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| truncated("header", e))?;
        let (block_type, connection_id, block_id, length) = parse_header(&header)?;

        let mut payload = vec![0u8; length];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| truncated("payload", e))?;

        Self::from_parts(block_type, connection_id, block_id, Bytes::from(payload))
    }

    fn from_parts(
        block_type: BlockType,
        connection_id: u32,
        block_id: u32,
        payload: Bytes,
    ) -> Result<Self, ProtocolError> {
        if block_type == BlockType::Disconnect {
            ShutdownType::try_from(payload[0])?;
        }
        Ok(Self {
            block_type,
            connection_id,
            block_id,
            payload,
        })
    }
}

fn parse_header(
    header: &[u8; BLOCK_HEADER_SIZE],
) -> Result<(BlockType, u32, u32, usize), ProtocolError> {
    let mut cursor = &header[..];
    let block_type = BlockType::try_from(cursor.get_u8())?;
    let connection_id = cursor.get_u32_le();
    let block_id = cursor.get_u32_le();
    let length = cursor.get_u32_le() as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(length, MAX_PAYLOAD_SIZE));
    }
    if block_type == BlockType::Disconnect && length != 1 {
        return Err(ProtocolError::InvalidDisconnect(format!(
            "Payload length {} != 1",
            length
        )));
    }

    Ok((block_type, connection_id, block_id, length))
}

fn truncated(part: &str, err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated(format!("EOF inside block {}", part))
    } else {
        ProtocolError::Io(err)
    }
}

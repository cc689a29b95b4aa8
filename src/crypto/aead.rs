//! AEAD encryption/decryption utilities
//!
//! Provides ChaCha20-Poly1305 / AES-GCM encryption for the chunked
//! encrypted stream, including length prefix encryption.

use super::{CipherKind, CryptoError, NONCE_LEN, TAG_LEN};
use bytes::BytesMut;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey};

/// Size of a sealed length prefix on the wire
pub const LENGTH_CHUNK_LEN: usize = 2 + TAG_LEN;

/// AEAD cipher for one direction of a stream.
///
/// Nonces come from a monotonic counter, so the sealing and opening ends
/// must process chunks in the same order.
pub struct Cipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher from raw key bytes
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(kind.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: kind.key_len(),
                actual: key.len(),
            })?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
        })
    }

    /// Encrypt data in place, appending the auth tag
    pub fn seal_in_place(&mut self, buffer: &mut BytesMut) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce());

        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))
    }

    /// Decrypt data in place, verifying the auth tag.
    ///
    /// Returns the plaintext length; the plaintext occupies the front of
    /// `buffer`.
    pub fn open_in_place(&mut self, buffer: &mut [u8]) -> Result<usize, CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce());

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.len())
    }

    /// Generate the next nonce (monotonic counter)
    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        // Use counter in little-endian in the last 8 bytes
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        nonce
    }

    /// Get current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}

/// Seal a chunk length prefix (2 bytes) and append it to `out`
///
/// This prevents length-based fingerprinting
pub fn seal_length(cipher: &mut Cipher, length: u16, out: &mut BytesMut) -> Result<(), CryptoError> {
    let mut chunk = BytesMut::with_capacity(LENGTH_CHUNK_LEN);
    chunk.extend_from_slice(&length.to_be_bytes());
    cipher.seal_in_place(&mut chunk)?;
    out.extend_from_slice(&chunk);
    Ok(())
}

/// Open a sealed length prefix
pub fn open_length(cipher: &mut Cipher, sealed: &[u8]) -> Result<u16, CryptoError> {
    if sealed.len() != LENGTH_CHUNK_LEN {
        return Err(CryptoError::Decryption("invalid length chunk".to_string()));
    }
    let mut buffer = [0u8; LENGTH_CHUNK_LEN];
    buffer.copy_from_slice(sealed);

    let len = cipher.open_in_place(&mut buffer)?;
    if len != 2 {
        return Err(CryptoError::Decryption("invalid length".to_string()));
    }

    Ok(u16::from_be_bytes([buffer[0], buffer[1]]))
}

//! Cryptographic primitives for Burrow
//!
//! This module provides:
//! - ChaCha20-Poly1305 / AES-GCM AEAD encryption with counter nonces
//! - HKDF-SHA256 key derivation (password → master key, salt → session key)
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::{open_length, seal_length, Cipher, LENGTH_CHUNK_LEN};
pub use kdf::Hkdf;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum symmetric key length in bytes
pub const MAX_KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// HKDF label for deriving the master key from a password
const MASTER_KEY_INFO: &[u8] = b"burrow-master-key";

/// HKDF label for deriving a per-direction session key from a salt
const SESSION_KEY_INFO: &[u8] = b"burrow-session-key";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Supported AEAD constructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    /// Key (and salt) length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::ChaCha20Poly1305 | CipherKind::Aes256Gcm => 32,
        }
    }

    pub(crate) fn algorithm(&self) -> &'static ring::aead::Algorithm {
        match self {
            CipherKind::ChaCha20Poly1305 => &ring::aead::CHACHA20_POLY1305,
            CipherKind::Aes128Gcm => &ring::aead::AES_128_GCM,
            CipherKind::Aes256Gcm => &ring::aead::AES_256_GCM,
        }
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20-ietf-poly1305" | "aead_chacha20_poly1305" => {
                Ok(CipherKind::ChaCha20Poly1305)
            }
            "aes-128-gcm" | "aead_aes_128_gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Ok(CipherKind::Aes256Gcm),
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
        };
        f.write_str(name)
    }
}

/// Pre-shared key used to encrypt every tunnel between two endpoints
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    kind: CipherKind,
    key: Vec<u8>,
}

impl MasterKey {
    /// Derive the master key from a password
    pub fn from_password(kind: CipherKind, password: &str) -> Result<Self, CryptoError> {
        let mut key = vec![0u8; kind.key_len()];
        Hkdf::new(None, password.as_bytes()).expand(MASTER_KEY_INFO, &mut key)?;
        Ok(Self { kind, key })
    }

    /// Use raw key bytes as the master key
    pub fn from_bytes(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != kind.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: kind.key_len(),
                actual: key.len(),
            });
        }
        Ok(Self {
            kind,
            key: key.to_vec(),
        })
    }

    /// Decode a base64 raw key
    pub fn from_base64(kind: CipherKind, encoded: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        Self::from_bytes(kind, &key)
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Salt length expected at the start of every encrypted direction
    pub fn salt_len(&self) -> usize {
        self.kind.key_len()
    }

    /// Build the cipher for one direction of one stream
    pub fn session_cipher(&self, salt: &[u8]) -> Result<Cipher, CryptoError> {
        let mut subkey = [0u8; MAX_KEY_LEN];
        let subkey = &mut subkey[..self.kind.key_len()];
        Hkdf::new(Some(salt), &self.key).expand(SESSION_KEY_INFO, subkey)?;
        Cipher::new(self.kind, subkey)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random 32-bit identifier
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf);
    u32::from_le_bytes(buf)
}

//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving the master key from a password and
//! per-direction session keys from a random salt

use super::CryptoError;
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        let prk = salt.extract(ikm);

        Self { prk }
    }

    /// Derive a key of `output.len()` bytes from the PRK
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(())
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels_and_salts() {
        let ikm = b"input keying material";
        let hkdf = Hkdf::new(Some(b"salt"), ikm);

        let mut key1 = [0u8; 32];
        let mut key2 = [0u8; 32];
        let mut key1_again = [0u8; 32];
        hkdf.expand(b"label1", &mut key1).unwrap();
        hkdf.expand(b"label2", &mut key2).unwrap();
        hkdf.expand(b"label1", &mut key1_again).unwrap();

        assert_ne!(key1, key2);
        assert_eq!(key1, key1_again);

        let mut other_salt = [0u8; 32];
        Hkdf::new(Some(b"pepper"), ikm)
            .expand(b"label1", &mut other_salt)
            .unwrap();
        assert_ne!(key1, other_salt);
    }

    #[test]
    fn test_hkdf_short_output() {
        let mut key = [0u8; 16];
        Hkdf::new(None, b"test input").expand(b"test", &mut key).unwrap();
        assert_ne!(key, [0u8; 16]);
    }
}

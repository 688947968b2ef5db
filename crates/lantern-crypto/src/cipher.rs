//! Per-Session AEAD Cipher Suites
//!
//! Data packets are sealed with either AES-256-GCM or ChaCha20-Poly1305.
//! The nonce is assembled from the packet's 8-byte send counter: four zero
//! bytes followed by the counter, big-endian for AES and little-endian for
//! ChaCha20-Poly1305. The suite must match on both peers; a mismatch leaves
//! both sides unable to authenticate anything.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// The AEAD algorithm used for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// AES-256-GCM, big-endian nonce assembly
    Aes,
    /// ChaCha20-Poly1305, little-endian nonce assembly
    ChaChaPoly,
}

impl CipherSuite {
    /// Parse a configured cipher name
    pub fn from_name(name: &str) -> CryptoResult<Self> {
        match name {
            "aes" => Ok(Self::Aes),
            "chachapoly" => Ok(Self::ChaChaPoly),
            other => Err(CryptoError::UnknownCipher(other.to_string())),
        }
    }

    /// The configured name of this suite
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes => "aes",
            Self::ChaChaPoly => "chachapoly",
        }
    }

    /// Assemble the 12-byte nonce for a packet counter
    pub fn nonce(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        match self {
            Self::Aes => nonce[4..].copy_from_slice(&counter.to_be_bytes()),
            Self::ChaChaPoly => nonce[4..].copy_from_slice(&counter.to_le_bytes()),
        }
        nonce
    }
}

/// A 256-bit symmetric key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

/// One direction of a session's cipher state
pub struct CipherState {
    suite: CipherSuite,
    key: SymmetricKey,
}

impl CipherState {
    /// Create cipher state for one direction
    pub fn new(suite: CipherSuite, key: SymmetricKey) -> Self {
        Self { suite, key }
    }

    /// The suite this state was built with
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Seal a payload under the packet counter, authenticating `aad`
    pub fn encrypt(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = self.suite.nonce(counter);
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        match self.suite {
            CipherSuite::Aes => {
                let cipher = Aes256Gcm::new_from_slice(self.key.as_bytes())
                    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| CryptoError::EncryptionFailed("AES-GCM seal failed".into()))
            }
            CipherSuite::ChaChaPoly => {
                let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes())
                    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| {
                        CryptoError::EncryptionFailed("ChaCha20-Poly1305 seal failed".into())
                    })
            }
        }
    }

    /// Open a payload sealed under the packet counter and `aad`
    pub fn decrypt(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < AUTH_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let nonce = self.suite.nonce(counter);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        match self.suite {
            CipherSuite::Aes => {
                let cipher = Aes256Gcm::new_from_slice(self.key.as_bytes())
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| CryptoError::DecryptionFailed)
            }
            CipherSuite::ChaChaPoly => {
                let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes())
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| CryptoError::DecryptionFailed)
            }
        }
    }
}

/// Both directions of an established session
pub struct SessionCrypto {
    /// State for sealing outbound packets
    pub send: CipherState,
    /// State for opening inbound packets
    pub recv: CipherState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_names() {
        assert_eq!(CipherSuite::from_name("aes").unwrap(), CipherSuite::Aes);
        assert_eq!(
            CipherSuite::from_name("chachapoly").unwrap(),
            CipherSuite::ChaChaPoly
        );
        assert!(CipherSuite::from_name("des").is_err());
    }

    #[test]
    fn test_nonce_assembly_endianness() {
        let counter = 0x0102030405060708u64;

        let aes = CipherSuite::Aes.nonce(counter);
        assert_eq!(&aes[..4], &[0, 0, 0, 0]);
        assert_eq!(&aes[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let cha = CipherSuite::ChaChaPoly.nonce(counter);
        assert_eq!(&cha[..4], &[0, 0, 0, 0]);
        assert_eq!(&cha[4..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for suite in [CipherSuite::Aes, CipherSuite::ChaChaPoly] {
            let key = SymmetricKey::generate();
            let state = CipherState::new(suite, key);

            let ct = state.encrypt(7, b"header", b"inner packet").unwrap();
            assert_eq!(ct.len(), b"inner packet".len() + AUTH_TAG_SIZE);

            let pt = state.decrypt(7, b"header", &ct).unwrap();
            assert_eq!(pt, b"inner packet");
        }
    }

    #[test]
    fn test_wrong_counter_fails() {
        let state = CipherState::new(CipherSuite::Aes, SymmetricKey::generate());
        let ct = state.encrypt(1, b"hdr", b"data").unwrap();
        assert!(state.decrypt(2, b"hdr", &ct).is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let state = CipherState::new(CipherSuite::ChaChaPoly, SymmetricKey::generate());
        let ct = state.encrypt(1, b"hdr", b"data").unwrap();
        assert!(state.decrypt(1, b"other", &ct).is_err());
    }

    #[test]
    fn test_suite_mismatch_never_authenticates() {
        let key = SymmetricKey::generate();
        let aes = CipherState::new(CipherSuite::Aes, key.clone());
        let cha = CipherState::new(CipherSuite::ChaChaPoly, key);

        let ct = aes.encrypt(42, b"hdr", b"data").unwrap();
        assert!(cha.decrypt(42, b"hdr", &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let state = CipherState::new(CipherSuite::Aes, SymmetricKey::generate());
        let mut ct = state.encrypt(1, b"hdr", b"data").unwrap();
        ct[0] ^= 0xFF;
        assert!(state.decrypt(1, b"hdr", &ct).is_err());
    }
}

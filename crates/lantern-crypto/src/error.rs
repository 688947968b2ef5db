//! Crypto errors

use thiserror::Error;

/// Errors produced by cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption or authentication failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Key material had the wrong length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Handshake message failed validation
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake state machine was driven out of order
    #[error("Invalid handshake state: {0}")]
    InvalidState(&'static str),

    /// Unknown cipher suite name
    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

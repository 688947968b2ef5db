//! Lantern Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the Lantern mesh:
//! - Key exchange (X25519)
//! - Per-session AEAD cipher suites (AES-256-GCM, ChaCha20-Poly1305)
//! - The two-message authenticated handshake
//! - Counter replay protection
//! - Key derivation (HKDF-SHA256)

pub mod cipher;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod replay;

pub use cipher::{CipherState, CipherSuite, SessionCrypto, SymmetricKey};
pub use error::CryptoError;
pub use handshake::{HandshakeInit, HandshakeResponse, InitiatorState, ResponderState};
pub use keys::{PrivateKey, PublicKey, SessionKeys, SharedSecret};
pub use replay::ReplayWindow;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cipher::*;
    pub use crate::error::*;
    pub use crate::handshake::*;
    pub use crate::keys::*;
    pub use crate::replay::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// AEAD key size (both suites)
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// AEAD nonce size (both suites)
    pub const NONCE_SIZE: usize = 12;

    /// AEAD authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Keyed MAC size on handshake messages
    pub const MAC_SIZE: usize = 16;

    /// Replay window width in packets
    pub const REPLAY_WINDOW_SIZE: usize = 1024;

    /// Acceptable clock skew on handshake timestamps, in seconds
    pub const HANDSHAKE_TIMESTAMP_SKEW: u64 = 60;

    /// Acceptable age of a handshake timestamp, in seconds
    pub const HANDSHAKE_TIMESTAMP_AGE: u64 = 120;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_session_flow() {
        // Two nodes establish a session and exchange a packet each way.
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();

        let mut alice = InitiatorState::new(&alice_key, 11, b"alice-cert".to_vec());
        let msg1 = alice.message_1();

        let (msg2, bob_session) = ResponderState::respond(
            &bob_key,
            &msg1,
            &alice_key.public_key(),
            22,
            b"bob-cert".to_vec(),
            CipherSuite::ChaChaPoly,
        )
        .expect("responder failed");

        let (alice_session, bob_cert) = alice
            .finalize(&msg2, &bob_key.public_key(), CipherSuite::ChaChaPoly)
            .expect("initiator failed");
        assert_eq!(bob_cert, b"bob-cert");

        let ct = alice_session.send.encrypt(1, b"hdr", b"ping").unwrap();
        let pt = bob_session.recv.decrypt(1, b"hdr", &ct).unwrap();
        assert_eq!(pt, b"ping");

        let ct = bob_session.send.encrypt(1, b"hdr", b"pong").unwrap();
        let pt = alice_session.recv.decrypt(1, b"hdr", &ct).unwrap();
        assert_eq!(pt, b"pong");
    }
}

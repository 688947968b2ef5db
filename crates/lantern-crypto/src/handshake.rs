//! Authenticated Session Handshake
//!
//! Two-message key exchange in the Noise IX shape: the initiator does not
//! need the responder's static key up front, it is discovered from the
//! certificate carried in message 2. Key material mixes three X25519
//! exchanges (see [`session_keys`]) so each side proves possession of its
//! static key. Certificates are opaque byte blobs at this layer; the
//! caller decodes and validates them.
//!
//! Message 1 is validated only by its timestamp window and the caller's
//! certificate checks. Mutual cryptographic authentication lands with
//! message 2's MAC and the first data packet.

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherState, CipherSuite, SessionCrypto, SymmetricKey};
use crate::constants::{HANDSHAKE_TIMESTAMP_AGE, HANDSHAKE_TIMESTAMP_SKEW, MAC_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{session_keys, PrivateKey, PublicKey, SharedSecret};

/// Handshake wire version
pub const HANDSHAKE_VERSION: u8 = 1;

const CERT_KEY_INFO: &[u8] = b"lantern:msg2-cert";

/// Handshake message 1, initiator to responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// Handshake wire version
    pub version: u8,
    /// Initiator's local session index, echoed back in data packets
    pub sender_index: u32,
    /// Initiator's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Unix timestamp, bounds replayed initiations
    pub timestamp: u64,
    /// Initiator's certificate, opaque at this layer
    pub certificate: Vec<u8>,
}

/// Handshake message 2, responder to initiator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Responder's local session index
    pub sender_index: u32,
    /// Responder's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Responder's certificate, sealed under the ephemeral-ephemeral secret
    pub encrypted_certificate: Vec<u8>,
    /// Keyed MAC over the message, proves key possession
    pub mac: [u8; MAC_SIZE],
}

impl HandshakeInit {
    /// Reject initiations with timestamps outside the acceptance window
    pub fn validate_timestamp(&self, now: u64) -> CryptoResult<()> {
        if self.timestamp > now + HANDSHAKE_TIMESTAMP_SKEW
            || self.timestamp < now.saturating_sub(HANDSHAKE_TIMESTAMP_AGE)
        {
            return Err(CryptoError::HandshakeFailed("timestamp out of range".into()));
        }
        Ok(())
    }
}

/// Initiator side of an in-flight handshake
pub struct InitiatorState {
    static_key: PrivateKey,
    ephemeral: PrivateKey,
    local_index: u32,
    certificate: Vec<u8>,
    timestamp: u64,
    complete: bool,
}

impl InitiatorState {
    /// Start a handshake toward an unknown responder
    pub fn new(static_key: &PrivateKey, local_index: u32, certificate: Vec<u8>) -> Self {
        Self {
            static_key: static_key.clone(),
            ephemeral: PrivateKey::generate(),
            local_index,
            certificate,
            timestamp: current_timestamp(),
            complete: false,
        }
    }

    /// Build message 1. Safe to call again for retries; the ephemeral key
    /// and timestamp are fixed for the lifetime of this state.
    pub fn message_1(&self) -> HandshakeInit {
        HandshakeInit {
            version: HANDSHAKE_VERSION,
            sender_index: self.local_index,
            ephemeral: self.ephemeral.public_key().to_bytes(),
            timestamp: self.timestamp,
            certificate: self.certificate.clone(),
        }
    }

    /// Decrypt the responder's certificate from message 2 without touching
    /// session state, so the caller can validate it first.
    pub fn read_certificate(&self, response: &HandshakeResponse) -> CryptoResult<Vec<u8>> {
        let responder_ephemeral = PublicKey::from_bytes(response.ephemeral);
        let ee = self.ephemeral.shared_with(&responder_ephemeral);
        open_certificate(&ee, &response.ephemeral, &response.encrypted_certificate)
    }

    /// Verify message 2 and derive the session cipher state.
    /// `responder_static` is the key the caller extracted from the
    /// validated certificate.
    pub fn finalize(
        &mut self,
        response: &HandshakeResponse,
        responder_static: &PublicKey,
        suite: CipherSuite,
    ) -> CryptoResult<(SessionCrypto, Vec<u8>)> {
        if self.complete {
            return Err(CryptoError::InvalidState("handshake already complete"));
        }

        let responder_ephemeral = PublicKey::from_bytes(response.ephemeral);
        let keys = session_keys(
            &self.static_key,
            &self.ephemeral,
            responder_static,
            &responder_ephemeral,
            true,
        );

        let expected = response_mac(
            &keys.mac_key,
            response.sender_index,
            &response.ephemeral,
            &response.encrypted_certificate,
        );
        if expected != response.mac {
            return Err(CryptoError::HandshakeFailed("MAC verification failed".into()));
        }

        let ee = self.ephemeral.shared_with(&responder_ephemeral);
        let certificate =
            open_certificate(&ee, &response.ephemeral, &response.encrypted_certificate)?;

        self.complete = true;
        Ok((
            SessionCrypto {
                send: CipherState::new(suite, SymmetricKey::from_bytes(keys.initiator_key)),
                recv: CipherState::new(suite, SymmetricKey::from_bytes(keys.responder_key)),
            },
            certificate,
        ))
    }

    /// The local index this handshake reserved
    pub fn local_index(&self) -> u32 {
        self.local_index
    }
}

/// Responder side: consumes message 1 and produces message 2 plus the
/// session cipher state in one step.
pub struct ResponderState;

impl ResponderState {
    /// Answer an initiation. `initiator_static` is the key the caller
    /// extracted from the validated message 1 certificate.
    pub fn respond(
        static_key: &PrivateKey,
        init: &HandshakeInit,
        initiator_static: &PublicKey,
        local_index: u32,
        certificate: Vec<u8>,
        suite: CipherSuite,
    ) -> CryptoResult<(HandshakeResponse, SessionCrypto)> {
        if init.version != HANDSHAKE_VERSION {
            return Err(CryptoError::HandshakeFailed(format!(
                "version mismatch: expected {}, got {}",
                HANDSHAKE_VERSION, init.version
            )));
        }

        let ephemeral = PrivateKey::generate();
        let initiator_ephemeral = PublicKey::from_bytes(init.ephemeral);

        let keys = session_keys(
            static_key,
            &ephemeral,
            initiator_static,
            &initiator_ephemeral,
            false,
        );

        let ephemeral_bytes = ephemeral.public_key().to_bytes();
        let ee = ephemeral.shared_with(&initiator_ephemeral);
        let encrypted_certificate = seal_certificate(&ee, &ephemeral_bytes, &certificate)?;
        let mac = response_mac(&keys.mac_key, local_index, &ephemeral_bytes, &encrypted_certificate);

        Ok((
            HandshakeResponse {
                sender_index: local_index,
                ephemeral: ephemeral_bytes,
                encrypted_certificate,
                mac,
            },
            SessionCrypto {
                send: CipherState::new(suite, SymmetricKey::from_bytes(keys.responder_key)),
                recv: CipherState::new(suite, SymmetricKey::from_bytes(keys.initiator_key)),
            },
        ))
    }
}

/// The message 2 certificate is always sealed with ChaCha20-Poly1305 keyed
/// from the ephemeral-ephemeral secret, independent of the session suite,
/// so the initiator can open it before the suites are known to agree.
fn certificate_cipher(ee: &SharedSecret) -> CipherState {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hkdf = Hkdf::<Sha256>::new(None, ee.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(CERT_KEY_INFO, &mut key).expect("HKDF expand failed");
    CipherState::new(CipherSuite::ChaChaPoly, SymmetricKey::from_bytes(key))
}

fn seal_certificate(ee: &SharedSecret, aad: &[u8], certificate: &[u8]) -> CryptoResult<Vec<u8>> {
    certificate_cipher(ee).encrypt(1, aad, certificate)
}

fn open_certificate(ee: &SharedSecret, aad: &[u8], sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    certificate_cipher(ee)
        .decrypt(1, aad, sealed)
        .map_err(|_| CryptoError::HandshakeFailed("certificate decryption failed".into()))
}

/// Keyed BLAKE3 MAC over message 2
fn response_mac(
    mac_key: &[u8; 32],
    sender_index: u32,
    ephemeral: &[u8; 32],
    encrypted_certificate: &[u8],
) -> [u8; MAC_SIZE] {
    let mut hasher = blake3::Hasher::new_keyed(mac_key);
    hasher.update(&sender_index.to_be_bytes());
    hasher.update(ephemeral);
    hasher.update(encrypted_certificate);
    let hash = hasher.finalize();
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&hash.as_bytes()[..MAC_SIZE]);
    mac
}

/// Current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_handshake(suite: CipherSuite) -> (SessionCrypto, SessionCrypto) {
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();

        let mut alice = InitiatorState::new(&alice_key, 1, b"cert-a".to_vec());
        let msg1 = alice.message_1();
        msg1.validate_timestamp(current_timestamp()).unwrap();

        let (msg2, bob_session) = ResponderState::respond(
            &bob_key,
            &msg1,
            &alice_key.public_key(),
            2,
            b"cert-b".to_vec(),
            suite,
        )
        .unwrap();

        assert_eq!(alice.read_certificate(&msg2).unwrap(), b"cert-b");

        let (alice_session, cert) = alice.finalize(&msg2, &bob_key.public_key(), suite).unwrap();
        assert_eq!(cert, b"cert-b");

        (alice_session, bob_session)
    }

    #[test]
    fn test_full_handshake_both_suites() {
        for suite in [CipherSuite::Aes, CipherSuite::ChaChaPoly] {
            let (alice, bob) = complete_handshake(suite);

            let ct = alice.send.encrypt(1, b"h", b"hello").unwrap();
            assert_eq!(bob.recv.decrypt(1, b"h", &ct).unwrap(), b"hello");

            let ct = bob.send.encrypt(1, b"h", b"hi").unwrap();
            assert_eq!(alice.recv.decrypt(1, b"h", &ct).unwrap(), b"hi");
        }
    }

    #[test]
    fn test_message_1_is_stable_across_retries() {
        let key = PrivateKey::generate();
        let alice = InitiatorState::new(&key, 9, b"cert".to_vec());

        let a = alice.message_1();
        let b = alice.message_1();
        assert_eq!(a.ephemeral, b.ephemeral);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.sender_index, 9);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let key = PrivateKey::generate();
        let mut init = InitiatorState::new(&key, 1, vec![]).message_1();
        init.timestamp = current_timestamp() - 300;

        assert!(init.validate_timestamp(current_timestamp()).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();

        let mut msg1 = InitiatorState::new(&alice_key, 1, vec![]).message_1();
        msg1.version = 2;

        let result = ResponderState::respond(
            &bob_key,
            &msg1,
            &alice_key.public_key(),
            2,
            vec![],
            CipherSuite::Aes,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_response_mac_rejected() {
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();

        let mut alice = InitiatorState::new(&alice_key, 1, vec![]);
        let msg1 = alice.message_1();

        let (mut msg2, _) = ResponderState::respond(
            &bob_key,
            &msg1,
            &alice_key.public_key(),
            2,
            b"cert".to_vec(),
            CipherSuite::Aes,
        )
        .unwrap();
        msg2.mac[0] ^= 0xFF;

        assert!(alice
            .finalize(&msg2, &bob_key.public_key(), CipherSuite::Aes)
            .is_err());
    }

    #[test]
    fn test_wrong_responder_static_rejected() {
        // A responder that does not hold the static key named in its
        // certificate cannot produce a MAC the initiator accepts.
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();
        let mallory_key = PrivateKey::generate();

        let mut alice = InitiatorState::new(&alice_key, 1, vec![]);
        let msg1 = alice.message_1();

        let (msg2, _) = ResponderState::respond(
            &mallory_key,
            &msg1,
            &alice_key.public_key(),
            2,
            b"cert".to_vec(),
            CipherSuite::Aes,
        )
        .unwrap();

        // Alice believes she is talking to bob
        assert!(alice
            .finalize(&msg2, &bob_key.public_key(), CipherSuite::Aes)
            .is_err());
    }
}

//! Handshake Key Material
//!
//! A node holds one long-lived X25519 key that its certificate binds to;
//! every handshake adds a throwaway ephemeral key. Both sides mix three
//! exchanges (ephemeral-ephemeral, then each static against the other's
//! ephemeral) through HKDF-SHA256 into a pair of directional session keys
//! plus the MAC key for message 2. The raw DH outputs never leave this
//! module.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as CurvePoint, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const HANDSHAKE_SALT: &[u8] = b"lantern:handshake";
const SESSION_INFO: &[u8] = b"lantern:session";

/// An X25519 scalar owned by this node. The same type serves as the
/// static identity key and as per-handshake ephemerals; `StaticSecret`
/// zeroizes itself on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

/// The peer-visible half of a key, as carried in certificates and
/// handshake messages
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

/// One raw DH output. Only the certificate seal consumes this directly;
/// session keys go through [`session_keys`].
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

/// What a completed handshake derives: one key per direction and the
/// key for authenticating message 2. Both roles compute identical values.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Protects traffic flowing initiator -> responder
    pub initiator_key: [u8; 32],
    /// Protects traffic flowing responder -> initiator
    pub responder_key: [u8; 32],
    /// Keys the MAC on handshake message 2
    pub mac_key: [u8; 32],
}

impl PrivateKey {
    /// Generate a fresh key from the system RNG
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Load a stored identity key
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Export for storage; handle with care
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(CurvePoint::from(&self.0).to_bytes())
    }

    /// Diffie-Hellman against a peer's public key
    pub fn shared_with(&self, peer: &PublicKey) -> SharedSecret {
        let point = CurvePoint::from(peer.0);
        SharedSecret(self.0.diffie_hellman(&point).to_bytes())
    }
}

impl PublicKey {
    /// Reconstruct from the wire or a certificate
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The wire form
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl SharedSecret {
    /// The raw secret, for deriving the certificate seal key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Mix the handshake's three exchanges into the session keys.
///
/// `initiator` decides which of our keys faces which of the peer's, so
/// both sides arrive at the same (ee, es, se) ordering: es is always the
/// initiator's ephemeral against the responder's static, se the reverse.
pub fn session_keys(
    local_static: &PrivateKey,
    local_ephemeral: &PrivateKey,
    peer_static: &PublicKey,
    peer_ephemeral: &PublicKey,
    initiator: bool,
) -> SessionKeys {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let ee = local_ephemeral.shared_with(peer_ephemeral);
    let (es, se) = if initiator {
        (
            local_ephemeral.shared_with(peer_static),
            local_static.shared_with(peer_ephemeral),
        )
    } else {
        (
            local_static.shared_with(peer_ephemeral),
            local_ephemeral.shared_with(peer_static),
        )
    };

    let mut input = [0u8; 96];
    input[..32].copy_from_slice(ee.as_bytes());
    input[32..64].copy_from_slice(es.as_bytes());
    input[64..].copy_from_slice(se.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(HANDSHAKE_SALT), &input);
    input.zeroize();

    let mut keys = SessionKeys {
        initiator_key: [0u8; 32],
        responder_key: [0u8; 32],
        mac_key: [0u8; 32],
    };
    for (label, out) in [
        (&b"initiator"[..], &mut keys.initiator_key),
        (&b"responder"[..], &mut keys.responder_key),
        (&b"mac"[..], &mut keys.mac_key),
    ] {
        let mut info = SESSION_INFO.to_vec();
        info.push(b':');
        info.extend_from_slice(label);
        hkdf.expand(&info, out).expect("HKDF expand failed");
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_roles_derive_the_same_keys() {
        let alice_static = PrivateKey::generate();
        let alice_eph = PrivateKey::generate();
        let bob_static = PrivateKey::generate();
        let bob_eph = PrivateKey::generate();

        let alice = session_keys(
            &alice_static,
            &alice_eph,
            &bob_static.public_key(),
            &bob_eph.public_key(),
            true,
        );
        let bob = session_keys(
            &bob_static,
            &bob_eph,
            &alice_static.public_key(),
            &alice_eph.public_key(),
            false,
        );

        assert_eq!(alice.initiator_key, bob.initiator_key);
        assert_eq!(alice.responder_key, bob.responder_key);
        assert_eq!(alice.mac_key, bob.mac_key);
    }

    #[test]
    fn test_directions_and_mac_are_distinct() {
        let keys = session_keys(
            &PrivateKey::generate(),
            &PrivateKey::generate(),
            &PrivateKey::generate().public_key(),
            &PrivateKey::generate().public_key(),
            true,
        );

        assert_ne!(keys.initiator_key, keys.responder_key);
        assert_ne!(keys.initiator_key, keys.mac_key);
        assert_ne!(keys.responder_key, keys.mac_key);
    }

    #[test]
    fn test_role_confusion_breaks_agreement() {
        // Two peers that both believe they initiated never converge
        let alice_static = PrivateKey::generate();
        let alice_eph = PrivateKey::generate();
        let bob_static = PrivateKey::generate();
        let bob_eph = PrivateKey::generate();

        let alice = session_keys(
            &alice_static,
            &alice_eph,
            &bob_static.public_key(),
            &bob_eph.public_key(),
            true,
        );
        let bob = session_keys(
            &bob_static,
            &bob_eph,
            &alice_static.public_key(),
            &alice_eph.public_key(),
            true,
        );

        assert_ne!(alice.initiator_key, bob.initiator_key);
    }

    #[test]
    fn test_wrong_static_key_changes_everything() {
        let alice_static = PrivateKey::generate();
        let alice_eph = PrivateKey::generate();
        let bob_eph = PrivateKey::generate();

        let with_bob = session_keys(
            &alice_static,
            &alice_eph,
            &PrivateKey::generate().public_key(),
            &bob_eph.public_key(),
            true,
        );
        let with_mallory = session_keys(
            &alice_static,
            &alice_eph,
            &PrivateKey::generate().public_key(),
            &bob_eph.public_key(),
            true,
        );

        assert_ne!(with_bob.initiator_key, with_mallory.initiator_key);
        assert_ne!(with_bob.mac_key, with_mallory.mac_key);
    }

    #[test]
    fn test_key_storage_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_bytes(key.to_bytes());

        assert_eq!(key.public_key(), restored.public_key());
        assert_eq!(
            key.public_key(),
            PublicKey::from_bytes(key.public_key().to_bytes())
        );
    }
}

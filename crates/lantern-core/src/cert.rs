//! Certificates and the Trust Root
//!
//! Certificate issuance and parsing live outside this crate; here a
//! certificate is an opaque record carrying the facts the engine needs:
//! a static key, the VPN addresses it may claim, firewall groups and an
//! issuer fingerprint. The trusted CA pool is an explicit shared handle
//! threaded through construction so reloads swap it atomically instead of
//! mutating process-wide state.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use lantern_crypto::keys::PrivateKey;

use crate::error::{CoreError, CoreResult};
use crate::VpnIp;

/// The facts a node certificate asserts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Host name, matched by firewall `host` selectors
    pub name: String,
    /// The node's static X25519 public key
    pub public_key: [u8; 32],
    /// VPN addresses this certificate may claim; the first is primary
    pub vpn_ips: Vec<VpnIp>,
    /// Prefix length of the overlay subnet the addresses live in
    pub subnet_prefix: u8,
    /// Firewall groups
    pub groups: Vec<String>,
    /// Validity window start, Unix seconds
    pub not_before: u64,
    /// Validity window end, Unix seconds
    pub not_after: u64,
    /// Fingerprint of the issuing CA
    pub issuer: String,
}

impl Certificate {
    /// Canonical byte encoding, used on the wire and for fingerprinting
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Cert(e.to_string()))
    }

    /// Decode the canonical byte encoding
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::Cert(e.to_string()))
    }

    /// BLAKE3 fingerprint of the canonical encoding
    pub fn fingerprint(&self) -> CoreResult<String> {
        let encoded = self.encode()?;
        Ok(blake3::hash(&encoded).to_hex().to_string())
    }

    /// The certificate's primary VPN address
    pub fn primary_ip(&self) -> CoreResult<VpnIp> {
        self.vpn_ips
            .first()
            .copied()
            .ok_or_else(|| CoreError::Cert(format!("certificate {} has no vpn ip", self.name)))
    }

    /// The overlay subnet this certificate places the node in
    pub fn subnet(&self) -> CoreResult<ipnet::Ipv4Net> {
        let primary = self.primary_ip()?;
        ipnet::Ipv4Net::new(primary.to_ipv4(), self.subnet_prefix)
            .map_err(|_| CoreError::Cert(format!("invalid subnet prefix: {}", self.subnet_prefix)))
    }

    /// Does this certificate claim `vpn_ip`?
    pub fn claims(&self, vpn_ip: VpnIp) -> bool {
        self.vpn_ips.contains(&vpn_ip)
    }

    /// Is `now` inside the validity window?
    pub fn valid_at(&self, now: u64) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

/// The set of trusted CA fingerprints
#[derive(Debug, Clone, Default)]
pub struct CaPool {
    fingerprints: HashSet<String>,
}

impl CaPool {
    /// Build from a list of trusted fingerprints
    pub fn new(fingerprints: impl IntoIterator<Item = String>) -> Self {
        Self {
            fingerprints: fingerprints.into_iter().collect(),
        }
    }

    /// Is this issuer trusted?
    pub fn trusts(&self, issuer: &str) -> bool {
        self.fingerprints.contains(issuer)
    }

    /// All trusted fingerprints, for logging
    pub fn fingerprints(&self) -> Vec<String> {
        let mut out: Vec<_> = self.fingerprints.iter().cloned().collect();
        out.sort();
        out
    }

    /// Number of trusted CAs
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// True when no CA is trusted
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Shared handle to the trust root; reloads replace the contents in place
pub type CaHandle = Arc<RwLock<CaPool>>;

/// Create a fresh trust root handle
pub fn ca_handle(pool: CaPool) -> CaHandle {
    Arc::new(RwLock::new(pool))
}

/// Swap the trust root contents atomically
pub async fn reload_ca(handle: &CaHandle, pool: CaPool) {
    *handle.write().await = pool;
}

/// This node's identity: certificate, static key and the trust root
pub struct CertState {
    /// Our certificate
    pub certificate: Certificate,
    /// Our static key; its public half must match the certificate
    pub key: PrivateKey,
    ca: CaHandle,
}

impl CertState {
    /// Bind a certificate to its private key and the trust root
    pub fn new(certificate: Certificate, key: PrivateKey, ca: CaHandle) -> CoreResult<Self> {
        if certificate.public_key != key.public_key().to_bytes() {
            return Err(CoreError::Cert(
                "certificate public key does not match the private key".into(),
            ));
        }
        certificate.primary_ip()?;
        Ok(Self {
            certificate,
            key,
            ca,
        })
    }

    /// Our primary VPN address
    pub fn vpn_ip(&self) -> VpnIp {
        // validated in new()
        self.certificate.vpn_ips[0]
    }

    /// The overlay subnet, taken from our certificate
    pub fn subnet(&self) -> CoreResult<ipnet::Ipv4Net> {
        self.certificate.subnet()
    }

    /// The trust root handle, for threading into the firewall
    pub fn ca(&self) -> CaHandle {
        self.ca.clone()
    }

    /// Validate a peer certificate: validity window, trusted issuer, and
    /// optionally that it claims a specific VPN address.
    pub async fn verify_peer(
        &self,
        cert: &Certificate,
        now: u64,
        expected_ip: Option<VpnIp>,
    ) -> CoreResult<()> {
        if !cert.valid_at(now) {
            return Err(CoreError::Cert(format!(
                "certificate {} outside validity window",
                cert.name
            )));
        }

        if !self.ca.read().await.trusts(&cert.issuer) {
            return Err(CoreError::Cert(format!(
                "certificate {} signed by untrusted ca {}",
                cert.name, cert.issuer
            )));
        }

        if let Some(ip) = expected_ip {
            if !cert.claims(ip) {
                return Err(CoreError::Cert(format!(
                    "certificate {} does not claim {}",
                    cert.name, ip
                )));
            }
        }

        Ok(())
    }
}

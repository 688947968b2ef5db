//! Core protocol errors

use thiserror::Error;

use crate::VpnIp;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is invalid; fatal at startup
    #[error("Config error: {0}")]
    Config(String),

    /// Certificate or trust problem
    #[error("Certificate error: {0}")]
    Cert(String),

    /// Firewall rule could not be built
    #[error("Firewall error: {0}")]
    Firewall(String),

    /// No session and no way to build one
    #[error("No route to {0}")]
    NoRoute(VpnIp),

    /// Handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// No session with that index
    #[error("Unknown session index: {0}")]
    UnknownIndex(u32),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] lantern_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] lantern_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

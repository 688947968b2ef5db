//! Network layer errors

use std::net::SocketAddr;

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Bind failed because the address is taken
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Bind address could not be parsed
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// A datagram failed wire-format validation
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The TUN device is closed
    #[error("TUN device closed")]
    TunClosed,

    /// TUN device failure
    #[error("TUN error: {0}")]
    Tun(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

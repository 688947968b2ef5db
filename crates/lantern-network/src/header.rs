//! Wire Packet Header
//!
//! Every datagram starts with a fixed 16-byte big-endian header:
//!
//! ```text
//! [version: 4 bits][type: 4 bits][subtype: 1 byte][reserved: 2 bytes]
//! [remote index: 4 bytes][counter: 8 bytes]
//! ```
//!
//! The reserved bytes are zero on send and ignored on receive. For data
//! packets the encoded header doubles as the AEAD associated data.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Message type carried in the low nibble of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    /// Encrypted data packet
    Message = 1,

    /// Liveness probe, echoed by the peer
    Test = 2,

    /// The sender did not recognize our session index
    RecvError = 3,

    /// Lighthouse query / answer / update / punch coordination
    LightHouse = 4,

    /// Handshake message, stage in the subtype
    Handshake = 5,

    /// The peer tore the session down
    CloseTunnel = 6,
}

impl TryFrom<u8> for MsgType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, NetworkError> {
        match value {
            1 => Ok(Self::Message),
            2 => Ok(Self::Test),
            3 => Ok(Self::RecvError),
            4 => Ok(Self::LightHouse),
            5 => Ok(Self::Handshake),
            6 => Ok(Self::CloseTunnel),
            _ => Err(NetworkError::InvalidPacket(format!(
                "unknown message type: {}",
                value
            ))),
        }
    }
}

/// Message subtypes
pub mod subtype {
    /// Handshake stage 1, initiation
    pub const HANDSHAKE_INIT: u8 = 1;
    /// Handshake stage 2, response
    pub const HANDSHAKE_RESPONSE: u8 = 2;

    /// Liveness probe request
    pub const TEST_REQUEST: u8 = 0;
    /// Liveness probe reply
    pub const TEST_REPLY: u8 = 1;

    /// NAT punch datagram, dropped by the receiver
    pub const PUNCH: u8 = 1;
}

/// The fixed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version, currently always 1
    pub version: u8,
    /// Message type for dispatch
    pub msg_type: MsgType,
    /// Message subtype, meaning depends on the type
    pub subtype: u8,
    /// The receiver's local index for this session
    pub remote_index: u32,
    /// Monotonic send counter, feeds the AEAD nonce for data packets
    pub counter: u64,
}

impl Header {
    /// Create a header for the current protocol version
    pub fn new(msg_type: MsgType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            subtype,
            remote_index,
            counter,
        }
    }

    /// Encode into the fixed wire form
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u8((self.version << 4) | (self.msg_type as u8 & 0x0F));
        buf.put_u8(self.subtype);
        buf.put_u16(0); // reserved
        buf.put_u32(self.remote_index);
        buf.put_u64(self.counter);

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse the header from the front of a datagram
    pub fn parse(mut bytes: &[u8]) -> NetworkResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket(format!(
                "datagram too short: {} bytes",
                bytes.len()
            )));
        }

        let first = bytes.get_u8();
        let version = first >> 4;
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::InvalidPacket(format!(
                "unknown protocol version: {}",
                version
            )));
        }

        let msg_type = MsgType::try_from(first & 0x0F)?;
        let subtype = bytes.get_u8();
        let _reserved = bytes.get_u16();
        let remote_index = bytes.get_u32();
        let counter = bytes.get_u64();

        Ok(Self {
            version,
            msg_type,
            subtype,
            remote_index,
            counter,
        })
    }
}

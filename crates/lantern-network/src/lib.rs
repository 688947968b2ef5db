//! Lantern Network Layer
//!
//! Everything that touches raw bytes in flight:
//! - The fixed wire header and message type dispatch
//! - The UDP listener pool (reuse-port sockets, rebind, reload)
//! - The TUN device contract and IPv4 header peek helpers

pub mod error;
pub mod header;
pub mod tun;
pub mod udp;

pub use error::{NetworkError, NetworkResult};
pub use header::{Header, MsgType, HEADER_SIZE, PROTOCOL_VERSION};
pub use tun::{channel_tun, ChannelTun, TunDevice, TunHandle};
pub use udp::{Datagram, UdpListenerPool};

/// Largest datagram we will ever send or accept
pub const MAX_PACKET_SIZE: usize = 9001;

/// Default tunnel MTU
pub const DEFAULT_MTU: usize = 1300;

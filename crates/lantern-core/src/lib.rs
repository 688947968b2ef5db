//! Lantern Core Protocol
//!
//! The session and data-plane engine of the Lantern overlay mesh:
//! - Host map: peer sessions, candidate remotes, promotion, routing
//! - Handshake manager: pending sessions, retry schedule, key exchange
//! - Lighthouse: rendezvous directory, allow-lists, punch coordination
//! - Interface: the two forwarding pipelines and session lifecycle
//! - Control channel: rebind and exit from an embedding host

pub mod allowlist;
pub mod cert;
pub mod config;
pub mod control;
pub mod error;
pub mod firewall;
pub mod handshake_manager;
pub mod hostmap;
pub mod interface;
pub mod lighthouse;

pub use allowlist::AllowList;
pub use cert::{CaHandle, CaPool, CertState, Certificate};
pub use config::Config;
pub use control::{Command, CommandRequest};
pub use error::{CoreError, CoreResult};
pub use firewall::{Direction, Firewall, FirewallRule, FirewallRuleSet, Proto};
pub use handshake_manager::{HandshakeManager, HandshakeSettings};
pub use hostmap::{ConnectionState, HostInfo, HostMap};
pub use interface::{Interface, InterfaceConfig};
pub use lighthouse::{Lighthouse, LighthouseMessage};

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Default spacing between handshake attempts, in milliseconds
pub const DEFAULT_HANDSHAKE_TRY_INTERVAL_MS: u64 = 100;

/// Default number of handshake attempts before giving up
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 20;

/// Default extra ticks past exhaustion before permanent failure
pub const DEFAULT_HANDSHAKE_WAIT_ROTATION: u32 = 5;

/// Default liveness probe cadence, in seconds
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;

/// Default grace before an unresponsive session is torn down, in seconds
pub const DEFAULT_PENDING_DELETION_SECS: u64 = 10;

/// Default lighthouse self-update cadence, in seconds
pub const DEFAULT_LIGHTHOUSE_INTERVAL_SECS: u64 = 10;

/// Default lifetime of a learned lighthouse cache entry, in seconds
pub const DEFAULT_LIGHTHOUSE_TTL_SECS: u64 = 3600;

/// A node's address on the overlay subnet
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VpnIp(u32);

impl VpnIp {
    /// Wrap a host-order u32
    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// The host-order u32 form, used for ordering and hashing
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Convert back to a dotted-quad address
    pub fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }
}

impl From<Ipv4Addr> for VpnIp {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl fmt::Display for VpnIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv4())
    }
}

impl fmt::Debug for VpnIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VpnIp({})", self.to_ipv4())
    }
}

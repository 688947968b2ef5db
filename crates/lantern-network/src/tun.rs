//! TUN Device Abstraction
//!
//! The forwarding engine only needs a device that produces and accepts raw
//! IPv4 packets; the actual platform drivers live outside this crate. The
//! channel-backed device below stands in for a real driver in tests and
//! embeddings that feed packets programmatically.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetworkError, NetworkResult};

/// A device that delivers and accepts raw IP packets
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one inner IP packet
    async fn read(&self) -> NetworkResult<Bytes>;

    /// Write one inner IP packet
    async fn write(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Device name
    fn name(&self) -> &str;

    /// Device MTU
    fn mtu(&self) -> usize;

    /// Close the device; subsequent reads fail
    async fn close(&self) -> NetworkResult<()>;
}

/// Channel-backed TUN device for tests and embeddings
pub struct ChannelTun {
    name: String,
    mtu: usize,
    incoming: Mutex<mpsc::Receiver<Bytes>>,
    outgoing: mpsc::Sender<Bytes>,
    closed: AtomicBool,
}

/// The far side of a [`ChannelTun`]: inject packets "from the OS" and
/// observe packets the node delivered "to the OS".
pub struct TunHandle {
    /// Packets pushed here show up in `TunDevice::read`
    pub inject: mpsc::Sender<Bytes>,
    /// Packets the node wrote with `TunDevice::write`
    pub delivered: mpsc::Receiver<Bytes>,
}

/// Create a channel-backed device and its far-side handle
pub fn channel_tun(name: &str, mtu: usize, capacity: usize) -> (ChannelTun, TunHandle) {
    let (inject, incoming) = mpsc::channel(capacity);
    let (outgoing, delivered) = mpsc::channel(capacity);

    (
        ChannelTun {
            name: name.to_string(),
            mtu,
            incoming: Mutex::new(incoming),
            outgoing,
            closed: AtomicBool::new(false),
        },
        TunHandle { inject, delivered },
    )
}

#[async_trait]
impl TunDevice for ChannelTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::TunClosed);
        }
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(NetworkError::TunClosed)
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::TunClosed);
        }
        self.outgoing
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| NetworkError::TunClosed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Linux TUN driver, backed by the `tun` crate
#[cfg(target_os = "linux")]
pub mod linux {
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;
    use tracing::{debug, info};

    use super::TunDevice;
    use crate::error::{NetworkError, NetworkResult};

    /// Parameters for opening the device
    #[derive(Debug, Clone)]
    pub struct TunOptions {
        pub name: String,
        pub address: Ipv4Addr,
        pub netmask: Ipv4Addr,
        pub mtu: usize,
    }

    /// A real Linux TUN device
    pub struct LinuxTun {
        device: Mutex<tun::AsyncDevice>,
        name: String,
        mtu: usize,
    }

    impl LinuxTun {
        /// Open and bring up the device
        pub fn open(options: TunOptions) -> NetworkResult<Self> {
            let mut config = tun::Configuration::default();
            config
                .name(&options.name)
                .address(options.address)
                .netmask(options.netmask)
                .mtu(options.mtu as i32)
                .up();
            config.platform(|platform| {
                platform.packet_information(false);
            });

            let device = tun::create_as_async(&config)
                .map_err(|e| NetworkError::Tun(format!("failed to open tun device: {}", e)))?;

            info!(name = %options.name, address = %options.address, mtu = options.mtu, "tun device up");

            Ok(Self {
                device: Mutex::new(device),
                name: options.name,
                mtu: options.mtu,
            })
        }
    }

    #[async_trait]
    impl TunDevice for LinuxTun {
        async fn read(&self) -> NetworkResult<Bytes> {
            let mut buf = vec![0u8; self.mtu + 4];
            let mut device = self.device.lock().await;
            let n = device
                .read(&mut buf)
                .await
                .map_err(|e| NetworkError::Tun(format!("tun read failed: {}", e)))?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }

        async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
            let mut device = self.device.lock().await;
            device
                .write_all(packet)
                .await
                .map_err(|e| NetworkError::Tun(format!("tun write failed: {}", e)))
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        async fn close(&self) -> NetworkResult<()> {
            debug!(name = %self.name, "closing tun device");
            Ok(())
        }
    }
}

/// IPv4 header peek utilities
pub mod ip {
    use std::net::Ipv4Addr;

    /// Minimum IPv4 header length
    pub const MIN_IPV4_LEN: usize = 20;

    /// Transport flow extracted from an inner packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flow {
        /// IP protocol number (6 tcp, 17 udp, 1 icmp, ...)
        pub proto: u8,
        /// Source port, 0 when the protocol has none
        pub src_port: u16,
        /// Destination port, 0 when the protocol has none
        pub dst_port: u16,
    }

    /// IP version nibble, `None` for an empty packet
    pub fn version(packet: &[u8]) -> Option<u8> {
        packet.first().map(|b| b >> 4)
    }

    /// Source address of an IPv4 packet
    pub fn ipv4_src(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < MIN_IPV4_LEN {
            return None;
        }
        Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
    }

    /// Destination address of an IPv4 packet
    pub fn ipv4_dst(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < MIN_IPV4_LEN {
            return None;
        }
        Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
    }

    /// Extract the transport flow, ports zeroed for non TCP/UDP protocols
    pub fn parse_flow(packet: &[u8]) -> Option<Flow> {
        if packet.len() < MIN_IPV4_LEN || version(packet) != Some(4) {
            return None;
        }

        let proto = packet[9];
        let ihl = ((packet[0] & 0x0F) as usize) * 4;
        if ihl < MIN_IPV4_LEN || packet.len() < ihl {
            return None;
        }

        // Ports only exist for TCP and UDP and only in the first fragment
        let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF;
        if (proto == 6 || proto == 17) && fragment_offset == 0 && packet.len() >= ihl + 4 {
            let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
            let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
            return Some(Flow {
                proto,
                src_port,
                dst_port,
            });
        }

        Some(Flow {
            proto,
            src_port: 0,
            dst_port: 0,
        })
    }

    /// Build a minimal IPv4 UDP packet, for tests
    pub fn build_ipv4_udp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total = MIN_IPV4_LEN + 8 + payload.len();
        let mut packet = vec![0u8; total];

        packet[0] = 0x45; // version 4, ihl 5
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[8] = 64; // ttl
        packet[9] = 17; // udp
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());

        packet[20..22].copy_from_slice(&src_port.to_be_bytes());
        packet[22..24].copy_from_slice(&dst_port.to_be_bytes());
        packet[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        packet[28..].copy_from_slice(payload);

        packet
    }
}

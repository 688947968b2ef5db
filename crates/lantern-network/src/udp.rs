//! UDP Listener Pool
//!
//! One socket per receive routine, all bound to the same address with
//! SO_REUSEPORT when more than one routine is configured. Sending is safe
//! from any task over any socket. `rebind` re-opens every socket on the
//! same port; receive calls in flight during a rebind return a benign
//! `None` and are expected to be re-issued by the caller.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::MAX_PACKET_SIZE;

/// One received datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Source address
    pub from: SocketAddr,
    /// Raw bytes, header included
    pub data: Vec<u8>,
}

/// Socket buffer sizing, adjustable at runtime via `reload`
#[derive(Debug, Clone, Copy, Default)]
struct BufferSizes {
    recv: Option<usize>,
    send: Option<usize>,
}

/// Pool of UDP sockets sharing one bind address
pub struct UdpListenerPool {
    local_addr: SocketAddr,
    sockets: RwLock<Vec<Arc<UdpSocket>>>,
    buffers: RwLock<BufferSizes>,
    rebound: Notify,
}

impl UdpListenerPool {
    /// Bind `routines` sockets to `host:port`. Port 0 picks an ephemeral
    /// port which every subsequent socket and rebind then shares.
    pub async fn listen(
        host: &str,
        port: u16,
        routines: usize,
        reuse_port: bool,
    ) -> NetworkResult<Self> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(host.to_string()))?;

        // Multiple sockets on one bind address require SO_REUSEPORT
        let routines = if reuse_port { routines.max(1) } else { 1 };
        let buffers = BufferSizes::default();

        // Open the first socket alone so an ephemeral port gets pinned
        // before the rest of the pool binds to it.
        let first = open_socket(SocketAddr::new(ip, port), buffers)?;
        let local_addr = first.local_addr()?;

        let mut sockets = vec![Arc::new(first)];
        for _ in 1..routines {
            let socket = open_socket(local_addr, buffers)?;
            sockets.push(Arc::new(socket));
        }

        debug!(addr = %local_addr, routines, "UDP listener pool bound");

        Ok(Self {
            local_addr,
            sockets: RwLock::new(sockets),
            buffers: RwLock::new(buffers),
            rebound: Notify::new(),
        })
    }

    /// The address every socket in the pool is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sockets in the pool
    pub async fn routines(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Send a datagram. Safe from any task; transient errors are reported
    /// to the caller and never tear anything down.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> NetworkResult<()> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::InvalidPacket(format!(
                "datagram too large: {} bytes",
                data.len()
            )));
        }

        let socket = {
            let sockets = self.sockets.read().await;
            sockets[0].clone()
        };

        trace!(len = data.len(), %addr, "udp send");
        socket.send_to(data, addr).await?;
        Ok(())
    }

    /// Receive one datagram on the given routine's socket.
    ///
    /// Returns `Ok(None)` when a rebind interrupted the call; re-issue to
    /// continue on the fresh socket.
    pub async fn recv(&self, routine: usize) -> NetworkResult<Option<Datagram>> {
        let socket = {
            let sockets = self.sockets.read().await;
            sockets[routine % sockets.len()].clone()
        };

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                buf.truncate(len);
                trace!(len, %from, "udp recv");
                Ok(Some(Datagram { from, data: buf }))
            }
            _ = self.rebound.notified() => Ok(None),
        }
    }

    /// Re-open every socket on the same port. Established sessions are not
    /// disturbed; receive calls in flight observe a benign `None`.
    pub async fn rebind(&self) -> NetworkResult<()> {
        let buffers = *self.buffers.read().await;
        let mut sockets = self.sockets.write().await;

        let mut fresh = Vec::with_capacity(sockets.len());
        for _ in 0..sockets.len() {
            let socket = open_socket(self.local_addr, buffers)?;
            fresh.push(Arc::new(socket));
        }

        *sockets = fresh;
        drop(sockets);

        self.rebound.notify_waiters();
        debug!(addr = %self.local_addr, "UDP listener pool rebound");
        Ok(())
    }

    /// Apply new socket buffer sizes; takes effect immediately on the live
    /// sockets and sticks for future rebinds.
    pub async fn reload(&self, recv_buffer: Option<usize>, send_buffer: Option<usize>) {
        {
            let mut buffers = self.buffers.write().await;
            buffers.recv = recv_buffer;
            buffers.send = send_buffer;
        }

        if recv_buffer.is_none() && send_buffer.is_none() {
            return;
        }

        if let Err(e) = self.rebind().await {
            warn!(error = %e, "failed to apply new socket buffer sizes");
        }
    }
}

/// Build one configured, non-blocking UDP socket.
///
/// SO_REUSEPORT is always set so a rebind can bind the replacement
/// sockets while receive calls still hold the dying ones.
fn open_socket(addr: SocketAddr, buffers: BufferSizes) -> NetworkResult<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Some(size) = buffers.recv {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = buffers.send {
        socket.set_send_buffer_size(size)?;
    }

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_nonblocking(true)?;

    socket.bind(&addr.into()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            NetworkError::AddressInUse(addr)
        } else {
            NetworkError::Io(e)
        }
    })?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

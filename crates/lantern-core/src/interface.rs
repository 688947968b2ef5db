//! Forwarding Interface
//!
//! Runs the two packet pipelines. Inside to outside: read an inner packet
//! from the TUN device, route it to a peer, check the outbound firewall,
//! seal it under the session keys and hand it to the UDP pool. Outside to
//! inside: receive a datagram, dispatch by message type, replay-check,
//! open, check the inbound firewall, and deliver to the TUN device.
//!
//! Each worker owns its own buffers; shared state is only reached through
//! the host map and the managers. The liveness walker probes quiet
//! sessions and tears down the unresponsive ones.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use lantern_network::header::{subtype, Header, MsgType};
use lantern_network::tun::{ip, TunDevice};
use lantern_network::udp::UdpListenerPool;
use lantern_network::HEADER_SIZE;

use crate::cert::CertState;
use crate::firewall::{Direction, Firewall};
use crate::handshake_manager::HandshakeManager;
use crate::hostmap::HostMap;
use crate::lighthouse::Lighthouse;
use crate::VpnIp;

/// Everything the interface needs, assembled by the bootstrap
pub struct InterfaceConfig {
    pub hostmap: Arc<HostMap>,
    pub inside: Arc<dyn TunDevice>,
    pub outside: Arc<UdpListenerPool>,
    pub cert_state: Arc<CertState>,
    pub firewall: Arc<Firewall>,
    pub handshake_manager: Arc<HandshakeManager>,
    pub lighthouse: Arc<Lighthouse>,
    /// Liveness probe cadence
    pub check_interval: Duration,
    /// Grace past the probe before an unresponsive session is closed
    pub pending_deletion_interval: Duration,
    /// Drop egress to the subnet broadcast address
    pub drop_local_broadcast: bool,
    /// Drop egress to multicast destinations
    pub drop_multicast: bool,
    /// TUN reader worker count
    pub tun_routines: usize,
    /// UDP receive worker count
    pub udp_routines: usize,
    /// Datagrams a UDP worker processes before yielding
    pub udp_batch: usize,
}

/// The forwarding engine; owns the managers and the pipelines
pub struct Interface {
    hostmap: Arc<HostMap>,
    inside: Arc<dyn TunDevice>,
    outside: Arc<UdpListenerPool>,
    cert_state: Arc<CertState>,
    firewall: Arc<Firewall>,
    handshake_manager: Arc<HandshakeManager>,
    lighthouse: Arc<Lighthouse>,
    check_interval: Duration,
    pending_deletion_interval: Duration,
    drop_local_broadcast: bool,
    drop_multicast: bool,
    tun_routines: usize,
    udp_routines: usize,
    udp_batch: usize,
    my_vpn_ip: VpnIp,
    broadcast_addr: Ipv4Addr,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl Interface {
    /// Assemble the interface
    pub fn new(config: InterfaceConfig) -> Arc<Self> {
        let my_vpn_ip = config.cert_state.vpn_ip();
        let broadcast_addr = config.hostmap.vpn_subnet().broadcast();

        Arc::new(Self {
            hostmap: config.hostmap,
            inside: config.inside,
            outside: config.outside,
            cert_state: config.cert_state,
            firewall: config.firewall,
            handshake_manager: config.handshake_manager,
            lighthouse: config.lighthouse,
            check_interval: config.check_interval,
            pending_deletion_interval: config.pending_deletion_interval,
            drop_local_broadcast: config.drop_local_broadcast,
            drop_multicast: config.drop_multicast,
            tun_routines: config.tun_routines.max(1),
            udp_routines: config.udp_routines.max(1),
            udp_batch: config.udp_batch.max(1),
            my_vpn_ip,
            broadcast_addr,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Spawn every pipeline worker plus the liveness walker and the
    /// punch-respond listener. Returns the task handles.
    pub async fn run(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for routine in 0..self.tun_routines {
            let interface = self.clone();
            handles.push(tokio::spawn(async move {
                interface.inside_worker(routine).await;
            }));
        }

        for routine in 0..self.udp_routines {
            let interface = self.clone();
            handles.push(tokio::spawn(async move {
                interface.outside_worker(routine).await;
            }));
        }

        {
            let interface = self.clone();
            handles.push(tokio::spawn(async move {
                interface.liveness_worker().await;
            }));
        }

        // Punch notifications that ask for a reverse handshake feed the
        // handshake manager through this channel.
        let (tx, mut rx) = mpsc::channel::<VpnIp>(16);
        self.lighthouse.set_punch_respond_channel(tx).await;
        {
            let interface = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(vpn_ip) = rx.recv().await {
                    if interface.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!(%vpn_ip, "punch respond, starting reverse handshake");
                    interface.handshake_manager.trigger(vpn_ip).await;
                }
            }));
        }

        info!(
            tun_routines = self.tun_routines,
            udp_routines = self.udp_routines,
            "interface running"
        );
        handles
    }

    /// Inside to outside pipeline worker
    async fn inside_worker(self: Arc<Self>, routine: usize) {
        trace!(routine, "tun reader started");

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let packet = tokio::select! {
                result = self.inside.read() => match result {
                    Ok(packet) => packet,
                    Err(e) => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(error = %e, "tun read error");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => break,
            };

            self.handle_inside_packet(&packet).await;
        }

        trace!(routine, "tun reader stopped");
    }

    /// Route, filter, seal and send one inner packet
    pub async fn handle_inside_packet(&self, packet: &[u8]) {
        let Some(dst) = ip::ipv4_dst(packet) else {
            trace!("dropping non-ipv4 inner packet");
            return;
        };

        let Some(vpn_ip) = self.hostmap.route_lookup(dst).await else {
            trace!(%dst, "no route, dropping");
            return;
        };
        if vpn_ip == self.my_vpn_ip {
            return;
        }

        if self.drop_local_broadcast && dst == self.broadcast_addr {
            trace!(%dst, "dropping local broadcast");
            return;
        }
        if self.drop_multicast && dst.is_multicast() {
            trace!(%dst, "dropping multicast");
            return;
        }

        let Some(flow) = ip::parse_flow(packet) else {
            trace!("unparseable inner packet, dropping");
            return;
        };

        let allowed = self
            .firewall
            .evaluate(
                Direction::Outbound,
                flow.proto,
                flow.dst_port,
                &self.cert_state.certificate,
                vpn_ip,
            )
            .await;
        if !allowed {
            debug!(%vpn_ip, proto = flow.proto, port = flow.dst_port, "outbound denied by firewall");
            return;
        }

        let Some(host) = self.hostmap.query_vpn_ip(vpn_ip).await else {
            // No session: fire the handshake, drop the packet
            self.handshake_manager.trigger(vpn_ip).await;
            return;
        };

        let sealed = {
            let host = host.read().await;
            if !host.is_ready() {
                drop(host);
                self.handshake_manager.trigger(vpn_ip).await;
                return;
            }
            host.seal(MsgType::Message, 0, packet)
        };

        match sealed {
            Ok((remote, datagram)) => {
                if let Err(e) = self.outside.send_to(&datagram, SocketAddr::V4(remote)).await {
                    warn!(%vpn_ip, %remote, error = %e, "udp send failed");
                }
            }
            Err(e) => debug!(%vpn_ip, error = %e, "could not seal packet"),
        }
    }

    /// Outside to inside pipeline worker
    async fn outside_worker(self: Arc<Self>, routine: usize) {
        trace!(routine, "udp reader started");
        let mut processed = 0usize;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let datagram = tokio::select! {
                result = self.outside.recv(routine) => match result {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) => continue, // rebind, re-issue
                    Err(e) => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(error = %e, "udp recv error");
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => break,
            };

            self.handle_outside_packet(datagram.from, &datagram.data).await;

            processed += 1;
            if processed >= self.udp_batch {
                processed = 0;
                tokio::task::yield_now().await;
            }
        }

        trace!(routine, "udp reader stopped");
    }

    /// Dispatch one received datagram by message type
    pub async fn handle_outside_packet(&self, from: SocketAddr, data: &[u8]) {
        let header = match Header::parse(data) {
            Ok(header) => header,
            Err(e) => {
                trace!(%from, error = %e, "undecodable datagram dropped");
                return;
            }
        };
        let payload = &data[HEADER_SIZE..];

        match header.msg_type {
            MsgType::Handshake => {
                let result = match header.subtype {
                    subtype::HANDSHAKE_INIT => {
                        self.handshake_manager.handle_init(from, payload).await
                    }
                    subtype::HANDSHAKE_RESPONSE => {
                        self.handshake_manager
                            .handle_response(from, &header, payload)
                            .await
                    }
                    other => {
                        trace!(%from, subtype = other, "unknown handshake stage dropped");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    // Silent drop; a bad handshake must not amplify
                    debug!(%from, error = %e, "handshake message dropped");
                }
            }
            MsgType::LightHouse => {
                if let Err(e) = self.lighthouse.handle_message(from, payload).await {
                    debug!(%from, error = %e, "lighthouse message dropped");
                }
            }
            MsgType::RecvError => self.handle_recv_error(from, &header).await,
            MsgType::Message | MsgType::Test | MsgType::CloseTunnel => {
                self.handle_data_packet(from, &header, payload).await;
            }
        }
    }

    /// The data-plane path: session lookup, replay check, open, act
    async fn handle_data_packet(&self, from: SocketAddr, header: &Header, payload: &[u8]) {
        // A punch datagram addresses no session at all; absorb it quietly
        if header.msg_type == MsgType::Test
            && header.subtype == subtype::PUNCH
            && header.remote_index == 0
        {
            trace!(%from, "punch datagram absorbed");
            return;
        }

        let Some(host) = self.hostmap.query_index(header.remote_index).await else {
            trace!(%from, index = header.remote_index, "unknown session index");
            self.send_recv_error(from, header.remote_index).await;
            return;
        };

        let from_v4 = match from {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return,
        };

        // Open under the host write lock, then release before any I/O
        let (plaintext, vpn_ip, peer_cert) = {
            let mut host = host.write().await;
            let plaintext = match host.open(header, payload) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!(
                        vpn_ip = %host.vpn_ip, %from, error = %e,
                        "packet failed authentication or replay check"
                    );
                    return;
                }
            };

            self.consider_roaming(&mut host, from_v4);

            let cert = host
                .connection
                .as_ref()
                .map(|c| c.peer_certificate.clone());
            (plaintext, host.vpn_ip, cert)
        };

        match header.msg_type {
            MsgType::Message => {
                let Some(peer_cert) = peer_cert else { return };
                let Some(flow) = ip::parse_flow(&plaintext) else {
                    trace!(%vpn_ip, "unparseable inner packet dropped");
                    return;
                };

                let allowed = self
                    .firewall
                    .evaluate(
                        Direction::Inbound,
                        flow.proto,
                        flow.dst_port,
                        &peer_cert,
                        vpn_ip,
                    )
                    .await;
                if !allowed {
                    debug!(%vpn_ip, remote = %from, proto = flow.proto, port = flow.dst_port,
                        "inbound denied by firewall");
                    return;
                }

                if let Err(e) = self.inside.write(&plaintext).await {
                    warn!(%vpn_ip, error = %e, "tun write failed");
                }
            }
            MsgType::Test => {
                if header.subtype == subtype::TEST_REQUEST {
                    let reply = {
                        let host = host.read().await;
                        host.seal(MsgType::Test, subtype::TEST_REPLY, &plaintext)
                    };
                    if let Ok((remote, datagram)) = reply {
                        let _ = self.outside.send_to(&datagram, SocketAddr::V4(remote)).await;
                    }
                }
                // A reply already refreshed liveness inside open()
            }
            MsgType::CloseTunnel => {
                info!(%vpn_ip, remote = %from, "peer closed the tunnel");
                self.hostmap.remove_vpn_ip(vpn_ip).await;
            }
            _ => unreachable!("dispatch only routes data-plane types here"),
        }
    }

    /// Roaming: a preferred source replaces a non-preferred remote,
    /// anything else is recorded as a candidate only.
    fn consider_roaming(&self, host: &mut crate::hostmap::HostInfo, from: SocketAddrV4) {
        if host.remote == Some(from) {
            return;
        }

        let new_preferred = self.hostmap.is_preferred(*from.ip());
        let current_preferred = host
            .remote
            .map(|r| self.hostmap.is_preferred(*r.ip()))
            .unwrap_or(false);

        if new_preferred && !current_preferred {
            info!(vpn_ip = %host.vpn_ip, old = ?host.remote, new = %from, "peer roamed to preferred range");
            host.set_remote(from);
            host.promoted = true;
            host.last_roam = Some(std::time::Instant::now());
        } else {
            host.add_remote(from);
        }
    }

    /// Tell a sender we do not know the session it is addressing
    async fn send_recv_error(&self, to: SocketAddr, index: u32) {
        let packet = Header::new(MsgType::RecvError, 0, index, 0).encode();
        let _ = self.outside.send_to(&packet, to).await;
    }

    /// A peer told us it does not recognize a session we think we share.
    /// Tear our side down so the next outbound packet re-handshakes.
    async fn handle_recv_error(&self, from: SocketAddr, header: &Header) {
        let SocketAddr::V4(from_v4) = from else { return };

        let Some(host) = self.hostmap.query_remote_index(header.remote_index).await else {
            return;
        };

        let (vpn_ip, matches) = {
            let host = host.read().await;
            (host.vpn_ip, host.remote == Some(from_v4))
        };

        // Only the session's own remote may kill it
        if matches {
            info!(%vpn_ip, remote = %from_v4, "peer lost our session, tearing down");
            self.hostmap.remove_vpn_ip(vpn_ip).await;
        }
    }

    /// Periodic liveness walk over the main host map
    async fn liveness_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.liveness_pass().await,
                _ = self.shutdown_notify.notified() => break,
            }
        }
    }

    /// One pass: probe quiet sessions, close unresponsive ones
    pub async fn liveness_pass(&self) {
        for host in self.hostmap.hosts_snapshot().await {
            let (vpn_ip, idle, ready) = {
                let host = host.read().await;
                (host.vpn_ip, host.last_recv.elapsed(), host.is_ready())
            };
            if !ready {
                continue;
            }

            if idle > self.check_interval + self.pending_deletion_interval {
                info!(%vpn_ip, ?idle, "session unresponsive, closing");
                let close = host.read().await.seal(MsgType::CloseTunnel, 0, &[]);
                if let Ok((remote, datagram)) = close {
                    let _ = self.outside.send_to(&datagram, SocketAddr::V4(remote)).await;
                }
                self.hostmap.remove_vpn_ip(vpn_ip).await;
                continue;
            }

            if idle > self.check_interval {
                let probe = {
                    let mut host = host.write().await;
                    host.probes_sent += 1;
                    // After two unanswered probes try the next candidate
                    if host.probes_sent >= 2 {
                        host.cycle_remote();
                    }
                    host.seal(MsgType::Test, subtype::TEST_REQUEST, &[])
                };
                if let Ok((remote, datagram)) = probe {
                    trace!(%vpn_ip, %remote, "liveness probe");
                    let _ = self.outside.send_to(&datagram, SocketAddr::V4(remote)).await;
                }
            }
        }
    }

    /// Graceful shutdown: close every ready session best-effort, stop the
    /// managers, and release the pipeline workers.
    pub async fn shutdown(&self) {
        info!("interface shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        for host in self.hostmap.hosts_snapshot().await {
            let close = {
                let host = host.read().await;
                if !host.is_ready() {
                    continue;
                }
                debug!(vpn_ip = %host.vpn_ip, remote = ?host.remote, "sending close tunnel");
                host.seal(MsgType::CloseTunnel, 0, &[])
            };
            if let Ok((remote, datagram)) = close {
                let _ = self.outside.send_to(&datagram, SocketAddr::V4(remote)).await;
            }
        }

        self.handshake_manager.stop();
        self.lighthouse.stop();
        self.hostmap.stop_punchy();
        self.shutdown_notify.notify_waiters();
        let _ = self.inside.close().await;
    }

    /// True once shutdown began
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

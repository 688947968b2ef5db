//! Host Map
//!
//! The table of peer sessions. Keyed two ways: by VPN address for the
//! outbound path and by local session index for inbound demultiplexing.
//! A second instance holds pending (handshaking) hosts; completion moves a
//! host from pending to main. Local indexes are unique across both maps.
//!
//! Routing also lives here: the VPN subnet itself, a longest-prefix-match
//! table of unsafe routes tunnelled through gateway peers, and an optional
//! default route.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

use lantern_crypto::{CipherSuite, ReplayWindow, SessionCrypto};
use lantern_network::header::{subtype, Header, MsgType};
use lantern_network::udp::UdpListenerPool;

use crate::cert::Certificate;
use crate::error::{CoreError, CoreResult};
use crate::VpnIp;

/// Established cipher state and counters for one session
pub struct ConnectionState {
    /// The AEAD suite both sides agreed to use
    pub suite: CipherSuite,
    crypto: SessionCrypto,
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
    /// The peer's validated certificate
    pub peer_certificate: Certificate,
    /// True once the session may carry data
    pub ready: bool,
}

impl ConnectionState {
    /// Wrap the output of a completed handshake
    pub fn new(crypto: SessionCrypto, suite: CipherSuite, peer_certificate: Certificate) -> Self {
        Self {
            suite,
            crypto,
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            peer_certificate,
            ready: true,
        }
    }

    /// Allocate the next send counter; strictly monotonic, starts at 1
    pub fn next_counter(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Seal a payload under a freshly allocated counter
    pub fn encrypt(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(self.crypto.send.encrypt(counter, aad, plaintext)?)
    }

    /// Open a received payload; the caller drives the replay window
    pub fn decrypt(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(self.crypto.recv.decrypt(counter, aad, ciphertext)?)
    }

    /// Would this counter pass the replay window?
    pub fn replay_check(&self, counter: u64) -> bool {
        self.replay.lock().expect("replay lock poisoned").check(counter)
    }

    /// Mark a counter as seen after the packet authenticated
    pub fn replay_update(&self, counter: u64) -> bool {
        self.replay.lock().expect("replay lock poisoned").update(counter)
    }
}

/// One peer session and its addressing state
pub struct HostInfo {
    /// The peer's VPN address
    pub vpn_ip: VpnIp,
    /// Where we currently send; always a member of `candidates`
    pub remote: Option<SocketAddrV4>,
    /// Every remote we have learned for this peer, in learn order
    pub candidates: Vec<SocketAddrV4>,
    /// Cipher state once the handshake completed
    pub connection: Option<ConnectionState>,
    /// Our index for this session, unique process-wide
    pub local_index: u32,
    /// The peer's index, echoed into every packet we send
    pub remote_index: u32,
    /// True when the current remote won a preferred-range promotion
    pub promoted: bool,
    /// When the remote last changed because the peer roamed
    pub last_roam: Option<Instant>,
    /// Last time anything authenticated arrived on this session
    pub last_recv: Instant,
    /// Liveness probes sent since `last_recv`
    pub probes_sent: u32,
    /// Responder-side cache of the handshake response, resent on
    /// duplicate initiations so a lost reply does not rebuild the session
    pub cached_response: Option<Vec<u8>>,
}

impl HostInfo {
    /// Create a host with no session yet
    pub fn new(vpn_ip: VpnIp, local_index: u32) -> Self {
        Self {
            vpn_ip,
            remote: None,
            candidates: Vec::new(),
            connection: None,
            local_index,
            remote_index: 0,
            promoted: false,
            last_roam: None,
            last_recv: Instant::now(),
            probes_sent: 0,
            cached_response: None,
        }
    }

    /// Record a learned remote. Appends to the candidate list; the current
    /// remote only changes if there was none.
    pub fn add_remote(&mut self, remote: SocketAddrV4) {
        if !self.candidates.contains(&remote) {
            self.candidates.push(remote);
        }
        if self.remote.is_none() {
            self.remote = Some(remote);
        }
    }

    /// Point the session at a specific remote, learning it if needed
    pub fn set_remote(&mut self, remote: SocketAddrV4) {
        if !self.candidates.contains(&remote) {
            self.candidates.push(remote);
        }
        self.remote = Some(remote);
    }

    /// Rotate to the next candidate remote, used when probes go unanswered
    pub fn cycle_remote(&mut self) {
        if self.candidates.len() < 2 {
            return;
        }
        let current = self
            .remote
            .and_then(|r| self.candidates.iter().position(|c| *c == r))
            .unwrap_or(0);
        let next = self.candidates[(current + 1) % self.candidates.len()];
        self.remote = Some(next);
        self.promoted = false;
        trace!(vpn_ip = %self.vpn_ip, remote = %next, "cycled to next candidate remote");
    }

    /// Note that an authenticated packet arrived
    pub fn mark_recv(&mut self) {
        self.last_recv = Instant::now();
        self.probes_sent = 0;
    }

    /// True when the session can carry data
    pub fn is_ready(&self) -> bool {
        self.connection.as_ref().map(|c| c.ready).unwrap_or(false)
    }

    /// Seal a packet for this session: allocate a counter, build the
    /// header, encrypt the payload with the header as associated data.
    pub fn seal(&self, msg_type: MsgType, sub: u8, payload: &[u8]) -> CoreResult<(SocketAddrV4, Vec<u8>)> {
        let remote = self
            .remote
            .ok_or_else(|| CoreError::NoRoute(self.vpn_ip))?;
        let connection = self
            .connection
            .as_ref()
            .ok_or(CoreError::UnknownIndex(self.local_index))?;

        let counter = connection.next_counter();
        let header = Header::new(msg_type, sub, self.remote_index, counter);
        let header_bytes = header.encode();

        let mut packet = Vec::with_capacity(header_bytes.len() + payload.len() + 16);
        packet.extend_from_slice(&header_bytes);
        packet.extend_from_slice(&connection.encrypt(counter, &header_bytes, payload)?);
        Ok((remote, packet))
    }

    /// Open a sealed packet: replay-check the counter, authenticate and
    /// decrypt with the header as associated data, then commit the counter
    /// and refresh liveness.
    pub fn open(&mut self, header: &Header, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(CoreError::UnknownIndex(header.remote_index))?;

        if !connection.replay_check(header.counter) {
            return Err(CoreError::Crypto(
                lantern_crypto::CryptoError::DecryptionFailed,
            ));
        }

        let plaintext = connection.decrypt(header.counter, &header.encode(), ciphertext)?;
        connection.replay_update(header.counter);
        self.mark_recv();
        Ok(plaintext)
    }
}

/// Session table, keyed by VPN address and by local index
pub struct HostMap {
    name: &'static str,
    vpn_subnet: Ipv4Net,
    preferred_ranges: Vec<Ipv4Net>,
    hosts: RwLock<HashMap<VpnIp, Arc<RwLock<HostInfo>>>>,
    indexes: RwLock<HashMap<u32, Arc<RwLock<HostInfo>>>>,
    /// Longest-prefix-match table: inner destination cidr -> gateway peer
    unsafe_routes: RwLock<Vec<(Ipv4Net, VpnIp)>>,
    default_route: RwLock<Option<VpnIp>>,
    punchy_shutdown: Notify,
    punchy_running: AtomicBool,
}

impl HostMap {
    /// Create an empty map for the given overlay subnet
    pub fn new(name: &'static str, vpn_subnet: Ipv4Net, preferred_ranges: Vec<Ipv4Net>) -> Self {
        Self {
            name,
            vpn_subnet,
            preferred_ranges,
            hosts: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            unsafe_routes: RwLock::new(Vec::new()),
            default_route: RwLock::new(None),
            punchy_shutdown: Notify::new(),
            punchy_running: AtomicBool::new(false),
        }
    }

    /// The overlay subnet this map serves
    pub fn vpn_subnet(&self) -> Ipv4Net {
        self.vpn_subnet
    }

    /// Set the VPN address used when no route matches
    pub async fn set_default_route(&self, route: Option<VpnIp>) {
        *self.default_route.write().await = route;
    }

    /// Register a non-VPN cidr tunnelled through a gateway peer
    pub async fn add_unsafe_route(&self, cidr: Ipv4Net, via: VpnIp) {
        let mut routes = self.unsafe_routes.write().await;
        routes.retain(|(net, _)| *net != cidr);
        routes.push((cidr, via));
        // longest prefix first
        routes.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
    }

    /// Resolve an inner destination to the peer that should carry it
    pub async fn route_lookup(&self, dst: Ipv4Addr) -> Option<VpnIp> {
        if self.vpn_subnet.contains(&dst) {
            return Some(VpnIp::from(dst));
        }

        let routes = self.unsafe_routes.read().await;
        for (net, via) in routes.iter() {
            if net.contains(&dst) {
                return Some(*via);
            }
        }
        drop(routes);

        *self.default_route.read().await
    }

    /// Insert a host under both keys, replacing any prior entry for the
    /// same VPN address. Returns the shared handle and the displaced host.
    pub async fn add(&self, host: HostInfo) -> (Arc<RwLock<HostInfo>>, Option<Arc<RwLock<HostInfo>>>) {
        let vpn_ip = host.vpn_ip;
        let local_index = host.local_index;
        let host = Arc::new(RwLock::new(host));

        let mut hosts = self.hosts.write().await;
        let mut indexes = self.indexes.write().await;

        let displaced = hosts.insert(vpn_ip, host.clone());
        if let Some(old) = &displaced {
            let old_index = old.read().await.local_index;
            indexes.remove(&old_index);
        }
        indexes.insert(local_index, host.clone());

        debug!(map = self.name, %vpn_ip, local_index, "host added");
        (host, displaced)
    }

    /// Look up by VPN address
    pub async fn query_vpn_ip(&self, vpn_ip: VpnIp) -> Option<Arc<RwLock<HostInfo>>> {
        self.hosts.read().await.get(&vpn_ip).cloned()
    }

    /// Look up by our local index
    pub async fn query_index(&self, local_index: u32) -> Option<Arc<RwLock<HostInfo>>> {
        self.indexes.read().await.get(&local_index).cloned()
    }

    /// Look up by the index the peer chose, used for `recvError`
    pub async fn query_remote_index(&self, remote_index: u32) -> Option<Arc<RwLock<HostInfo>>> {
        let hosts = self.hosts.read().await;
        for host in hosts.values() {
            if host.read().await.remote_index == remote_index {
                return Some(host.clone());
            }
        }
        None
    }

    /// Remove a host by VPN address
    pub async fn remove_vpn_ip(&self, vpn_ip: VpnIp) -> Option<Arc<RwLock<HostInfo>>> {
        let mut hosts = self.hosts.write().await;
        let mut indexes = self.indexes.write().await;

        let removed = hosts.remove(&vpn_ip)?;
        let local_index = removed.read().await.local_index;
        indexes.remove(&local_index);

        debug!(map = self.name, %vpn_ip, local_index, "host removed");
        Some(removed)
    }

    /// Remove a host by local index
    pub async fn remove_index(&self, local_index: u32) -> Option<Arc<RwLock<HostInfo>>> {
        let vpn_ip = {
            let indexes = self.indexes.read().await;
            let host = indexes.get(&local_index)?;
            let vpn_ip = host.read().await.vpn_ip;
            vpn_ip
        };
        self.remove_vpn_ip(vpn_ip).await
    }

    /// Record a learned remote for a host, if it exists
    pub async fn add_remote(&self, vpn_ip: VpnIp, remote: SocketAddrV4) {
        if let Some(host) = self.query_vpn_ip(vpn_ip).await {
            host.write().await.add_remote(remote);
        }
    }

    /// Is this address inside one of the configured preferred ranges?
    pub fn is_preferred(&self, addr: Ipv4Addr) -> bool {
        self.preferred_ranges.iter().any(|net| net.contains(&addr))
    }

    /// Promotion rule: an observed remote inside a preferred range
    /// replaces a current remote that is not. Idempotent.
    pub async fn promote(&self, host: &Arc<RwLock<HostInfo>>, observed: SocketAddrV4) {
        let mut host = host.write().await;

        if host.remote == Some(observed) {
            return;
        }

        let observed_preferred = self.is_preferred(*observed.ip());
        let current_preferred = host
            .remote
            .map(|r| self.is_preferred(*r.ip()))
            .unwrap_or(false);

        if observed_preferred && !current_preferred {
            host.set_remote(observed);
            host.promoted = true;
            host.last_roam = Some(Instant::now());
            debug!(map = self.name, vpn_ip = %host.vpn_ip, remote = %observed, "remote promoted");
        } else {
            host.add_remote(observed);
        }
    }

    /// Is this local index in use here?
    pub async fn index_in_use(&self, local_index: u32) -> bool {
        self.indexes.read().await.contains_key(&local_index)
    }

    /// Snapshot of every host, for liveness walks and shutdown sweeps
    pub async fn hosts_snapshot(&self) -> Vec<Arc<RwLock<HostInfo>>> {
        self.hosts.read().await.values().cloned().collect()
    }

    /// Number of hosts
    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    /// True when the map holds no hosts
    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }

    /// Periodic NAT keepalive: send one empty punch datagram to every
    /// session's remote so the mapping stays open. Runs until
    /// `stop_punchy` is called.
    pub fn start_punchy(
        self: &Arc<Self>,
        udp: Arc<UdpListenerPool>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let map = self.clone();
        map.punchy_running.store(true, Ordering::Relaxed);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let punch = Header::new(MsgType::Test, subtype::PUNCH, 0, 0).encode();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for host in map.hosts_snapshot().await {
                            let remote = host.read().await.remote;
                            if let Some(remote) = remote {
                                let _ = udp.send_to(&punch, SocketAddr::V4(remote)).await;
                            }
                        }
                    }
                    _ = map.punchy_shutdown.notified() => break,
                }
            }
            map.punchy_running.store(false, Ordering::Relaxed);
        })
    }

    /// Stop the punchy task
    pub fn stop_punchy(&self) {
        self.punchy_shutdown.notify_waiters();
    }
}

/// Allocate a random non-zero local index unused in every given map.
/// Zero is reserved as the "no index" sentinel on the wire.
pub async fn allocate_index(maps: &[&HostMap]) -> u32 {
    use rand::Rng;
    loop {
        let candidate: u32 = rand::thread_rng().gen();
        if candidate == 0 {
            continue;
        }
        let mut used = false;
        for map in maps {
            if map.index_in_use(candidate).await {
                used = true;
                break;
            }
        }
        if !used {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_crypto::{CipherState, SymmetricKey};

    fn subnet() -> Ipv4Net {
        "10.0.0.0/24".parse().unwrap()
    }

    fn vpn(last: u8) -> VpnIp {
        VpnIp::from(Ipv4Addr::new(10, 0, 0, last))
    }

    fn ep(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    fn dummy_cert() -> Certificate {
        Certificate {
            name: "peer".into(),
            public_key: [0u8; 32],
            vpn_ips: vec![vpn(2)],
            subnet_prefix: 24,
            groups: vec![],
            not_before: 0,
            not_after: u64::MAX,
            issuer: "ca".into(),
        }
    }

    fn dummy_connection() -> ConnectionState {
        let key = SymmetricKey::generate();
        let crypto = SessionCrypto {
            send: CipherState::new(CipherSuite::ChaChaPoly, key.clone()),
            recv: CipherState::new(CipherSuite::ChaChaPoly, key),
        };
        ConnectionState::new(crypto, CipherSuite::ChaChaPoly, dummy_cert())
    }

    #[test]
    fn test_send_counter_is_strictly_monotonic() {
        let conn = dummy_connection();
        let mut last = 0;
        for _ in 0..100 {
            let next = conn.next_counter();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_dual_key_lookup() {
        let map = HostMap::new("main", subnet(), vec![]);
        let (host, displaced) = map.add(HostInfo::new(vpn(2), 42)).await;
        assert!(displaced.is_none());

        assert!(Arc::ptr_eq(&map.query_vpn_ip(vpn(2)).await.unwrap(), &host));
        assert!(Arc::ptr_eq(&map.query_index(42).await.unwrap(), &host));
        assert!(map.query_vpn_ip(vpn(3)).await.is_none());
        assert!(map.query_index(7).await.is_none());
    }

    #[tokio::test]
    async fn test_replacement_displaces_old_index() {
        let map = HostMap::new("main", subnet(), vec![]);
        map.add(HostInfo::new(vpn(2), 1)).await;
        let (_, displaced) = map.add(HostInfo::new(vpn(2), 2)).await;

        assert!(displaced.is_some());
        assert!(map.query_index(1).await.is_none());
        assert!(map.query_index(2).await.is_some());
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_remote_does_not_clobber_current() {
        let map = HostMap::new("main", subnet(), vec![]);
        let (host, _) = map.add(HostInfo::new(vpn(2), 1)).await;

        map.add_remote(vpn(2), ep([198, 51, 100, 5], 4242)).await;
        map.add_remote(vpn(2), ep([203, 0, 113, 9], 4242)).await;

        let host = host.read().await;
        assert_eq!(host.remote, Some(ep([198, 51, 100, 5], 4242)));
        assert_eq!(host.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_promotion_prefers_ranges_and_is_idempotent() {
        let preferred: Ipv4Net = "10.100.0.0/16".parse().unwrap();
        let map = HostMap::new("main", subnet(), vec![preferred]);
        let (host, _) = map.add(HostInfo::new(vpn(2), 1)).await;
        host.write().await.add_remote(ep([198, 51, 100, 5], 5555));

        let lan = ep([10, 100, 0, 9], 5555);
        map.promote(&host, lan).await;
        {
            let h = host.read().await;
            assert_eq!(h.remote, Some(lan));
            assert!(h.promoted);
        }

        // Promoting again must change nothing
        let candidates_before = host.read().await.candidates.clone();
        map.promote(&host, lan).await;
        let h = host.read().await;
        assert_eq!(h.remote, Some(lan));
        assert_eq!(h.candidates, candidates_before);
    }

    #[tokio::test]
    async fn test_non_preferred_observed_is_recorded_not_promoted() {
        let preferred: Ipv4Net = "10.100.0.0/16".parse().unwrap();
        let map = HostMap::new("main", subnet(), vec![preferred]);
        let (host, _) = map.add(HostInfo::new(vpn(2), 1)).await;
        host.write().await.add_remote(ep([198, 51, 100, 5], 5555));

        map.promote(&host, ep([192, 0, 2, 7], 5555)).await;

        let h = host.read().await;
        assert_eq!(h.remote, Some(ep([198, 51, 100, 5], 5555)));
        assert!(!h.promoted);
        assert!(h.candidates.contains(&ep([192, 0, 2, 7], 5555)));
    }

    #[tokio::test]
    async fn test_route_lookup_order() {
        let map = HostMap::new("main", subnet(), vec![]);
        map.add_unsafe_route("192.168.0.0/16".parse().unwrap(), vpn(5)).await;
        map.add_unsafe_route("192.168.1.0/24".parse().unwrap(), vpn(6)).await;

        // In-subnet destinations route to themselves
        assert_eq!(map.route_lookup(Ipv4Addr::new(10, 0, 0, 9)).await, Some(vpn(9)));

        // Longest prefix wins
        assert_eq!(
            map.route_lookup(Ipv4Addr::new(192, 168, 1, 7)).await,
            Some(vpn(6))
        );
        assert_eq!(
            map.route_lookup(Ipv4Addr::new(192, 168, 2, 7)).await,
            Some(vpn(5))
        );

        // No default route means drop
        assert_eq!(map.route_lookup(Ipv4Addr::new(8, 8, 8, 8)).await, None);

        map.set_default_route(Some(vpn(1))).await;
        assert_eq!(map.route_lookup(Ipv4Addr::new(8, 8, 8, 8)).await, Some(vpn(1)));
    }

    #[tokio::test]
    async fn test_index_allocation_avoids_both_maps() {
        let main = HostMap::new("main", subnet(), vec![]);
        let pending = HostMap::new("pending", subnet(), vec![]);
        main.add(HostInfo::new(vpn(2), 7)).await;
        pending.add(HostInfo::new(vpn(3), 8)).await;

        for _ in 0..50 {
            let idx = allocate_index(&[&main, &pending]).await;
            assert!(idx != 0 && idx != 7 && idx != 8);
        }
    }

    #[tokio::test]
    async fn test_cycle_remote() {
        let mut host = HostInfo::new(vpn(2), 1);
        host.add_remote(ep([198, 51, 100, 5], 1000));
        host.add_remote(ep([198, 51, 100, 6], 1000));
        host.add_remote(ep([198, 51, 100, 7], 1000));

        host.cycle_remote();
        assert_eq!(host.remote, Some(ep([198, 51, 100, 6], 1000)));
        host.cycle_remote();
        assert_eq!(host.remote, Some(ep([198, 51, 100, 7], 1000)));
        host.cycle_remote();
        assert_eq!(host.remote, Some(ep([198, 51, 100, 5], 1000)));
    }

    #[tokio::test]
    async fn test_seal_open_roundtrip() {
        let mut a = HostInfo::new(vpn(2), 1);
        a.remote_index = 9;
        a.add_remote(ep([127, 0, 0, 1], 4242));
        a.connection = Some(dummy_connection());

        let (_, packet) = a.seal(MsgType::Message, 0, b"inner").unwrap();
        let header = Header::parse(&packet).unwrap();
        assert_eq!(header.remote_index, 9);
        assert_eq!(header.counter, 1);

        // The symmetric test key lets the same host open its own packet
        let plaintext = a
            .open(&header, &packet[lantern_network::HEADER_SIZE..])
            .unwrap();
        assert_eq!(plaintext, b"inner");

        // Replaying the same packet must fail
        assert!(a.open(&header, &packet[lantern_network::HEADER_SIZE..]).is_err());
    }
}

//! Handshake Manager
//!
//! Drives pending sessions to completion. An outbound packet with no
//! session triggers a pending entry; the manager then retries message 1
//! on a fixed interval against every candidate remote it can find, in
//! order: the lighthouse cache, the static host map, and finally a fresh
//! lighthouse query. Completion installs the session in the main host map
//! and closes any session it replaces. When both sides initiate at once,
//! the side with the numerically smaller VPN address wins.
//!
//! Only the handshake trigger survives an outbound miss; the packet that
//! caused it is dropped, never queued.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use lantern_crypto::handshake::{
    current_timestamp, HandshakeInit, HandshakeResponse, InitiatorState, ResponderState,
};
use lantern_crypto::{CipherSuite, PublicKey};
use lantern_network::header::{subtype, Header, MsgType};
use lantern_network::udp::UdpListenerPool;

use crate::cert::{CertState, Certificate};
use crate::error::{CoreError, CoreResult};
use crate::hostmap::{allocate_index, ConnectionState, HostInfo, HostMap};
use crate::lighthouse::Lighthouse;
use crate::{
    VpnIp, DEFAULT_HANDSHAKE_RETRIES, DEFAULT_HANDSHAKE_TRY_INTERVAL_MS,
    DEFAULT_HANDSHAKE_WAIT_ROTATION,
};

/// Retry schedule knobs
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    /// Spacing between attempts
    pub try_interval: Duration,
    /// Attempts before the pending entry is considered exhausted
    pub retries: u32,
    /// Extra ticks past exhaustion; the lighthouse is re-queried once
    /// at the start of this window before permanent failure
    pub wait_rotation: u32,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            try_interval: Duration::from_millis(DEFAULT_HANDSHAKE_TRY_INTERVAL_MS),
            retries: DEFAULT_HANDSHAKE_RETRIES,
            wait_rotation: DEFAULT_HANDSHAKE_WAIT_ROTATION,
        }
    }
}

struct Pending {
    initiator: InitiatorState,
    local_index: u32,
    ticks: u32,
    tried: Vec<SocketAddrV4>,
    requeried: bool,
}

/// Pending session table and handshake state machine driver
pub struct HandshakeManager {
    main: Arc<HostMap>,
    pending_hosts: Arc<HostMap>,
    pending: RwLock<HashMap<VpnIp, Pending>>,
    lighthouse: Arc<Lighthouse>,
    udp: Arc<UdpListenerPool>,
    cert_state: Arc<CertState>,
    suite: CipherSuite,
    settings: HandshakeSettings,
    static_map: HashMap<VpnIp, Vec<SocketAddrV4>>,
    shutdown: Notify,
}

impl HandshakeManager {
    /// Create the manager and its pending host map
    pub fn new(
        main: Arc<HostMap>,
        lighthouse: Arc<Lighthouse>,
        udp: Arc<UdpListenerPool>,
        cert_state: Arc<CertState>,
        suite: CipherSuite,
        settings: HandshakeSettings,
        static_map: HashMap<VpnIp, Vec<SocketAddrV4>>,
    ) -> Arc<Self> {
        let pending_hosts = Arc::new(HostMap::new("pending", main.vpn_subnet(), Vec::new()));

        Arc::new(Self {
            main,
            pending_hosts,
            pending: RwLock::new(HashMap::new()),
            lighthouse,
            udp,
            cert_state,
            suite,
            settings,
            static_map,
            shutdown: Notify::new(),
        })
    }

    /// The pending host map, for index uniqueness checks and inspection
    pub fn pending_map(&self) -> &Arc<HostMap> {
        &self.pending_hosts
    }

    /// Number of in-flight handshakes
    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Begin a handshake toward a peer unless one is already in flight.
    /// The first attempt goes out immediately when a candidate is known;
    /// otherwise a lighthouse query is issued and the tick loop takes over.
    pub async fn trigger(&self, vpn_ip: VpnIp) {
        if vpn_ip == self.cert_state.vpn_ip() {
            return;
        }

        let mut pending = self.pending.write().await;
        if pending.contains_key(&vpn_ip) {
            return;
        }

        let local_index = allocate_index(&[&self.main, &self.pending_hosts]).await;
        let cert_bytes = match self.cert_state.certificate.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode our certificate");
                return;
            }
        };

        let initiator = InitiatorState::new(&self.cert_state.key, local_index, cert_bytes);
        self.pending_hosts.add(HostInfo::new(vpn_ip, local_index)).await;

        let mut entry = Pending {
            initiator,
            local_index,
            ticks: 0,
            tried: Vec::new(),
            requeried: false,
        };

        let candidates = self.candidates(vpn_ip).await;
        if candidates.is_empty() {
            self.lighthouse.query(vpn_ip).await;
        } else {
            self.send_init(&mut entry, &candidates).await;
        }

        debug!(%vpn_ip, local_index, "handshake pending");
        pending.insert(vpn_ip, entry);
    }

    /// Candidate remotes in preference order: lighthouse cache first
    /// (freshest observation wins), then static map entries not already
    /// present.
    async fn candidates(&self, vpn_ip: VpnIp) -> Vec<SocketAddrV4> {
        let mut out = self.lighthouse.query_cache(vpn_ip).await;
        if let Some(statics) = self.static_map.get(&vpn_ip) {
            for remote in statics {
                if !out.contains(remote) {
                    out.push(*remote);
                }
            }
        }
        out
    }

    /// Emit message 1 to each candidate
    async fn send_init(&self, entry: &mut Pending, candidates: &[SocketAddrV4]) {
        let message = entry.initiator.message_1();
        let payload = match bincode::serialize(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not encode handshake init");
                return;
            }
        };

        let mut packet = Header::new(MsgType::Handshake, subtype::HANDSHAKE_INIT, 0, 1)
            .encode()
            .to_vec();
        packet.extend_from_slice(&payload);

        for remote in candidates {
            if let Err(e) = self.udp.send_to(&packet, SocketAddr::V4(*remote)).await {
                debug!(%remote, error = %e, "handshake init send failed");
            }
            if !entry.tried.contains(remote) {
                entry.tried.push(*remote);
            }
        }
    }

    /// The retry tick loop; runs until `stop`
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.try_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.tick().await,
                    _ = manager.shutdown.notified() => break,
                }
            }
        })
    }

    /// Stop the tick loop
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// One pass over the pending table
    pub async fn tick(&self) {
        let retries = self.settings.retries;
        let rotation = self.settings.wait_rotation;

        let mut pending = self.pending.write().await;
        let mut expired = Vec::new();

        let vpn_ips: Vec<VpnIp> = pending.keys().copied().collect();
        for vpn_ip in vpn_ips {
            let candidates = self.candidates(vpn_ip).await;
            let entry = match pending.get_mut(&vpn_ip) {
                Some(e) => e,
                None => continue,
            };
            entry.ticks += 1;

            if entry.ticks <= retries {
                if candidates.is_empty() {
                    self.lighthouse.query(vpn_ip).await;
                } else {
                    self.send_init(entry, &candidates).await;
                }
            } else if entry.ticks > retries + rotation {
                expired.push(vpn_ip);
            } else {
                // exhausted: one final lighthouse query, then only
                // remotes we have not tried yet get a message
                if !entry.requeried {
                    entry.requeried = true;
                    self.lighthouse.query(vpn_ip).await;
                }
                let fresh: Vec<SocketAddrV4> = candidates
                    .into_iter()
                    .filter(|c| !entry.tried.contains(c))
                    .collect();
                if !fresh.is_empty() {
                    self.send_init(entry, &fresh).await;
                }
            }
        }

        for vpn_ip in expired {
            pending.remove(&vpn_ip);
            self.pending_hosts.remove_vpn_ip(vpn_ip).await;
            info!(%vpn_ip, "handshake abandoned after retries");
        }
    }

    /// Responder path: validate an initiation, answer it and install the
    /// session. Validation failures drop silently at debug level to avoid
    /// amplification.
    pub async fn handle_init(&self, from: SocketAddr, payload: &[u8]) -> CoreResult<()> {
        let from = match from {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Ok(()),
        };

        let init: HandshakeInit = bincode::deserialize(payload)
            .map_err(|e| CoreError::HandshakeFailed(format!("bad init payload: {}", e)))?;

        let now = current_timestamp();
        init.validate_timestamp(now)?;

        let peer_cert = Certificate::decode(&init.certificate)?;
        let peer_vpn = peer_cert.primary_ip()?;
        self.cert_state.verify_peer(&peer_cert, now, None).await?;

        if peer_vpn == self.cert_state.vpn_ip() {
            return Err(CoreError::HandshakeFailed(
                "initiation claims our own vpn address".into(),
            ));
        }

        // Simultaneous initiation: the smaller VPN address stays initiator
        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&peer_vpn) {
                if self.cert_state.vpn_ip() < peer_vpn {
                    debug!(%peer_vpn, "handshake race, our initiation wins");
                    return Ok(());
                }
                pending.remove(&peer_vpn);
                self.pending_hosts.remove_vpn_ip(peer_vpn).await;
                debug!(%peer_vpn, "handshake race, yielding to peer");
            }
        }

        // A retransmitted initiation for a session we already answered
        // gets the cached response, not a fresh session.
        if let Some(host) = self.main.query_vpn_ip(peer_vpn).await {
            let host = host.read().await;
            if host.remote_index == init.sender_index {
                if let Some(cached) = &host.cached_response {
                    debug!(%peer_vpn, "resending cached handshake response");
                    self.udp.send_to(cached, SocketAddr::V4(from)).await?;
                    return Ok(());
                }
            }
        }

        let local_index = allocate_index(&[&self.main, &self.pending_hosts]).await;
        let my_cert = self.cert_state.certificate.encode()?;
        let peer_static = PublicKey::from_bytes(peer_cert.public_key);

        let (response, crypto) = ResponderState::respond(
            &self.cert_state.key,
            &init,
            &peer_static,
            local_index,
            my_cert,
            self.suite,
        )?;

        let payload = bincode::serialize(&response)
            .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;
        let mut packet = Header::new(
            MsgType::Handshake,
            subtype::HANDSHAKE_RESPONSE,
            init.sender_index,
            2,
        )
        .encode()
        .to_vec();
        packet.extend_from_slice(&payload);

        let mut host = HostInfo::new(peer_vpn, local_index);
        host.remote_index = init.sender_index;
        host.set_remote(from);
        host.connection = Some(ConnectionState::new(crypto, self.suite, peer_cert));
        host.cached_response = Some(packet.clone());

        let (_, displaced) = self.main.add(host).await;
        if let Some(old) = displaced {
            self.close_displaced(old).await;
        }

        self.udp.send_to(&packet, SocketAddr::V4(from)).await?;
        info!(vpn_ip = %peer_vpn, remote = %from, local_index, "handshake answered, session ready");
        Ok(())
    }

    /// Initiator path: verify the response, derive keys and install the
    /// session. The pending entry survives a failed response so retries
    /// continue.
    pub async fn handle_response(
        &self,
        from: SocketAddr,
        header: &Header,
        payload: &[u8],
    ) -> CoreResult<()> {
        let from = match from {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Ok(()),
        };

        let response: HandshakeResponse = bincode::deserialize(payload)
            .map_err(|e| CoreError::HandshakeFailed(format!("bad response payload: {}", e)))?;

        let mut pending = self.pending.write().await;
        let vpn_ip = pending
            .iter()
            .find(|(_, p)| p.local_index == header.remote_index)
            .map(|(ip, _)| *ip);
        let Some(vpn_ip) = vpn_ip else {
            return Err(CoreError::UnknownIndex(header.remote_index));
        };

        let entry = pending.get_mut(&vpn_ip).expect("pending entry vanished");

        let cert_bytes = entry.initiator.read_certificate(&response)?;
        let peer_cert = Certificate::decode(&cert_bytes)?;
        // The responder must claim the address we actually dialed
        self.cert_state
            .verify_peer(&peer_cert, current_timestamp(), Some(vpn_ip))
            .await?;

        let peer_static = PublicKey::from_bytes(peer_cert.public_key);
        let (crypto, _) = entry.initiator.finalize(&response, &peer_static, self.suite)?;

        let local_index = entry.local_index;
        pending.remove(&vpn_ip);
        drop(pending);
        self.pending_hosts.remove_vpn_ip(vpn_ip).await;

        let mut host = HostInfo::new(vpn_ip, local_index);
        host.remote_index = response.sender_index;
        host.set_remote(from);
        host.connection = Some(ConnectionState::new(crypto, self.suite, peer_cert));

        let (_, displaced) = self.main.add(host).await;
        if let Some(old) = displaced {
            self.close_displaced(old).await;
        }

        info!(%vpn_ip, remote = %from, local_index, "handshake complete, session ready");
        Ok(())
    }

    /// Best-effort close of a session replaced by a fresher one
    async fn close_displaced(&self, old: Arc<tokio::sync::RwLock<HostInfo>>) {
        let old = old.read().await;
        if !old.is_ready() {
            return;
        }
        if let Ok((remote, packet)) = old.seal(MsgType::CloseTunnel, 0, &[]) {
            let _ = self.udp.send_to(&packet, SocketAddr::V4(remote)).await;
            debug!(vpn_ip = %old.vpn_ip, %remote, "closed displaced session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{ca_handle, CaPool};
    use crate::lighthouse::PunchSettings;
    use ipnet::Ipv4Net;
    use lantern_crypto::PrivateKey;
    use std::net::Ipv4Addr;

    fn subnet() -> Ipv4Net {
        "10.0.0.0/24".parse().unwrap()
    }

    fn vpn(last: u8) -> VpnIp {
        VpnIp::from(Ipv4Addr::new(10, 0, 0, last))
    }

    struct Node {
        manager: Arc<HandshakeManager>,
        udp: Arc<UdpListenerPool>,
        main: Arc<HostMap>,
        lighthouse: Arc<Lighthouse>,
    }

    async fn node(last: u8, settings: HandshakeSettings) -> Node {
        let key = PrivateKey::generate();
        let cert = Certificate {
            name: format!("node-{}", last),
            public_key: key.public_key().to_bytes(),
            vpn_ips: vec![vpn(last)],
            subnet_prefix: 24,
            groups: vec![],
            not_before: 0,
            not_after: u64::MAX,
            issuer: "ca-1".into(),
        };
        let ca = ca_handle(CaPool::new(["ca-1".to_string()]));
        let cert_state = Arc::new(CertState::new(cert, key, ca).unwrap());

        let udp = Arc::new(
            UdpListenerPool::listen("127.0.0.1", 0, 1, false)
                .await
                .unwrap(),
        );
        let main = Arc::new(HostMap::new("main", subnet(), vec![]));
        let lighthouse = Arc::new(Lighthouse::new(
            false,
            vpn(last),
            vec![],
            Duration::from_secs(10),
            Duration::from_secs(60),
            udp.local_addr().port(),
            PunchSettings::default(),
            udp.clone(),
            main.clone(),
        ));

        let manager = HandshakeManager::new(
            main.clone(),
            lighthouse.clone(),
            udp.clone(),
            cert_state,
            CipherSuite::ChaChaPoly,
            settings,
            HashMap::new(),
        );

        Node {
            manager,
            udp,
            main,
            lighthouse,
        }
    }

    fn local_v4(pool: &UdpListenerPool) -> SocketAddrV4 {
        match pool.local_addr() {
            SocketAddr::V4(v4) => v4,
            _ => panic!("expected v4"),
        }
    }

    async fn recv(pool: &UdpListenerPool) -> (SocketAddr, Header, Vec<u8>) {
        let datagram = tokio::time::timeout(Duration::from_secs(2), pool.recv(0))
            .await
            .expect("recv timed out")
            .unwrap()
            .expect("rebind during test");
        let header = Header::parse(&datagram.data).unwrap();
        let payload = datagram.data[lantern_network::HEADER_SIZE..].to_vec();
        (datagram.from, header, payload)
    }

    #[tokio::test]
    async fn test_cold_start_handshake() {
        let a = node(1, HandshakeSettings::default()).await;
        let b = node(2, HandshakeSettings::default()).await;

        // A knows where B lives
        a.lighthouse
            .add_static(vpn(2), vec![local_v4(&b.udp)])
            .await;

        a.manager.trigger(vpn(2)).await;
        assert_eq!(a.manager.pending_len().await, 1);
        assert!(a.manager.pending_map().query_vpn_ip(vpn(2)).await.is_some());

        // B receives the initiation and answers
        let (from, header, payload) = recv(&b.udp).await;
        assert_eq!(header.msg_type, MsgType::Handshake);
        assert_eq!(header.subtype, subtype::HANDSHAKE_INIT);
        b.manager.handle_init(from, &payload).await.unwrap();
        assert!(b.main.query_vpn_ip(vpn(1)).await.is_some());

        // A receives the response and completes
        let (from, header, payload) = recv(&a.udp).await;
        assert_eq!(header.subtype, subtype::HANDSHAKE_RESPONSE);
        a.manager.handle_response(from, &header, &payload).await.unwrap();

        assert_eq!(a.manager.pending_len().await, 0);
        assert!(a.manager.pending_map().query_vpn_ip(vpn(2)).await.is_none());

        let host = a.main.query_vpn_ip(vpn(2)).await.unwrap();
        let host = host.read().await;
        assert!(host.is_ready());
        assert_eq!(host.remote, Some(local_v4(&b.udp)));
        assert_ne!(host.remote_index, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_frees_pending_and_allows_retrigger() {
        let settings = HandshakeSettings {
            try_interval: Duration::from_millis(10),
            retries: 2,
            wait_rotation: 1,
        };
        let a = node(1, settings).await;

        // No candidates anywhere for 10.0.0.9
        a.manager.trigger(vpn(9)).await;
        assert_eq!(a.manager.pending_len().await, 1);

        // retries + wait_rotation + 1 ticks expire the entry
        for _ in 0..4 {
            a.manager.tick().await;
        }
        assert_eq!(a.manager.pending_len().await, 0);
        assert!(a.manager.pending_map().is_empty().await);

        // A fresh trigger restarts the process
        a.manager.trigger(vpn(9)).await;
        assert_eq!(a.manager.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent_while_pending() {
        let a = node(1, HandshakeSettings::default()).await;
        a.manager.trigger(vpn(9)).await;
        a.manager.trigger(vpn(9)).await;
        assert_eq!(a.manager.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_simultaneous_initiation_smaller_ip_wins() {
        let a = node(1, HandshakeSettings::default()).await;
        let b = node(2, HandshakeSettings::default()).await;

        a.lighthouse
            .add_static(vpn(2), vec![local_v4(&b.udp)])
            .await;
        b.lighthouse
            .add_static(vpn(1), vec![local_v4(&a.udp)])
            .await;

        a.manager.trigger(vpn(2)).await;
        b.manager.trigger(vpn(1)).await;

        // Both initiations are in flight; deliver each
        let (from_a, _, init_from_a) = recv(&b.udp).await;
        let (from_b, _, init_from_b) = recv(&a.udp).await;

        // A (smaller address) ignores B's initiation
        a.manager.handle_init(from_b, &init_from_b).await.unwrap();
        assert_eq!(a.manager.pending_len().await, 1);
        assert!(a.main.query_vpn_ip(vpn(2)).await.is_none());

        // B yields and answers A
        b.manager.handle_init(from_a, &init_from_a).await.unwrap();
        assert_eq!(b.manager.pending_len().await, 0);
        assert!(b.main.query_vpn_ip(vpn(1)).await.is_some());

        // A completes as the surviving initiator
        let (from, header, payload) = recv(&a.udp).await;
        assert_eq!(header.subtype, subtype::HANDSHAKE_RESPONSE);
        a.manager.handle_response(from, &header, &payload).await.unwrap();

        assert!(a.main.query_vpn_ip(vpn(2)).await.unwrap().read().await.is_ready());
        assert_eq!(a.manager.pending_len().await, 0);
        assert_eq!(b.manager.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_init_gets_cached_response() {
        let a = node(1, HandshakeSettings::default()).await;
        let b = node(2, HandshakeSettings::default()).await;

        a.lighthouse
            .add_static(vpn(2), vec![local_v4(&b.udp)])
            .await;
        a.manager.trigger(vpn(2)).await;

        let (from, _, payload) = recv(&b.udp).await;
        b.manager.handle_init(from, &payload).await.unwrap();
        let first = recv(&a.udp).await;

        let index_before = b.main.query_vpn_ip(vpn(1)).await.unwrap().read().await.local_index;

        // The same initiation again must not build a second session
        b.manager.handle_init(from, &payload).await.unwrap();
        let second = recv(&a.udp).await;

        let index_after = b.main.query_vpn_ip(vpn(1)).await.unwrap().read().await.local_index;
        assert_eq!(index_before, index_after);
        assert_eq!(first.2, second.2);
    }

    #[tokio::test]
    async fn test_untrusted_initiation_rejected() {
        let a = node(1, HandshakeSettings::default()).await;

        // An initiator whose certificate a's trust root does not cover
        let rogue_key = PrivateKey::generate();
        let rogue_cert = Certificate {
            name: "rogue".into(),
            public_key: rogue_key.public_key().to_bytes(),
            vpn_ips: vec![vpn(66)],
            subnet_prefix: 24,
            groups: vec![],
            not_before: 0,
            not_after: u64::MAX,
            issuer: "rogue-ca".into(),
        };
        let init = InitiatorState::new(&rogue_key, 7, rogue_cert.encode().unwrap());
        let payload = bincode::serialize(&init.message_1()).unwrap();

        let from: SocketAddr = "203.0.113.5:4242".parse().unwrap();
        assert!(a.manager.handle_init(from, &payload).await.is_err());
        assert!(a.main.query_vpn_ip(vpn(66)).await.is_none());
    }
}

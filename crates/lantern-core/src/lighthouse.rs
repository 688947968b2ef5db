//! Lighthouse: Rendezvous Directory and Punch Coordination
//!
//! A lighthouse server records where each node was last reachable and
//! answers "where is VPN IP X right now?". Clients push their own
//! endpoints on an interval and learn peers from query replies. When a
//! node asks for a peer behind NAT, the lighthouse forwards a punch
//! notification to the target so both sides can open their mappings at
//! the same time.
//!
//! Learned entries expire after a TTL; entries loaded from the static
//! host map never do. Learned endpoints pass the remote allow-list and
//! advertised endpoints pass the local allow-list.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, trace, warn};

use lantern_network::header::{subtype, Header, MsgType};
use lantern_network::udp::UdpListenerPool;

use crate::allowlist::AllowList;
use crate::error::{CoreError, CoreResult};
use crate::hostmap::HostMap;
use crate::VpnIp;

/// Hole-punching participation knobs
#[derive(Debug, Clone, Copy)]
pub struct PunchSettings {
    /// Emit punch datagrams when a punch notification arrives
    pub punch: bool,
    /// Also answer a punch notification with a reverse handshake
    pub respond: bool,
    /// How long to wait before punching, synchronizing with the peer
    pub delay: Duration,
}

impl Default for PunchSettings {
    fn default() -> Self {
        Self {
            punch: false,
            respond: false,
            delay: Duration::from_millis(500),
        }
    }
}

/// Lighthouse protocol messages, carried as `LightHouse` packets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LighthouseMessage {
    /// Where is `target` right now?
    HostQuery { sender: VpnIp, target: VpnIp },

    /// Everything the lighthouse knows about `target`
    HostQueryReply {
        target: VpnIp,
        endpoints: Vec<SocketAddrV4>,
    },

    /// A node reporting its own reachable endpoints
    HostUpdate {
        sender: VpnIp,
        endpoints: Vec<SocketAddrV4>,
    },

    /// `sender` wants to reach you and is listening on these endpoints
    Punch {
        sender: VpnIp,
        endpoints: Vec<SocketAddrV4>,
    },
}

impl LighthouseMessage {
    /// Encode into a `LightHouse` datagram, header included
    pub fn to_packet(&self) -> CoreResult<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| CoreError::Config(e.to_string()))?;
        let mut packet = Header::new(MsgType::LightHouse, 0, 0, 0).encode().to_vec();
        packet.extend_from_slice(&payload);
        Ok(packet)
    }

    /// Decode from a `LightHouse` packet payload
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(payload)
            .map_err(|e| CoreError::Config(format!("bad lighthouse payload: {}", e)))
    }
}

struct CacheEntry {
    endpoints: Vec<SocketAddrV4>,
    last_seen: Instant,
    is_static: bool,
}

/// Lighthouse client and, when `am_lighthouse` is set, server
pub struct Lighthouse {
    am_lighthouse: bool,
    my_vpn_ip: VpnIp,
    lighthouses: Vec<VpnIp>,
    interval: Duration,
    ttl: Duration,
    punch: PunchSettings,
    advertise_port: u16,
    udp: Arc<UdpListenerPool>,
    hostmap: Arc<HostMap>,
    cache: RwLock<HashMap<VpnIp, CacheEntry>>,
    remote_allow: AllowList,
    local_allow: AllowList,
    local_addresses: RwLock<Vec<Ipv4Addr>>,
    punch_respond_tx: RwLock<Option<mpsc::Sender<VpnIp>>>,
    shutdown: Notify,
}

impl Lighthouse {
    /// Create a lighthouse client/server
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        am_lighthouse: bool,
        my_vpn_ip: VpnIp,
        lighthouses: Vec<VpnIp>,
        interval: Duration,
        ttl: Duration,
        advertise_port: u16,
        punch: PunchSettings,
        udp: Arc<UdpListenerPool>,
        hostmap: Arc<HostMap>,
    ) -> Self {
        if am_lighthouse && !lighthouses.is_empty() {
            warn!("am_lighthouse is set but upstream lighthouses are configured");
        }

        Self {
            am_lighthouse,
            my_vpn_ip,
            lighthouses,
            interval,
            ttl,
            punch,
            advertise_port,
            udp,
            hostmap,
            cache: RwLock::new(HashMap::new()),
            remote_allow: AllowList::default(),
            local_allow: AllowList::default(),
            local_addresses: RwLock::new(Vec::new()),
            punch_respond_tx: RwLock::new(None),
            shutdown: Notify::new(),
        }
    }

    /// Filter applied to endpoints learned from the network
    pub fn set_remote_allow_list(&mut self, list: AllowList) {
        self.remote_allow = list;
    }

    /// Filter applied to our own addresses before advertising them
    pub fn set_local_allow_list(&mut self, list: AllowList) {
        self.local_allow = list;
    }

    /// Channel notified when a punch notification asks for a reverse
    /// handshake (`punchy.respond`)
    pub async fn set_punch_respond_channel(&self, tx: mpsc::Sender<VpnIp>) {
        *self.punch_respond_tx.write().await = Some(tx);
    }

    /// Addresses advertised in host updates, before allow-list filtering
    pub async fn set_local_addresses(&self, addrs: Vec<Ipv4Addr>) {
        *self.local_addresses.write().await = addrs;
    }

    /// Load one static host map entry; never expires
    pub async fn add_static(&self, vpn_ip: VpnIp, endpoints: Vec<SocketAddrV4>) {
        let mut cache = self.cache.write().await;
        cache.insert(
            vpn_ip,
            CacheEntry {
                endpoints,
                last_seen: Instant::now(),
                is_static: true,
            },
        );
    }

    /// Every configured upstream lighthouse must have a static entry,
    /// otherwise it can never be queried.
    pub async fn validate_static_entries(&self) -> CoreResult<()> {
        let cache = self.cache.read().await;
        for lh in &self.lighthouses {
            match cache.get(lh) {
                Some(entry) if !entry.endpoints.is_empty() => {}
                _ => {
                    return Err(CoreError::Config(format!(
                        "lighthouse {} has no static host map entry",
                        lh
                    )))
                }
            }
        }
        Ok(())
    }

    /// Everything currently cached for a peer
    pub async fn query_cache(&self, vpn_ip: VpnIp) -> Vec<SocketAddrV4> {
        self.cache
            .read()
            .await
            .get(&vpn_ip)
            .map(|e| e.endpoints.clone())
            .unwrap_or_default()
    }

    /// Ask every upstream lighthouse where `target` is
    pub async fn query(&self, target: VpnIp) {
        if self.am_lighthouse {
            return;
        }

        let message = LighthouseMessage::HostQuery {
            sender: self.my_vpn_ip,
            target,
        };
        let packet = match message.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode host query");
                return;
            }
        };

        for lh in &self.lighthouses {
            for endpoint in self.query_cache(*lh).await {
                trace!(%target, lighthouse = %lh, %endpoint, "host query");
                let _ = self.udp.send_to(&packet, SocketAddr::V4(endpoint)).await;
            }
        }
    }

    /// Push our own endpoints to every upstream lighthouse
    pub async fn send_update(&self) {
        if self.am_lighthouse {
            return;
        }

        let endpoints: Vec<SocketAddrV4> = self
            .local_addresses
            .read()
            .await
            .iter()
            .filter(|addr| self.local_allow.allow(**addr))
            .map(|addr| SocketAddrV4::new(*addr, self.advertise_port))
            .collect();

        if endpoints.is_empty() {
            return;
        }

        let message = LighthouseMessage::HostUpdate {
            sender: self.my_vpn_ip,
            endpoints,
        };
        let packet = match message.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode host update");
                return;
            }
        };

        for lh in &self.lighthouses {
            for endpoint in self.query_cache(*lh).await {
                let _ = self.udp.send_to(&packet, SocketAddr::V4(endpoint)).await;
            }
        }
    }

    /// Periodic worker: host updates on the interval, stale entry purge
    pub fn start_update_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let lighthouse = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lighthouse.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        lighthouse.send_update().await;
                        lighthouse.purge_stale().await;
                    }
                    _ = lighthouse.shutdown.notified() => break,
                }
            }
        })
    }

    /// Stop the update worker
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Drop learned entries older than the TTL; static entries stay
    pub async fn purge_stale(&self) {
        let ttl = self.ttl;
        let mut cache = self.cache.write().await;
        cache.retain(|vpn_ip, entry| {
            let keep = entry.is_static || entry.last_seen.elapsed() < ttl;
            if !keep {
                debug!(%vpn_ip, "purged stale lighthouse entry");
            }
            keep
        });
    }

    /// Dispatch one received `LightHouse` packet
    pub async fn handle_message(&self, from: SocketAddr, payload: &[u8]) -> CoreResult<()> {
        let from = match from {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Ok(()), // IPv4 underlay only
        };

        match LighthouseMessage::decode(payload)? {
            LighthouseMessage::HostQuery { sender, target } => {
                self.handle_query(from, sender, target).await
            }
            LighthouseMessage::HostQueryReply { target, endpoints } => {
                self.handle_reply(target, endpoints).await
            }
            LighthouseMessage::HostUpdate { sender, endpoints } => {
                self.handle_update(from, sender, endpoints).await
            }
            LighthouseMessage::Punch { sender, endpoints } => {
                self.handle_punch(sender, endpoints).await
            }
        }
    }

    async fn handle_query(
        &self,
        from: SocketAddrV4,
        sender: VpnIp,
        target: VpnIp,
    ) -> CoreResult<()> {
        if !self.am_lighthouse {
            trace!(%sender, %target, "ignoring host query, not a lighthouse");
            return Ok(());
        }

        // The query source is itself a fresh observation of the sender
        self.record(sender, vec![from], Some(from)).await;

        let endpoints = self.query_cache(target).await;
        let reply = LighthouseMessage::HostQueryReply {
            target,
            endpoints: endpoints.clone(),
        };
        self.udp
            .send_to(&reply.to_packet()?, SocketAddr::V4(from))
            .await?;

        // Tell the target someone wants in, so it can punch out
        let sender_endpoints = self.query_cache(sender).await;
        if !endpoints.is_empty() && !sender_endpoints.is_empty() {
            let punch = LighthouseMessage::Punch {
                sender,
                endpoints: sender_endpoints,
            };
            let packet = punch.to_packet()?;
            for endpoint in endpoints {
                let _ = self.udp.send_to(&packet, SocketAddr::V4(endpoint)).await;
            }
        }

        Ok(())
    }

    async fn handle_reply(
        &self,
        target: VpnIp,
        endpoints: Vec<SocketAddrV4>,
    ) -> CoreResult<()> {
        let allowed: Vec<SocketAddrV4> = endpoints
            .into_iter()
            .filter(|ep| self.remote_allow.allow(*ep.ip()))
            .collect();

        if allowed.is_empty() {
            return Ok(());
        }

        trace!(%target, count = allowed.len(), "learned endpoints from lighthouse");
        self.record(target, allowed.clone(), None).await;

        for endpoint in allowed {
            self.hostmap.add_remote(target, endpoint).await;
        }
        Ok(())
    }

    async fn handle_update(
        &self,
        from: SocketAddrV4,
        sender: VpnIp,
        endpoints: Vec<SocketAddrV4>,
    ) -> CoreResult<()> {
        if !self.am_lighthouse {
            return Ok(());
        }

        let allowed: Vec<SocketAddrV4> = endpoints
            .into_iter()
            .filter(|ep| self.remote_allow.allow(*ep.ip()))
            .collect();

        self.record(sender, allowed, Some(from)).await;
        Ok(())
    }

    async fn handle_punch(&self, sender: VpnIp, endpoints: Vec<SocketAddrV4>) -> CoreResult<()> {
        if !self.punch.punch {
            return Ok(());
        }

        let endpoints: Vec<SocketAddrV4> = endpoints
            .into_iter()
            .filter(|ep| self.remote_allow.allow(*ep.ip()))
            .collect();
        if endpoints.is_empty() {
            return Ok(());
        }

        debug!(%sender, count = endpoints.len(), "punching");
        let udp = self.udp.clone();
        let delay = self.punch.delay;
        let respond = self.punch.respond;
        let respond_tx = self.punch_respond_tx.read().await.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let punch = Header::new(MsgType::Test, subtype::PUNCH, 0, 0).encode();
            for endpoint in endpoints {
                let _ = udp.send_to(&punch, SocketAddr::V4(endpoint)).await;
            }
            if respond {
                if let Some(tx) = respond_tx {
                    let _ = tx.send(sender).await;
                }
            }
        });

        Ok(())
    }

    /// Merge an observation into the cache. `observed` is the packet
    /// source itself, which always counts as an endpoint.
    async fn record(
        &self,
        vpn_ip: VpnIp,
        endpoints: Vec<SocketAddrV4>,
        observed: Option<SocketAddrV4>,
    ) {
        let mut cache = self.cache.write().await;
        let entry = cache.entry(vpn_ip).or_insert_with(|| CacheEntry {
            endpoints: Vec::new(),
            last_seen: Instant::now(),
            is_static: false,
        });

        for ep in endpoints.into_iter().chain(observed) {
            if !entry.endpoints.contains(&ep) {
                entry.endpoints.push(ep);
            }
        }
        entry.last_seen = Instant::now();
    }
}

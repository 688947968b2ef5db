//! Typed Configuration
//!
//! The whole daemon configuration as one typed record with serde defaults,
//! loaded from TOML. Unknown top-level keys are collected as warnings
//! instead of errors so a newer config file degrades gracefully on an
//! older node. The deprecated `local_range` key is merged into
//! `preferred_ranges`.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use lantern_crypto::CipherSuite;

use crate::allowlist::AllowList;
use crate::error::{CoreError, CoreResult};
use crate::firewall::{Direction, FirewallRule, FirewallRuleSet, Proto};
use crate::handshake_manager::HandshakeSettings;
use crate::lighthouse::PunchSettings;
use crate::VpnIp;

/// Certificate material locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Trusted CA fingerprints file, one per line
    pub ca: String,
    /// Our certificate file
    pub cert: String,
    /// Our private key file
    pub key: String,
}

/// UDP listener knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    /// 0 picks an ephemeral port, discovered at runtime
    pub port: u16,
    /// UDP receive worker count; more than one enables SO_REUSEPORT
    pub routines: usize,
    /// Datagrams a worker processes before yielding
    pub batch: usize,
    pub read_buffer: Option<usize>,
    pub write_buffer: Option<usize>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            routines: 1,
            batch: 64,
            read_buffer: None,
            write_buffer: None,
        }
    }
}

/// One tunnelled non-VPN route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsafeRoute {
    /// Inner destination cidr
    pub route: String,
    /// The gateway peer's VPN address
    pub via: String,
}

/// TUN device knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunSettings {
    pub dev: String,
    pub mtu: usize,
    pub tx_queue: usize,
    pub routines: usize,
    pub drop_local_broadcast: bool,
    pub drop_multicast: bool,
    pub unsafe_routes: Vec<UnsafeRoute>,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            dev: "lantern0".to_string(),
            mtu: lantern_network::DEFAULT_MTU,
            tx_queue: 500,
            routines: 1,
            drop_local_broadcast: false,
            drop_multicast: false,
            unsafe_routes: Vec::new(),
        }
    }
}

/// The local allow-list carries interface masks next to the cidr rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAllowListConfig {
    pub cidrs: BTreeMap<String, bool>,
    pub interfaces: BTreeMap<String, bool>,
}

/// Lighthouse role and filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseSettings {
    pub am_lighthouse: bool,
    /// Upstream lighthouse VPN addresses
    pub hosts: Vec<String>,
    /// Self-update cadence in seconds
    pub interval: u64,
    /// Served by an external DNS collaborator; recognized, not consumed here
    pub serve_dns: bool,
    pub remote_allow_list: BTreeMap<String, bool>,
    pub local_allow_list: LocalAllowListConfig,
}

impl Default for LighthouseSettings {
    fn default() -> Self {
        Self {
            am_lighthouse: false,
            hosts: Vec::new(),
            interval: crate::DEFAULT_LIGHTHOUSE_INTERVAL_SECS,
            serve_dns: false,
            remote_allow_list: BTreeMap::new(),
            local_allow_list: LocalAllowListConfig::default(),
        }
    }
}

/// Handshake retry schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeTimers {
    pub try_interval_ms: u64,
    pub retries: u32,
    pub wait_rotation: u32,
}

impl Default for HandshakeTimers {
    fn default() -> Self {
        Self {
            try_interval_ms: crate::DEFAULT_HANDSHAKE_TRY_INTERVAL_MS,
            retries: crate::DEFAULT_HANDSHAKE_RETRIES,
            wait_rotation: crate::DEFAULT_HANDSHAKE_WAIT_ROTATION,
        }
    }
}

/// Session liveness timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timers {
    pub connection_alive_interval: u64,
    pub pending_deletion_interval: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            connection_alive_interval: crate::DEFAULT_CHECK_INTERVAL_SECS,
            pending_deletion_interval: crate::DEFAULT_PENDING_DELETION_SECS,
        }
    }
}

/// Hole punching participation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchyConfig {
    pub punch: bool,
    pub respond: bool,
    pub delay_ms: u64,
}

impl Default for PunchyConfig {
    fn default() -> Self {
        Self {
            punch: false,
            respond: false,
            delay_ms: 500,
        }
    }
}

/// One configured firewall rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub port: String,
    pub proto: String,
    pub host: Option<String>,
    pub groups: Vec<String>,
    pub cidr: Option<String>,
    pub ca_fingerprint: Option<String>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            port: "any".to_string(),
            proto: "any".to_string(),
            host: None,
            groups: Vec::new(),
            cidr: None,
            ca_fingerprint: None,
        }
    }
}

/// Firewall rule tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub outbound: Vec<RuleConfig>,
    pub inbound: Vec<RuleConfig>,
}

/// The complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pki: PkiConfig,
    pub listen: ListenConfig,
    pub tun: TunSettings,
    pub lighthouse: LighthouseSettings,
    pub handshakes: HandshakeTimers,
    pub timers: Timers,
    pub punchy: PunchyConfig,
    pub firewall: FirewallConfig,
    /// Cidrs whose membership promotes an observed remote
    pub preferred_ranges: Vec<String>,
    /// Deprecated alias, merged into `preferred_ranges`
    pub local_range: Option<String>,
    /// VPN address for packets with no route; unset or 0.0.0.0 means drop
    pub default_route: Option<String>,
    pub cipher: String,
    /// VPN address -> `host:port` entries, resolved at startup
    pub static_host_map: BTreeMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pki: PkiConfig::default(),
            listen: ListenConfig::default(),
            tun: TunSettings::default(),
            lighthouse: LighthouseSettings::default(),
            handshakes: HandshakeTimers::default(),
            timers: Timers::default(),
            punchy: PunchyConfig::default(),
            firewall: FirewallConfig::default(),
            preferred_ranges: Vec::new(),
            local_range: None,
            default_route: None,
            cipher: "aes".to_string(),
            static_host_map: BTreeMap::new(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "pki",
    "listen",
    "tun",
    "lighthouse",
    "handshakes",
    "timers",
    "punchy",
    "firewall",
    "preferred_ranges",
    "local_range",
    "default_route",
    "cipher",
    "static_host_map",
    // consumed by external collaborators, not by the engine
    "sshd",
    "stats",
    "logging",
];

impl Config {
    /// Parse a TOML document. Returns the config plus a warning line for
    /// every unrecognized top-level key.
    pub fn from_toml(source: &str) -> CoreResult<(Self, Vec<String>)> {
        let value: toml::Value = source
            .parse()
            .map_err(|e| CoreError::Config(format!("config parse error: {}", e)))?;

        let mut warnings = Vec::new();
        if let Some(table) = value.as_table() {
            for key in table.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    warnings.push(format!("unknown config key: {}", key));
                }
            }
        }

        let config: Config = value
            .try_into()
            .map_err(|e| CoreError::Config(format!("config error: {}", e)))?;
        Ok((config, warnings))
    }

    /// Merge `preferred_ranges` with the deprecated `local_range` alias.
    /// The second return value reports whether the alias was used.
    pub fn preferred_ranges(&self) -> CoreResult<(Vec<Ipv4Net>, bool)> {
        let mut ranges = Vec::with_capacity(self.preferred_ranges.len() + 1);
        for raw in &self.preferred_ranges {
            let net: Ipv4Net = raw
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid preferred range: {}", raw)))?;
            if !ranges.contains(&net) {
                ranges.push(net);
            }
        }

        let mut deprecated = false;
        if let Some(raw) = &self.local_range {
            deprecated = true;
            let net: Ipv4Net = raw
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid local_range: {}", raw)))?;
            if !ranges.contains(&net) {
                ranges.push(net);
            }
        }

        Ok((ranges, deprecated))
    }

    /// The configured default route; 0.0.0.0 means "no default route"
    pub fn default_route(&self) -> CoreResult<Option<VpnIp>> {
        match &self.default_route {
            None => Ok(None),
            Some(raw) => {
                let addr: Ipv4Addr = raw
                    .parse()
                    .map_err(|_| CoreError::Config(format!("invalid default_route: {}", raw)))?;
                if addr.is_unspecified() {
                    Ok(None)
                } else {
                    Ok(Some(VpnIp::from(addr)))
                }
            }
        }
    }

    /// The configured AEAD suite
    pub fn cipher_suite(&self) -> CoreResult<CipherSuite> {
        CipherSuite::from_name(&self.cipher)
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Handshake retry schedule
    pub fn handshake_settings(&self) -> HandshakeSettings {
        HandshakeSettings {
            try_interval: Duration::from_millis(self.handshakes.try_interval_ms.max(1)),
            retries: self.handshakes.retries,
            wait_rotation: self.handshakes.wait_rotation,
        }
    }

    /// Hole punching participation
    pub fn punch_settings(&self) -> PunchSettings {
        PunchSettings {
            punch: self.punchy.punch,
            respond: self.punchy.respond,
            delay: Duration::from_millis(self.punchy.delay_ms),
        }
    }

    /// Resolve the static host map; every entry must claim a port
    pub fn static_host_map(&self, subnet: Ipv4Net) -> CoreResult<HashMap<VpnIp, Vec<SocketAddrV4>>> {
        let mut out = HashMap::new();
        for (vpn_raw, remotes) in &self.static_host_map {
            let vpn_addr: Ipv4Addr = vpn_raw
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid static host map key: {}", vpn_raw)))?;
            if !subnet.contains(&vpn_addr) {
                return Err(CoreError::Config(format!(
                    "static host map key {} is not in subnet {}",
                    vpn_raw, subnet
                )));
            }

            let mut endpoints = Vec::with_capacity(remotes.len());
            for remote in remotes {
                let endpoint: SocketAddrV4 = remote.parse().map_err(|_| {
                    CoreError::Config(format!("invalid static host entry: {}", remote))
                })?;
                if endpoint.port() == 0 {
                    return Err(CoreError::Config(format!(
                        "static host entry {} has port 0",
                        remote
                    )));
                }
                endpoints.push(endpoint);
            }
            out.insert(VpnIp::from(vpn_addr), endpoints);
        }
        Ok(out)
    }

    /// Upstream lighthouse addresses, validated against the subnet
    pub fn lighthouse_hosts(&self, subnet: Ipv4Net) -> CoreResult<Vec<VpnIp>> {
        let mut out = Vec::with_capacity(self.lighthouse.hosts.len());
        for raw in &self.lighthouse.hosts {
            let addr: Ipv4Addr = raw
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid lighthouse host: {}", raw)))?;
            if !subnet.contains(&addr) {
                return Err(CoreError::Config(format!(
                    "lighthouse host {} is not in subnet {}",
                    raw, subnet
                )));
            }
            out.push(VpnIp::from(addr));
        }
        Ok(out)
    }

    /// Filter on endpoints learned from the network
    pub fn remote_allow_list(&self) -> CoreResult<AllowList> {
        AllowList::from_map(&self.lighthouse.remote_allow_list)
    }

    /// Filter on our own advertised addresses
    pub fn local_allow_list(&self) -> CoreResult<AllowList> {
        let list = AllowList::from_map(&self.lighthouse.local_allow_list.cidrs)?;
        let interfaces = self
            .lighthouse
            .local_allow_list
            .interfaces
            .iter()
            .map(|(mask, verdict)| (mask.clone(), *verdict))
            .collect();
        Ok(list.with_interface_rules(interfaces))
    }

    /// Parse the tunnelled non-VPN routes
    pub fn unsafe_routes(&self, subnet: Ipv4Net) -> CoreResult<Vec<(Ipv4Net, VpnIp)>> {
        let mut out = Vec::with_capacity(self.tun.unsafe_routes.len());
        for entry in &self.tun.unsafe_routes {
            let route: Ipv4Net = entry
                .route
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid unsafe route: {}", entry.route)))?;
            let via: Ipv4Addr = entry
                .via
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid unsafe route via: {}", entry.via)))?;
            if !subnet.contains(&via) {
                return Err(CoreError::Config(format!(
                    "unsafe route gateway {} is not in subnet {}",
                    entry.via, subnet
                )));
            }
            if subnet.contains(&route.network()) {
                return Err(CoreError::Config(format!(
                    "unsafe route {} overlaps the vpn subnet {}",
                    entry.route, subnet
                )));
            }
            out.push((route, VpnIp::from(via)));
        }
        Ok(out)
    }

    /// Build the firewall rule tables
    pub fn build_ruleset(&self) -> CoreResult<FirewallRuleSet> {
        let mut rules = FirewallRuleSet::default();
        for (direction, table) in [
            (Direction::Outbound, &self.firewall.outbound),
            (Direction::Inbound, &self.firewall.inbound),
        ] {
            for raw in table {
                let (port_start, port_end) = FirewallRule::parse_port(&raw.port)?;
                let cidr = match &raw.cidr {
                    None => None,
                    Some(raw_cidr) => Some(raw_cidr.parse().map_err(|_| {
                        CoreError::Firewall(format!("invalid rule cidr: {}", raw_cidr))
                    })?),
                };
                rules.add_rule(
                    direction,
                    FirewallRule {
                        proto: Proto::from_name(&raw.proto)?,
                        port_start,
                        port_end,
                        host: raw.host.clone(),
                        groups: raw.groups.clone(),
                        cidr,
                        ca_fingerprint: raw.ca_fingerprint.clone(),
                    },
                );
            }
        }
        Ok(rules)
    }

    /// Cross-field validation for `--config-test`; `subnet` comes from the
    /// node certificate.
    pub fn validate(&self, subnet: Ipv4Net) -> CoreResult<()> {
        self.cipher_suite()?;
        self.preferred_ranges()?;
        self.default_route()?;
        self.static_host_map(subnet)?;
        self.lighthouse_hosts(subnet)?;
        self.remote_allow_list()?;
        self.local_allow_list()?;
        self.unsafe_routes(subnet)?;
        self.build_ruleset()?;

        if self.tun.mtu < 68 {
            return Err(CoreError::Config(format!("tun mtu {} too small", self.tun.mtu)));
        }
        if self.listen.routines == 0 {
            return Err(CoreError::Config("listen.routines must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Net {
        "10.0.0.0/24".parse().unwrap()
    }

    #[test]
    fn test_empty_config_gets_defaults() {
        let (config, warnings) = Config::from_toml("").unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.cipher, "aes");
        assert_eq!(config.listen.port, 0);
        assert_eq!(config.handshakes.retries, 20);
        assert_eq!(config.timers.connection_alive_interval, 5);
        config.validate(subnet()).unwrap();
    }

    #[test]
    fn test_unknown_top_level_key_warns() {
        let (_, warnings) = Config::from_toml("[lava_lamp]\nbrightness = 9\n").unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("lava_lamp"));
    }

    #[test]
    fn test_collaborator_sections_do_not_warn() {
        let source = "[sshd]\nenabled = true\n[stats]\ninterval = 10\n[logging]\nformat = \"json\"\n";
        let (_, warnings) = Config::from_toml(source).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_local_range_merges_without_duplicates() {
        let source = r#"
preferred_ranges = ["10.100.0.0/16", "172.16.0.0/12"]
local_range = "10.100.0.0/16"
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        let (ranges, deprecated) = config.preferred_ranges().unwrap();

        assert!(deprecated);
        assert_eq!(ranges.len(), 2);

        let source = r#"local_range = "192.168.0.0/16""#;
        let (config, _) = Config::from_toml(source).unwrap();
        let (ranges, deprecated) = config.preferred_ranges().unwrap();
        assert!(deprecated);
        assert_eq!(ranges, vec!["192.168.0.0/16".parse::<Ipv4Net>().unwrap()]);
    }

    #[test]
    fn test_default_route_zero_means_drop() {
        let (config, _) = Config::from_toml(r#"default_route = "0.0.0.0""#).unwrap();
        assert_eq!(config.default_route().unwrap(), None);

        let (config, _) = Config::from_toml(r#"default_route = "10.0.0.1""#).unwrap();
        assert_eq!(
            config.default_route().unwrap(),
            Some(VpnIp::from(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn test_static_host_map_parses_and_validates() {
        let source = r#"
[static_host_map]
"10.0.0.9" = ["203.0.113.5:4242", "198.51.100.7:4242"]
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        let map = config.static_host_map(subnet()).unwrap();
        let endpoints = &map[&VpnIp::from(Ipv4Addr::new(10, 0, 0, 9))];
        assert_eq!(endpoints.len(), 2);

        // Port 0 is rejected
        let source = r#"
[static_host_map]
"10.0.0.9" = ["203.0.113.5:0"]
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert!(config.static_host_map(subnet()).is_err());

        // Out-of-subnet keys are rejected
        let source = r#"
[static_host_map]
"192.168.0.9" = ["203.0.113.5:4242"]
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert!(config.static_host_map(subnet()).is_err());
    }

    #[test]
    fn test_lighthouse_hosts_must_be_in_subnet() {
        let source = r#"
[lighthouse]
hosts = ["10.0.0.1"]
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert_eq!(config.lighthouse_hosts(subnet()).unwrap().len(), 1);

        let source = r#"
[lighthouse]
hosts = ["192.168.0.1"]
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert!(config.lighthouse_hosts(subnet()).is_err());
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let (config, _) = Config::from_toml(r#"cipher = "rot13""#).unwrap();
        assert!(config.cipher_suite().is_err());
        assert!(config.validate(subnet()).is_err());
    }

    #[test]
    fn test_firewall_rules_build() {
        let source = r#"
[[firewall.outbound]]
port = "any"
proto = "any"

[[firewall.inbound]]
port = "443"
proto = "tcp"
groups = ["web"]

[[firewall.inbound]]
port = "200-300"
proto = "udp"
cidr = "10.0.0.0/24"
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        let rules = config.build_ruleset().unwrap();
        assert_eq!(rules.len(), (2, 1));
    }

    #[test]
    fn test_bad_firewall_rule_fails_validation() {
        let source = r#"
[[firewall.inbound]]
port = "70000"
proto = "tcp"
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert!(config.validate(subnet()).is_err());
    }

    #[test]
    fn test_unsafe_routes() {
        let source = r#"
[[tun.unsafe_routes]]
route = "192.168.0.0/16"
via = "10.0.0.5"
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        let routes = config.unsafe_routes(subnet()).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].1, VpnIp::from(Ipv4Addr::new(10, 0, 0, 5)));

        // Gateway outside the subnet is rejected
        let source = r#"
[[tun.unsafe_routes]]
route = "192.168.0.0/16"
via = "172.16.0.5"
"#;
        let (config, _) = Config::from_toml(source).unwrap();
        assert!(config.unsafe_routes(subnet()).is_err());
    }

    #[test]
    fn test_allow_lists_from_config() {
        let source = r#"
[lighthouse.remote_allow_list]
"0.0.0.0/0" = true
"10.0.0.0/8" = false

[lighthouse.local_allow_list.cidrs]
"172.16.0.0/12" = false

[lighthouse.local_allow_list.interfaces]
"docker*" = false
"#;
        let (config, _) = Config::from_toml(source).unwrap();

        let remote = config.remote_allow_list().unwrap();
        assert!(!remote.allow(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(remote.allow(Ipv4Addr::new(203, 0, 113, 5)));

        let local = config.local_allow_list().unwrap();
        assert!(!local.allow(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!local.allow_interface("docker0"));
        assert!(local.allow_interface("eth0"));
    }

    #[test]
    fn test_handshake_and_punch_settings() {
        let source = r#"
[handshakes]
try_interval_ms = 250
retries = 5
wait_rotation = 2

[punchy]
punch = true
respond = true
delay_ms = 100
"#;
        let (config, _) = Config::from_toml(source).unwrap();

        let hs = config.handshake_settings();
        assert_eq!(hs.try_interval, Duration::from_millis(250));
        assert_eq!(hs.retries, 5);
        assert_eq!(hs.wait_rotation, 2);

        let punch = config.punch_settings();
        assert!(punch.punch);
        assert!(punch.respond);
        assert_eq!(punch.delay, Duration::from_millis(100));
    }
}

//! Stateless Firewall
//!
//! Two rule tables, inbound and outbound. Evaluation is a pure function
//! of the direction, protocol, port, remote VPN address and a
//! certificate — the local node's certificate for outbound checks, the
//! peer's for inbound ones; there is no connection tracking. A reload
//! builds a complete new ruleset and swaps it atomically; a failed build
//! keeps the previous set. The rule hash is deterministic over the
//! canonical sorted form, so two configurations with the same rules in a
//! different order hash identically.

use std::sync::Arc;

use ipnet::Ipv4Net;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::cert::Certificate;
use crate::error::{CoreError, CoreResult};
use crate::VpnIp;

/// Transport protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Proto {
    /// Parse a configured protocol name
    pub fn from_name(name: &str) -> CoreResult<Self> {
        match name {
            "any" => Ok(Self::Any),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(CoreError::Firewall(format!("unknown proto: {}", other))),
        }
    }

    /// Does this selector cover an IP protocol number?
    pub fn matches(&self, proto: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Tcp => proto == 6,
            Self::Udp => proto == 17,
            Self::Icmp => proto == 1,
        }
    }

    fn canonical(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

/// Traffic direction relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One allow rule
///
/// A rule matches when proto and port match, the CA constraint (if any)
/// holds, and at least one of the peer selectors (host, groups, cidr)
/// matches. A rule with no peer selectors matches any peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub proto: Proto,
    /// Inclusive port range; (0, 0) means any port
    pub port_start: u16,
    pub port_end: u16,
    /// Peer certificate name, `any` matches all
    pub host: Option<String>,
    /// Peer must carry every listed group
    pub groups: Vec<String>,
    /// Remote VPN address constraint
    pub cidr: Option<Ipv4Net>,
    /// Issuing CA constraint
    pub ca_fingerprint: Option<String>,
}

impl FirewallRule {
    /// Rule matching any port and any peer for a protocol
    pub fn any(proto: Proto) -> Self {
        Self {
            proto,
            port_start: 0,
            port_end: 0,
            host: None,
            groups: Vec::new(),
            cidr: None,
            ca_fingerprint: None,
        }
    }

    /// Parse the configured port form: `any`, `N`, or `N-M`
    pub fn parse_port(value: &str) -> CoreResult<(u16, u16)> {
        if value == "any" {
            return Ok((0, 0));
        }
        if let Some((lo, hi)) = value.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| CoreError::Firewall(format!("invalid port range: {}", value)))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| CoreError::Firewall(format!("invalid port range: {}", value)))?;
            if lo == 0 || hi < lo {
                return Err(CoreError::Firewall(format!("invalid port range: {}", value)));
            }
            return Ok((lo, hi));
        }
        let port: u16 = value
            .parse()
            .map_err(|_| CoreError::Firewall(format!("invalid port: {}", value)))?;
        if port == 0 {
            return Err(CoreError::Firewall("port 0 is not addressable".into()));
        }
        Ok((port, port))
    }

    fn matches(&self, proto: u8, port: u16, cert: &Certificate, remote_ip: VpnIp) -> bool {
        if !self.proto.matches(proto) {
            return false;
        }

        if self.port_start != 0 && (port < self.port_start || port > self.port_end) {
            return false;
        }

        if let Some(fp) = &self.ca_fingerprint {
            if fp != &cert.issuer {
                return false;
            }
        }

        let has_selector =
            self.host.is_some() || !self.groups.is_empty() || self.cidr.is_some();
        if !has_selector {
            return true;
        }

        if let Some(host) = &self.host {
            if host == "any" || host == &cert.name {
                return true;
            }
        }

        if !self.groups.is_empty() && self.groups.iter().all(|g| cert.groups.contains(g)) {
            return true;
        }

        if let Some(cidr) = &self.cidr {
            if cidr.contains(&remote_ip.to_ipv4()) {
                return true;
            }
        }

        false
    }

    fn canonical(&self) -> String {
        let mut groups = self.groups.clone();
        groups.sort();
        format!(
            "proto={} ports={}-{} host={} groups={} cidr={} ca={}",
            self.proto.canonical(),
            self.port_start,
            self.port_end,
            self.host.as_deref().unwrap_or("-"),
            groups.join(","),
            self.cidr.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            self.ca_fingerprint.as_deref().unwrap_or("-"),
        )
    }
}

/// A complete inbound + outbound rule configuration
#[derive(Debug, Clone, Default)]
pub struct FirewallRuleSet {
    inbound: Vec<FirewallRule>,
    outbound: Vec<FirewallRule>,
}

impl FirewallRuleSet {
    /// Add a rule to one direction's table
    pub fn add_rule(&mut self, direction: Direction, rule: FirewallRule) {
        match direction {
            Direction::Inbound => self.inbound.push(rule),
            Direction::Outbound => self.outbound.push(rule),
        }
    }

    /// Pure evaluation: is this packet allowed?
    ///
    /// Outbound consults the local certificate, inbound the peer's.
    pub fn evaluate(
        &self,
        direction: Direction,
        proto: u8,
        port: u16,
        cert: &Certificate,
        remote_ip: VpnIp,
    ) -> bool {
        let table = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };

        table
            .iter()
            .any(|rule| rule.matches(proto, port, cert, remote_ip))
    }

    /// Deterministic hash over the canonical sorted rule form
    pub fn rule_hash(&self) -> String {
        let mut lines: Vec<String> = self
            .inbound
            .iter()
            .map(|r| format!("in {}", r.canonical()))
            .chain(self.outbound.iter().map(|r| format!("out {}", r.canonical())))
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Rule counts (inbound, outbound), for logging
    pub fn len(&self) -> (usize, usize) {
        (self.inbound.len(), self.outbound.len())
    }

    /// True when both tables are empty
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }
}

/// The live firewall: a ruleset behind an atomic swap
pub struct Firewall {
    rules: RwLock<Arc<FirewallRuleSet>>,
}

impl Firewall {
    /// Install an initial ruleset
    pub fn new(rules: FirewallRuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// The current ruleset
    pub async fn rules(&self) -> Arc<FirewallRuleSet> {
        self.rules.read().await.clone()
    }

    /// Evaluate against the current ruleset
    pub async fn evaluate(
        &self,
        direction: Direction,
        proto: u8,
        port: u16,
        cert: &Certificate,
        remote_ip: VpnIp,
    ) -> bool {
        self.rules
            .read()
            .await
            .evaluate(direction, proto, port, cert, remote_ip)
    }

    /// Swap in a freshly built ruleset
    pub async fn reload(&self, rules: FirewallRuleSet) {
        *self.rules.write().await = Arc::new(rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer_cert(name: &str, groups: &[&str]) -> Certificate {
        Certificate {
            name: name.to_string(),
            public_key: [0u8; 32],
            vpn_ips: vec![VpnIp::from(Ipv4Addr::new(10, 0, 0, 2))],
            subnet_prefix: 24,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            not_before: 0,
            not_after: u64::MAX,
            issuer: "ca-1".to_string(),
        }
    }

    fn remote() -> VpnIp {
        VpnIp::from(Ipv4Addr::new(10, 0, 0, 2))
    }

    #[test]
    fn test_parse_port_forms() {
        assert_eq!(FirewallRule::parse_port("any").unwrap(), (0, 0));
        assert_eq!(FirewallRule::parse_port("443").unwrap(), (443, 443));
        assert_eq!(FirewallRule::parse_port("200-300").unwrap(), (200, 300));
        assert!(FirewallRule::parse_port("300-200").is_err());
        assert!(FirewallRule::parse_port("0").is_err());
        assert!(FirewallRule::parse_port("http").is_err());
    }

    #[test]
    fn test_empty_ruleset_denies() {
        let rules = FirewallRuleSet::default();
        let cert = peer_cert("peer", &[]);
        assert!(!rules.evaluate(Direction::Inbound, 6, 80, &cert, remote()));
    }

    #[test]
    fn test_any_rule_allows() {
        let mut rules = FirewallRuleSet::default();
        rules.add_rule(Direction::Inbound, FirewallRule::any(Proto::Any));

        let cert = peer_cert("peer", &[]);
        assert!(rules.evaluate(Direction::Inbound, 6, 80, &cert, remote()));
        assert!(rules.evaluate(Direction::Inbound, 17, 53, &cert, remote()));
        // outbound table is independent
        assert!(!rules.evaluate(Direction::Outbound, 6, 80, &cert, remote()));
    }

    #[test]
    fn test_group_selector_requires_all_groups() {
        let mut rules = FirewallRuleSet::default();
        rules.add_rule(
            Direction::Inbound,
            FirewallRule {
                groups: vec!["servers".into(), "prod".into()],
                ..FirewallRule::any(Proto::Tcp)
            },
        );

        let both = peer_cert("peer", &["servers", "prod"]);
        let one = peer_cert("peer", &["servers"]);
        assert!(rules.evaluate(Direction::Inbound, 6, 22, &both, remote()));
        assert!(!rules.evaluate(Direction::Inbound, 6, 22, &one, remote()));
    }

    #[test]
    fn test_port_range_and_proto() {
        let mut rules = FirewallRuleSet::default();
        rules.add_rule(
            Direction::Inbound,
            FirewallRule {
                port_start: 8000,
                port_end: 8080,
                ..FirewallRule::any(Proto::Udp)
            },
        );

        let cert = peer_cert("peer", &[]);
        assert!(rules.evaluate(Direction::Inbound, 17, 8000, &cert, remote()));
        assert!(rules.evaluate(Direction::Inbound, 17, 8080, &cert, remote()));
        assert!(!rules.evaluate(Direction::Inbound, 17, 8081, &cert, remote()));
        assert!(!rules.evaluate(Direction::Inbound, 6, 8000, &cert, remote()));
    }

    #[test]
    fn test_cidr_and_ca_selectors() {
        let mut rules = FirewallRuleSet::default();
        rules.add_rule(
            Direction::Inbound,
            FirewallRule {
                cidr: Some("10.0.0.0/24".parse().unwrap()),
                ca_fingerprint: Some("ca-1".into()),
                ..FirewallRule::any(Proto::Any)
            },
        );

        let cert = peer_cert("peer", &[]);
        assert!(rules.evaluate(Direction::Inbound, 6, 1, &cert, remote()));

        let outside = VpnIp::from(Ipv4Addr::new(10, 0, 1, 2));
        assert!(!rules.evaluate(Direction::Inbound, 6, 1, &cert, outside));

        let mut wrong_ca = cert.clone();
        wrong_ca.issuer = "ca-2".into();
        assert!(!rules.evaluate(Direction::Inbound, 6, 1, &wrong_ca, remote()));
    }

    #[test]
    fn test_rule_hash_is_insertion_order_independent() {
        let rule_a = FirewallRule {
            host: Some("web".into()),
            ..FirewallRule::any(Proto::Tcp)
        };
        let rule_b = FirewallRule {
            groups: vec!["db".into()],
            ..FirewallRule::any(Proto::Udp)
        };

        let mut one = FirewallRuleSet::default();
        one.add_rule(Direction::Inbound, rule_a.clone());
        one.add_rule(Direction::Inbound, rule_b.clone());

        let mut two = FirewallRuleSet::default();
        two.add_rule(Direction::Inbound, rule_b);
        two.add_rule(Direction::Inbound, rule_a);

        assert_eq!(one.rule_hash(), two.rule_hash());
    }

    #[test]
    fn test_rule_hash_differs_across_directions() {
        let mut one = FirewallRuleSet::default();
        one.add_rule(Direction::Inbound, FirewallRule::any(Proto::Any));

        let mut two = FirewallRuleSet::default();
        two.add_rule(Direction::Outbound, FirewallRule::any(Proto::Any));

        assert_ne!(one.rule_hash(), two.rule_hash());
    }

    #[tokio::test]
    async fn test_reload_swaps_atomically() {
        let firewall = Firewall::new(FirewallRuleSet::default());
        let cert = peer_cert("peer", &[]);

        assert!(!firewall.evaluate(Direction::Inbound, 6, 80, &cert, remote()).await);

        let mut fresh = FirewallRuleSet::default();
        fresh.add_rule(Direction::Inbound, FirewallRule::any(Proto::Any));
        firewall.reload(fresh).await;

        assert!(firewall.evaluate(Direction::Inbound, 6, 80, &cert, remote()).await);
    }
}

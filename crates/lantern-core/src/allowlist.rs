//! CIDR Allow-Lists
//!
//! Ordered (CIDR, verdict) rules, first match wins. If any rule carries an
//! explicit allow the default flips to deny, otherwise unmatched addresses
//! are allowed. The local variant adds interface-name masks for filtering
//! which local addresses may be advertised.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{CoreError, CoreResult};

/// An ordered first-match-wins CIDR filter
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: Vec<(Ipv4Net, bool)>,
    interface_rules: Vec<(String, bool)>,
    default_allow: bool,
}

impl AllowList {
    /// Build from rules in evaluation order
    pub fn new(rules: Vec<(Ipv4Net, bool)>) -> Self {
        let default_allow = !rules.iter().any(|(_, allow)| *allow);
        Self {
            rules,
            interface_rules: Vec::new(),
            default_allow,
        }
    }

    /// Build from a cidr -> verdict map. Rules are ordered most specific
    /// prefix first so overlapping entries behave like a routing table.
    pub fn from_map(map: &BTreeMap<String, bool>) -> CoreResult<Self> {
        let mut rules = Vec::with_capacity(map.len());
        for (cidr, allow) in map {
            let net: Ipv4Net = cidr
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid allow list cidr: {}", cidr)))?;
            rules.push((net, *allow));
        }
        rules.sort_by(|a, b| {
            b.0.prefix_len()
                .cmp(&a.0.prefix_len())
                .then(a.0.network().cmp(&b.0.network()))
        });
        Ok(Self::new(rules))
    }

    /// Attach interface-name masks (simple `*` suffix globs)
    pub fn with_interface_rules(mut self, rules: Vec<(String, bool)>) -> Self {
        self.interface_rules = rules;
        self
    }

    /// Verdict for an address
    pub fn allow(&self, addr: Ipv4Addr) -> bool {
        for (net, verdict) in &self.rules {
            if net.contains(&addr) {
                return *verdict;
            }
        }
        self.default_allow
    }

    /// Verdict for a local interface name; unmatched names are allowed
    pub fn allow_interface(&self, name: &str) -> bool {
        for (mask, verdict) in &self.interface_rules {
            let matched = match mask.strip_suffix('*') {
                Some(prefix) => name.starts_with(prefix),
                None => name == mask,
            };
            if matched {
                return *verdict;
            }
        }
        true
    }

    /// True when no rules are configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.interface_rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_list_allows_everything() {
        let list = AllowList::new(vec![]);
        assert!(list.allow(ip("192.0.2.1")));
    }

    #[test]
    fn test_deny_only_rules_default_allow() {
        let list = AllowList::new(vec![(net("10.0.0.0/8"), false)]);

        assert!(!list.allow(ip("10.1.2.3")));
        assert!(list.allow(ip("192.0.2.1")));
    }

    #[test]
    fn test_explicit_allow_flips_default_to_deny() {
        let list = AllowList::new(vec![(net("10.0.0.0/8"), true)]);

        assert!(list.allow(ip("10.1.2.3")));
        assert!(!list.allow(ip("192.0.2.1")));
    }

    #[test]
    fn test_first_match_wins() {
        let list = AllowList::new(vec![
            (net("10.1.0.0/16"), false),
            (net("10.0.0.0/8"), true),
        ]);

        assert!(!list.allow(ip("10.1.2.3")));
        assert!(list.allow(ip("10.2.0.1")));
    }

    #[test]
    fn test_from_map_orders_most_specific_first() {
        let mut map = BTreeMap::new();
        map.insert("10.0.0.0/8".to_string(), true);
        map.insert("10.1.0.0/16".to_string(), false);

        let list = AllowList::from_map(&map).unwrap();
        assert!(!list.allow(ip("10.1.2.3")));
        assert!(list.allow(ip("10.2.0.1")));
    }

    #[test]
    fn test_from_map_rejects_garbage() {
        let mut map = BTreeMap::new();
        map.insert("not-a-cidr".to_string(), true);
        assert!(AllowList::from_map(&map).is_err());
    }

    #[test]
    fn test_interface_masks() {
        let list = AllowList::new(vec![]).with_interface_rules(vec![
            ("docker*".to_string(), false),
            ("eth0".to_string(), true),
        ]);

        assert!(!list.allow_interface("docker0"));
        assert!(list.allow_interface("eth0"));
        assert!(list.allow_interface("wlan0"));
    }
}

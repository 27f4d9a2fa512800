//! Route table: CIDR longest-prefix match plus domain patterns.
//!
//! Two parallel structures per the routing design: per-family CIDR lists
//! kept sorted by prefix length (longest first, then metric, then
//! sequence), and a domain table of exact names and `*.suffix` single-label
//! wildcards. Reads are concurrent; the flood handler, the expiry scan and
//! local advertisement serialize through the write locks.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;

use crate::mono_ms;
use trellis_proto::AgentId;

/// One learned (or local) route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// The exit agent that originated the advertisement.
    pub origin: AgentId,
    pub next_hop: AgentId,
    /// Full path starting at `next_hop`, ending at `origin`. Empty for
    /// local exit routes.
    pub path: Vec<AgentId>,
    pub metric: u16,
    pub sequence: u64,
    pub expires_at_ms: u64,
}

/// Lookup result handed to the ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub next_hop: AgentId,
    pub path: Vec<AgentId>,
    pub exit: AgentId,
}

impl RouteEntry {
    fn to_match(&self) -> RouteMatch {
        RouteMatch { next_hop: self.next_hop, path: self.path.clone(), exit: self.origin }
    }

    fn expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

#[derive(Default)]
struct DomainRoutes {
    exact: HashMap<String, Vec<RouteEntry>>,
    /// Keyed by the suffix after `*.`; matches exactly one extra label.
    wildcard: HashMap<String, Vec<RouteEntry>>,
}

/// Read-mostly route table.
#[derive(Default)]
pub struct RouteTable {
    v4: RwLock<Vec<(Ipv4Net, RouteEntry)>>,
    v6: RwLock<Vec<(Ipv6Net, RouteEntry)>>,
    domains: RwLock<DomainRoutes>,
}

/// Order: longest prefix first, then lowest metric, then lowest sequence
/// (oldest wins, avoids flapping).
fn entry_order(prefix_len_a: u8, a: &RouteEntry, prefix_len_b: u8, b: &RouteEntry) -> std::cmp::Ordering {
    prefix_len_b
        .cmp(&prefix_len_a)
        .then(a.metric.cmp(&b.metric))
        .then(a.sequence.cmp(&b.sequence))
}

fn pick_domain_best(entries: &[RouteEntry], now_ms: u64) -> Option<&RouteEntry> {
    entries
        .iter()
        .filter(|e| !e.expired(now_ms))
        .min_by(|a, b| a.metric.cmp(&b.metric).then(a.sequence.cmp(&b.sequence)))
}

impl RouteTable {
    /// Insert or refresh a CIDR route. At most one entry exists per
    /// `(origin, prefix)`; a newer sequence supersedes.
    pub fn insert_cidr(&self, net: IpNet, entry: RouteEntry) {
        match net {
            IpNet::V4(net) => insert_sorted(&mut *self.v4.write(), net.trunc(), entry),
            IpNet::V6(net) => insert_sorted(&mut *self.v6.write(), net.trunc(), entry),
        }
    }

    /// Insert or refresh a domain route (exact name or `*.suffix`).
    pub fn insert_domain(&self, pattern: &str, entry: RouteEntry) {
        let pattern = pattern.to_ascii_lowercase();
        let mut domains = self.domains.write();
        let bucket = match pattern.strip_prefix("*.") {
            Some(suffix) => domains.wildcard.entry(suffix.to_string()).or_default(),
            None => domains.exact.entry(pattern).or_default(),
        };
        match bucket.iter_mut().find(|e| e.origin == entry.origin) {
            Some(existing) => {
                if entry.sequence >= existing.sequence {
                    *existing = entry;
                }
            }
            None => bucket.push(entry),
        }
    }

    /// Longest-prefix match for one address.
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<RouteMatch> {
        let now = mono_ms();
        match ip {
            IpAddr::V4(ip) => self
                .v4
                .read()
                .iter()
                .find(|(net, e)| !e.expired(now) && net.contains(&ip))
                .map(|(_, e)| e.to_match()),
            IpAddr::V6(ip) => self
                .v6
                .read()
                .iter()
                .find(|(net, e)| !e.expired(now) && net.contains(&ip))
                .map(|(_, e)| e.to_match()),
        }
    }

    /// Domain match: exact beats wildcard; `*.suffix` matches exactly one
    /// additional label.
    pub fn lookup_domain(&self, name: &str) -> Option<RouteMatch> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let now = mono_ms();
        let domains = self.domains.read();
        if let Some(entries) = domains.exact.get(&name) {
            if let Some(best) = pick_domain_best(entries, now) {
                return Some(best.to_match());
            }
        }
        if let Some((_, suffix)) = name.split_once('.') {
            if let Some(entries) = domains.wildcard.get(suffix) {
                if let Some(best) = pick_domain_best(entries, now) {
                    return Some(best.to_match());
                }
            }
        }
        None
    }

    /// Drop every route learned through `next_hop`. Used on peer teardown,
    /// ahead of expiry.
    pub fn purge_next_hop(&self, next_hop: &AgentId) -> usize {
        let mut removed = 0;
        {
            let mut v4 = self.v4.write();
            let before = v4.len();
            v4.retain(|(_, e)| e.next_hop != *next_hop);
            removed += before - v4.len();
        }
        {
            let mut v6 = self.v6.write();
            let before = v6.len();
            v6.retain(|(_, e)| e.next_hop != *next_hop);
            removed += before - v6.len();
        }
        let mut domains_guard = self.domains.write();
        let domains = &mut *domains_guard;
        for bucket in domains.exact.values_mut().chain(domains.wildcard.values_mut()) {
            let before = bucket.len();
            bucket.retain(|e| e.next_hop != *next_hop);
            removed += before - bucket.len();
        }
        domains.exact.retain(|_, b| !b.is_empty());
        domains.wildcard.retain(|_, b| !b.is_empty());
        removed
    }

    /// Remove one origin's route for a specific CIDR (withdraw).
    pub fn remove_cidr(&self, origin: &AgentId, net: IpNet) -> bool {
        match net {
            IpNet::V4(net) => {
                let net = net.trunc();
                let mut v4 = self.v4.write();
                let before = v4.len();
                v4.retain(|(n, e)| !(e.origin == *origin && *n == net));
                before != v4.len()
            }
            IpNet::V6(net) => {
                let net = net.trunc();
                let mut v6 = self.v6.write();
                let before = v6.len();
                v6.retain(|(n, e)| !(e.origin == *origin && *n == net));
                before != v6.len()
            }
        }
    }

    /// Remove one origin's domain route (withdraw).
    pub fn remove_domain(&self, origin: &AgentId, pattern: &str) -> bool {
        let pattern = pattern.to_ascii_lowercase();
        let mut domains = self.domains.write();
        let (map, key) = match pattern.strip_prefix("*.") {
            Some(suffix) => (&mut domains.wildcard, suffix.to_string()),
            None => (&mut domains.exact, pattern),
        };
        let Some(bucket) = map.get_mut(&key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|e| e.origin != *origin);
        let removed = before != bucket.len();
        if bucket.is_empty() {
            map.remove(&key);
        }
        removed
    }

    /// Drop expired entries; returns how many went away.
    pub fn expire(&self) -> usize {
        let now = mono_ms();
        let mut removed = 0;
        {
            let mut v4 = self.v4.write();
            let before = v4.len();
            v4.retain(|(_, e)| !e.expired(now));
            removed += before - v4.len();
        }
        {
            let mut v6 = self.v6.write();
            let before = v6.len();
            v6.retain(|(_, e)| !e.expired(now));
            removed += before - v6.len();
        }
        let mut domains_guard = self.domains.write();
        let domains = &mut *domains_guard;
        for bucket in domains.exact.values_mut().chain(domains.wildcard.values_mut()) {
            let before = bucket.len();
            bucket.retain(|e| !e.expired(now));
            removed += before - bucket.len();
        }
        domains.exact.retain(|_, b| !b.is_empty());
        domains.wildcard.retain(|_, b| !b.is_empty());
        removed
    }

    /// Snapshot for the management surface: `(target, entry)` pairs.
    pub fn snapshot(&self) -> Vec<(String, RouteEntry)> {
        let mut out = Vec::new();
        for (net, e) in self.v4.read().iter() {
            out.push((net.to_string(), e.clone()));
        }
        for (net, e) in self.v6.read().iter() {
            out.push((net.to_string(), e.clone()));
        }
        let domains = self.domains.read();
        for (name, bucket) in &domains.exact {
            for e in bucket {
                out.push((name.clone(), e.clone()));
            }
        }
        for (suffix, bucket) in &domains.wildcard {
            for e in bucket {
                out.push((format!("*.{}", suffix), e.clone()));
            }
        }
        out
    }
}

fn insert_sorted<N: Copy + PartialEq + Into<IpNet>>(
    list: &mut Vec<(N, RouteEntry)>,
    net: N,
    entry: RouteEntry,
) {
    if let Some(existing) = list
        .iter_mut()
        .find(|(n, e)| *n == net && e.origin == entry.origin)
    {
        if entry.sequence >= existing.1.sequence {
            existing.1 = entry;
        }
        // Re-sort below: metric may have changed.
    } else {
        list.push((net, entry));
    }
    list.sort_by(|(na, a), (nb, b)| {
        entry_order(prefix_len(*na), a, prefix_len(*nb), b)
    });
}

fn prefix_len<N: Into<IpNet> + Copy>(net: N) -> u8 {
    net.into().prefix_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> AgentId {
        AgentId::from_bytes([b; 16])
    }

    fn entry(origin: u8, next_hop: u8, metric: u16, sequence: u64) -> RouteEntry {
        RouteEntry {
            origin: id(origin),
            next_hop: id(next_hop),
            path: vec![id(next_hop), id(origin)],
            metric,
            sequence,
            expires_at_ms: mono_ms() + 60_000,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::default();
        table.insert_cidr("0.0.0.0/0".parse().unwrap(), entry(1, 1, 0, 1));
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(2, 2, 5, 1));
        table.insert_cidr("10.5.0.0/16".parse().unwrap(), entry(3, 3, 9, 1));
        table.insert_cidr("10.5.3.100/32".parse().unwrap(), entry(4, 4, 20, 1));

        assert_eq!(table.lookup_ip("10.5.3.100".parse().unwrap()).unwrap().exit, id(4));
        assert_eq!(table.lookup_ip("10.5.9.9".parse().unwrap()).unwrap().exit, id(3));
        assert_eq!(table.lookup_ip("10.200.0.1".parse().unwrap()).unwrap().exit, id(2));
        assert_eq!(table.lookup_ip("192.0.2.1".parse().unwrap()).unwrap().exit, id(1));
    }

    #[test]
    fn v6_host_route_beats_default() {
        let table = RouteTable::default();
        table.insert_cidr("::/0".parse().unwrap(), entry(1, 1, 0, 1));
        table.insert_cidr("::1/128".parse().unwrap(), entry(2, 2, 0, 1));
        assert_eq!(table.lookup_ip("::1".parse().unwrap()).unwrap().exit, id(2));
        assert_eq!(table.lookup_ip("fd00::1".parse().unwrap()).unwrap().exit, id(1));
    }

    #[test]
    fn metric_breaks_prefix_ties() {
        let table = RouteTable::default();
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 1, 4, 10));
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(2, 2, 1, 99));
        assert_eq!(table.lookup_ip("10.1.2.3".parse().unwrap()).unwrap().exit, id(2));
    }

    #[test]
    fn sequence_breaks_metric_ties_oldest_first() {
        let table = RouteTable::default();
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 1, 2, 50));
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(2, 2, 2, 7));
        assert_eq!(table.lookup_ip("10.1.2.3".parse().unwrap()).unwrap().exit, id(2));
    }

    #[test]
    fn newer_sequence_replaces_same_origin_prefix() {
        let table = RouteTable::default();
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 2, 3, 5));
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 3, 1, 6));
        let found = table.lookup_ip("10.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(found.next_hop, id(3));
        // Stale sequence does not roll the route back.
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 2, 0, 5));
        assert_eq!(table.lookup_ip("10.1.1.1".parse().unwrap()).unwrap().next_hop, id(3));
    }

    #[test]
    fn domain_exact_beats_wildcard() {
        let table = RouteTable::default();
        table.insert_domain("*.corp.local", entry(1, 1, 0, 1));
        table.insert_domain("api.corp.local", entry(2, 2, 9, 1));
        assert_eq!(table.lookup_domain("api.corp.local").unwrap().exit, id(2));
        assert_eq!(table.lookup_domain("web.corp.local").unwrap().exit, id(1));
    }

    #[test]
    fn wildcard_matches_single_label_only() {
        let table = RouteTable::default();
        table.insert_domain("*.example.com", entry(1, 1, 0, 1));
        assert!(table.lookup_domain("a.example.com").is_some());
        assert!(table.lookup_domain("example.com").is_none());
        assert!(table.lookup_domain("a.b.example.com").is_none());
    }

    #[test]
    fn domain_lookup_is_case_insensitive() {
        let table = RouteTable::default();
        table.insert_domain("API.Corp.Local", entry(1, 1, 0, 1));
        assert!(table.lookup_domain("api.corp.local").is_some());
        assert!(table.lookup_domain("API.CORP.LOCAL.").is_some());
    }

    #[test]
    fn purge_next_hop_removes_everywhere() {
        let table = RouteTable::default();
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 7, 1, 1));
        table.insert_cidr("fd00::/8".parse().unwrap(), entry(1, 7, 1, 2));
        table.insert_domain("*.corp.local", entry(1, 7, 1, 3));
        table.insert_cidr("192.168.0.0/16".parse().unwrap(), entry(2, 8, 1, 1));
        assert_eq!(table.purge_next_hop(&id(7)), 3);
        assert!(table.lookup_ip("10.1.1.1".parse().unwrap()).is_none());
        assert!(table.lookup_domain("x.corp.local").is_none());
        assert!(table.lookup_ip("192.168.1.1".parse().unwrap()).is_some());
    }

    #[test]
    fn expiry_drops_entries() {
        let table = RouteTable::default();
        let mut stale = entry(1, 1, 0, 1);
        stale.expires_at_ms = mono_ms().saturating_sub(1);
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), stale);
        table.insert_cidr("192.168.0.0/16".parse().unwrap(), entry(2, 2, 0, 1));
        // Lookup already refuses the stale entry before the scan runs.
        assert!(table.lookup_ip("10.1.1.1".parse().unwrap()).is_none());
        assert_eq!(table.expire(), 1);
        assert!(table.lookup_ip("192.168.1.1".parse().unwrap()).is_some());
    }

    #[test]
    fn withdraw_removes_single_origin_only() {
        let table = RouteTable::default();
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(1, 1, 1, 1));
        table.insert_cidr("10.0.0.0/8".parse().unwrap(), entry(2, 2, 2, 1));
        assert!(table.remove_cidr(&id(1), "10.0.0.0/8".parse().unwrap()));
        assert_eq!(table.lookup_ip("10.1.1.1".parse().unwrap()).unwrap().exit, id(2));
    }
}

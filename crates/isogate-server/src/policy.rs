//! Inbound access policy: who may connect, and how many at once.
//!
//! - [`AccessPolicy`] holds the parsed allow/deny lists.
//! - [`AdmissionControl`] is the runtime counterpart that owns the
//!   concurrency ceiling plus an atomic counter of live handlers.

use isogate_core::{GatewayError, GatewayResult};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One allow/deny entry: an exact address or a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    network: IpAddr,
    prefix: u8,
}

impl IpRule {
    pub fn parse(entry: &str) -> GatewayResult<Self> {
        let entry = entry.trim();
        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (entry, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| GatewayError::config(format!("bad IP in access list: {entry:?}")))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| GatewayError::config(format!("bad prefix in {entry:?}")))?,
            None => max,
        };
        Ok(Self { network, prefix })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self.network, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            _ => false,
        }
    }
}

/// IPv4-mapped IPv6 peers (dual-stack listeners) compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn prefix_eq(a: &[u8], b: &[u8], prefix: u8) -> bool {
    let full = (prefix / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rem = prefix % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - rem);
    (a[full] & mask) == (b[full] & mask)
}

/// Parsed allow/deny lists.
///
/// Deny is checked first. An empty allow list admits everyone not denied.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allow: Vec<IpRule>,
    deny: Vec<IpRule>,
}

impl AccessPolicy {
    /// Parse comma-separated lists (`"10.0.0.0/8, 192.168.1.5"`).
    pub fn parse(allow: &str, deny: &str) -> GatewayResult<Self> {
        Ok(Self {
            allow: parse_list(allow)?,
            deny: parse_list(deny)?,
        })
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|r| r.matches(ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|r| r.matches(ip))
    }
}

fn parse_list(list: &str) -> GatewayResult<Vec<IpRule>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(IpRule::parse)
        .collect()
}

/// Concurrency ceiling with atomic tracking of admitted handlers.
pub struct AdmissionControl {
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a slot if one is free. The guard releases it on drop.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                counter: self.active.clone(),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII guard that frees an admission slot on drop.
/// Owns an `Arc<AtomicUsize>` so it can move into the handler task.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_lists_allow_everyone() {
        let policy = AccessPolicy::default();
        assert!(policy.is_allowed(ip("10.0.0.1")));
        assert!(policy.is_allowed(ip("::1")));
    }

    #[test]
    fn deny_beats_allow() {
        let policy = AccessPolicy::parse("10.0.0.0/8", "10.0.0.13").unwrap();
        assert!(policy.is_allowed(ip("10.0.0.12")));
        assert!(!policy.is_allowed(ip("10.0.0.13")));
    }

    #[test]
    fn absent_from_allow_list_is_rejected() {
        let policy = AccessPolicy::parse("192.168.1.5, 172.16.0.0/12", "").unwrap();
        assert!(policy.is_allowed(ip("192.168.1.5")));
        assert!(policy.is_allowed(ip("172.31.255.1")));
        assert!(!policy.is_allowed(ip("172.32.0.1")));
        assert!(!policy.is_allowed(ip("192.168.1.6")));
    }

    #[test]
    fn cidr_matching() {
        let rule = IpRule::parse("192.168.4.0/22").unwrap();
        assert!(rule.matches(ip("192.168.7.255")));
        assert!(!rule.matches(ip("192.168.8.0")));
        assert!(IpRule::parse("0.0.0.0/0").unwrap().matches(ip("8.8.8.8")));

        let v6 = IpRule::parse("2001:db8::/32").unwrap();
        assert!(v6.matches(ip("2001:db8:1::7")));
        assert!(!v6.matches(ip("2001:db9::1")));
        assert!(!v6.matches(ip("10.0.0.1")));
    }

    #[test]
    fn mapped_v4_peer_matches_v4_rule() {
        let rule = IpRule::parse("127.0.0.1").unwrap();
        assert!(rule.matches(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn bad_entries_rejected() {
        assert!(IpRule::parse("10.0.0/8").is_err());
        assert!(IpRule::parse("10.0.0.0/33").is_err());
        assert!(IpRule::parse("::/129").is_err());
        assert!(AccessPolicy::parse("10.0.0.1,nonsense", "").is_err());
    }

    #[test]
    fn admission_ceiling() {
        let admission = AdmissionControl::new(2);
        let g1 = admission.try_acquire().unwrap();
        let _g2 = admission.try_acquire().unwrap();
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.active(), 2);
        drop(g1);
        assert_eq!(admission.active(), 1);
        assert!(admission.try_acquire().is_some());
    }
}

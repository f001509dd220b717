//! IP allow-listing with CIDR support
//!
//! An allow-list is a set of literal addresses and CIDR ranges. An empty list
//! admits everyone. A non-empty list is always evaluated in full, so the time
//! taken does not reveal which entry (if any) matched.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpFilterError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// Split a raw allow-list setting into trimmed entries
///
/// Entries may be separated by commas, semicolons or whitespace. Blank input
/// gives an empty (open) list.
pub fn parse_allow_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical form used for comparisons
///
/// IPv4-mapped IPv6 addresses become plain IPv4 and the IPv6 loopback
/// collapses onto `127.0.0.1`.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
    }
}

/// Check `ip` against raw allow-list entries
///
/// Unparseable entries never match.
pub fn is_allowed(ip: IpAddr, list: &[String]) -> bool {
    IpFilter::lenient(list.iter().cloned()).is_allowed(&ip)
}

fn v4_mask(prefix_len: u8) -> u32 {
    u32::MAX
        .checked_shl(32 - u32::from(prefix_len))
        .unwrap_or(0)
}

fn v6_mask(prefix_len: u8) -> u128 {
    u128::MAX
        .checked_shl(128 - u32::from(prefix_len))
        .unwrap_or(0)
}

/// One literal address or CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    fn parse(entry: &str) -> Result<Self, IpFilterError> {
        let (addr, prefix_len) = match entry.split_once('/') {
            Some((ip_str, prefix_str)) => {
                let addr = IpAddr::from_str(ip_str)
                    .map_err(|_| IpFilterError::InvalidIpAddress(entry.to_string()))?;
                let prefix_len = prefix_str
                    .parse::<u8>()
                    .map_err(|_| IpFilterError::InvalidCidr(entry.to_string()))?;
                let max_prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if prefix_len > max_prefix {
                    return Err(IpFilterError::InvalidCidr(entry.to_string()));
                }
                (addr, prefix_len)
            }
            None => {
                let addr = IpAddr::from_str(entry)
                    .map_err(|_| IpFilterError::InvalidIpAddress(entry.to_string()))?;
                let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix_len)
            }
        };

        Ok(Self::canonical(addr, prefix_len))
    }

    /// Rewrite IPv6 forms of IPv4 space onto the IPv4 network
    fn canonical(addr: IpAddr, prefix_len: u8) -> Self {
        match addr {
            IpAddr::V6(v6) if v6.is_loopback() && prefix_len == 128 => Self {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                prefix_len: 32,
            },
            IpAddr::V6(v6) if prefix_len >= 96 => match v6.to_ipv4_mapped() {
                Some(v4) => Self {
                    addr: IpAddr::V4(v4),
                    prefix_len: prefix_len - 96,
                },
                None => Self { addr, prefix_len },
            },
            _ => Self { addr, prefix_len },
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(probe)) => {
                let mask = v4_mask(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*probe) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(probe)) => {
                let mask = v6_mask(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*probe) & mask)
            }
            _ => false,
        }
    }
}

/// Parsed allow-list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpFilter {
    allowlist: Vec<String>,
    /// `None` marks an entry that failed to parse; it never matches
    networks: Vec<Option<IpNetwork>>,
}

impl IpFilter {
    /// Empty filter (allows all connections)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter, failing on the first invalid entry
    pub fn from_allowlist(allowlist: Vec<String>) -> Result<Self, IpFilterError> {
        let networks = allowlist
            .iter()
            .map(|entry| IpNetwork::parse(entry).map(Some))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowlist,
            networks,
        })
    }

    /// Parse a raw delimited allow-list strictly
    pub fn parse(raw: &str) -> Result<Self, IpFilterError> {
        Self::from_allowlist(parse_allow_list(raw))
    }

    /// Build a filter that keeps invalid entries as never-matching
    pub fn lenient(entries: impl IntoIterator<Item = String>) -> Self {
        let allowlist: Vec<String> = entries.into_iter().collect();
        let networks = allowlist
            .iter()
            .map(|entry| match IpNetwork::parse(entry) {
                Ok(network) => Some(network),
                Err(e) => {
                    warn!("Ignoring allow-list entry: {}", e);
                    None
                }
            })
            .collect();

        Self {
            allowlist,
            networks,
        }
    }

    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.evaluate(ip).0
    }

    pub fn is_socket_allowed(&self, addr: &SocketAddr) -> bool {
        self.is_allowed(&addr.ip())
    }

    /// Returns the verdict and how many entries were checked
    fn evaluate(&self, ip: &IpAddr) -> (bool, usize) {
        if self.networks.is_empty() {
            return (true, 0);
        }

        let probe = normalize_ip(*ip);
        let mut allowed = false;
        let mut checked = 0;
        for network in &self.networks {
            let matched = network.map_or(false, |n| n.contains(&probe));
            // Non-short-circuiting on purpose: every entry is evaluated.
            allowed |= matched;
            checked += 1;
        }
        (allowed, checked)
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    pub fn is_empty(&self) -> bool {
        self.allowlist.is_empty()
    }

    pub fn len(&self) -> usize {
        self.allowlist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_allow_list_delimiters() {
        assert_eq!(
            parse_allow_list(" 10.0.0.1, 192.168.0.0/16;\n203.0.113.7  ::1 "),
            list(&["10.0.0.1", "192.168.0.0/16", "203.0.113.7", "::1"])
        );
        assert!(parse_allow_list("").is_empty());
        assert!(parse_allow_list("  , ;  ").is_empty());
    }

    #[test]
    fn test_empty_list_allows_everyone() {
        assert!(is_allowed(ip("8.8.8.8"), &[]));
        assert!(is_allowed(ip("2001:db8::1"), &[]));
        assert!(IpFilter::new().is_allowed(&ip("127.0.0.1")));
    }

    #[test]
    fn test_class_c_range() {
        let entries = list(&["192.168.1.0/24"]);
        assert!(is_allowed(ip("192.168.1.50"), &entries));
        assert!(is_allowed(ip("192.168.1.0"), &entries));
        assert!(is_allowed(ip("192.168.1.255"), &entries));
        assert!(!is_allowed(ip("192.168.2.1"), &entries));
    }

    #[test]
    fn test_literal_entries() {
        let entries = list(&["203.0.113.50", "10.1.2.3"]);
        assert!(is_allowed(ip("10.1.2.3"), &entries));
        assert!(!is_allowed(ip("10.1.2.4"), &entries));
    }

    #[test]
    fn test_prefix_edges() {
        assert!(is_allowed(ip("8.8.8.8"), &list(&["0.0.0.0/0"])));
        assert!(is_allowed(ip("10.0.0.1"), &list(&["10.0.0.1/32"])));
        assert!(!is_allowed(ip("10.0.0.2"), &list(&["10.0.0.1/32"])));
        assert!(is_allowed(ip("10.200.3.4"), &list(&["10.0.0.0/8"])));
        assert!(is_allowed(ip("172.31.255.255"), &list(&["172.16.0.0/12"])));
        assert!(!is_allowed(ip("172.32.0.0"), &list(&["172.16.0.0/12"])));
    }

    #[test]
    fn test_out_of_range_prefix_never_matches() {
        let entries = list(&["192.168.1.0/33", "10.0.0.0/-1"]);
        assert!(!is_allowed(ip("192.168.1.10"), &entries));
        assert!(!is_allowed(ip("10.0.0.1"), &entries));

        assert_eq!(
            IpFilter::from_allowlist(list(&["192.168.1.0/33"])),
            Err(IpFilterError::InvalidCidr("192.168.1.0/33".to_string()))
        );
        assert_eq!(
            IpFilter::parse("10.0.0.1, not-an-ip"),
            Err(IpFilterError::InvalidIpAddress("not-an-ip".to_string()))
        );
    }

    #[test]
    fn test_mapped_ipv6_probe_matches_ipv4_entry() {
        let entries = list(&["192.168.1.0/24"]);
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 1, 9).to_ipv6_mapped());
        assert!(is_allowed(mapped, &entries));
    }

    #[test]
    fn test_loopback_variants_collapse() {
        assert!(is_allowed(IpAddr::V6(Ipv6Addr::LOCALHOST), &list(&["127.0.0.1"])));
        assert!(is_allowed(ip("127.0.0.1"), &list(&["::1"])));
        assert!(is_allowed(ip("::ffff:127.0.0.1"), &list(&["127.0.0.1"])));
    }

    #[test]
    fn test_ipv6_ranges() {
        let entries = list(&["2001:db8::/32"]);
        assert!(is_allowed(ip("2001:db8:ffff::1"), &entries));
        assert!(!is_allowed(ip("2001:db9::1"), &entries));
        assert!(!is_allowed(ip("10.0.0.1"), &entries));
        assert!(is_allowed(ip("fe80::1"), &list(&["::/0"])));
    }

    #[test]
    fn test_mapped_cidr_entry() {
        let entries = list(&["::ffff:10.0.0.0/104"]);
        assert!(is_allowed(ip("10.9.8.7"), &entries));
        assert!(!is_allowed(ip("11.0.0.1"), &entries));
    }

    #[test]
    fn test_every_entry_evaluated_regardless_of_match_position() {
        let mut entries: Vec<String> = (1..=20).map(|i| format!("10.0.{i}.0/24")).collect();
        entries.insert(0, "192.168.1.0/24".to_string());
        let first = IpFilter::lenient(entries.clone());

        entries.rotate_left(1);
        let last = IpFilter::lenient(entries);

        let probe = ip("192.168.1.50");
        assert_eq!(first.evaluate(&probe), (true, 21));
        assert_eq!(last.evaluate(&probe), (true, 21));
        assert_eq!(first.evaluate(&ip("8.8.8.8")), (false, 21));
    }

    #[test]
    fn test_socket_addr_filter() {
        let filter = IpFilter::parse("192.168.1.0/24").unwrap();
        assert!(filter.is_socket_allowed(&"192.168.1.100:8080".parse().unwrap()));
        assert!(!filter.is_socket_allowed(&"10.0.0.1:8080".parse().unwrap()));
        assert_eq!(filter.len(), 1);
        assert!(!filter.is_empty());
        assert_eq!(filter.allowlist(), ["192.168.1.0/24"]);
    }
}

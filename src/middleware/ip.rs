//! Client identity resolution shared by every gate.
//!
//! Both the IP filter and the rate limiter attribute a request to a client
//! through [`resolve_client_identity`], so a client is blocked and counted
//! under the same key.
//!
//! # Resolution Order
//!
//! 1. First entry of `X-Forwarded-For`, if it parses as an IP address
//! 2. `X-Real-IP`, if it parses as an IP address
//! 3. The peer address of the TCP connection (`ConnectInfo<SocketAddr>`)
//! 4. [`UNKNOWN_IP`] when the server runs without connect info
//!
//! Header values are accepted as bare IPv4/IPv6 addresses or in `ip:port` /
//! `[v6]:port` form; the port is dropped and IPv4-mapped IPv6 addresses are
//! folded to IPv4. Empty or malformed values never fail the request, they fall
//! through to the next source.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Forwarded headers are client-controlled unless a trusted reverse proxy
//! overwrites them. Configure `TRUSTED_PROXIES` with your proxy ranges so that
//! headers arriving from any other peer are ignored:
//!
//! ```nginx
//! # nginx example - overwrites any client-provided header
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! With an empty `TRUSTED_PROXIES` every peer is trusted, which lets clients
//! rotate spoofed addresses to dodge the block list and quotas.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::Request;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Identity used when neither headers nor the peer address are available.
pub const UNKNOWN_IP: &str = "unknown";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Resolved identity of the requesting client, used as the policy key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_IP.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed address, `None` for the unknown identity.
    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IP
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an identity came from, for debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentitySource {
    ForwardedFor,
    RealIp,
    Peer,
    Unknown,
}

/// Parse a client address from a header value.
///
/// Accepts `1.2.3.4`, `2001:db8::1`, `1.2.3.4:8080`, `[2001:db8::1]:8080`
/// and `[2001:db8::1]`. Returns `None` for anything else.
pub fn parse_client_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip.to_canonical());
    }

    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip().to_canonical());
    }

    raw.strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse::<IpAddr>().ok())
        .map(|ip| ip.to_canonical())
}

fn header_addr<B>(req: &Request<B>, name: &str) -> Option<IpAddr> {
    let value = req.headers().get(name)?.to_str().ok()?;
    let candidate = match name {
        // "client, proxy1, proxy2" - the first entry is the original client
        X_FORWARDED_FOR => value.split(',').next()?,
        _ => value,
    };
    parse_client_addr(candidate)
}

fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical())
}

fn resolve<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> (ClientIdentity, IdentitySource) {
    let peer = peer_addr(req);

    let headers_trusted = match peer {
        Some(peer) => trusted_proxies.is_trusted(&peer),
        None => !trusted_proxies.is_enabled(),
    };

    if headers_trusted {
        if let Some(ip) = header_addr(req, X_FORWARDED_FOR) {
            return (ip.into(), IdentitySource::ForwardedFor);
        }
        if let Some(ip) = header_addr(req, X_REAL_IP) {
            return (ip.into(), IdentitySource::RealIp);
        }
    } else if req.headers().contains_key(X_FORWARDED_FOR) || req.headers().contains_key(X_REAL_IP)
    {
        debug!(
            peer = ?peer,
            "Ignoring forwarded headers from untrusted peer"
        );
    }

    match peer {
        Some(ip) => (ip.into(), IdentitySource::Peer),
        None => (ClientIdentity::unknown(), IdentitySource::Unknown),
    }
}

/// Resolve the identity of the client behind a request.
///
/// See the module documentation for the resolution order.
#[inline]
pub fn resolve_client_identity<B>(
    req: &Request<B>,
    trusted_proxies: &TrustedProxyConfig,
) -> ClientIdentity {
    let (identity, source) = resolve(req, trusted_proxies);
    if source == IdentitySource::Unknown {
        debug!("No client address available - request shares the unknown identity");
    } else {
        debug!(client_ip = %identity, source = ?source, "Resolved client identity");
    }
    identity
}

/// Identity for a request, resolved at most once per request.
///
/// The first gate stores the identity in the request extensions; later gates
/// and handlers read it back instead of resolving again.
pub fn request_identity<B>(
    req: &mut Request<B>,
    trusted_proxies: &TrustedProxyConfig,
) -> ClientIdentity {
    if let Some(identity) = req.extensions().get::<ClientIdentity>() {
        return identity.clone();
    }
    let identity = resolve_client_identity(req, trusted_proxies);
    req.extensions_mut().insert(identity.clone());
    identity
}

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range, used for trusted proxies and block-list ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is accepted as a single-host range (/32 or /128).
    /// Host bits are cleared, so `10.1.2.3/8` parses to `10.0.0.0/8`.
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((addr, prefix)) = cidr.split_once('/') else {
            let ip = cidr.parse::<IpAddr>().ok()?.to_canonical();
            return Some(Self {
                network: ip,
                prefix_len: max_prefix(&ip),
            });
        };

        let ip = addr.parse::<IpAddr>().ok()?.to_canonical();
        let prefix_len: u8 = prefix.parse().ok()?;

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: network_of(&ip, prefix_len),
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    #[inline]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_ipv4() == self.network.is_ipv4() && network_of(&ip, self.prefix_len) == self.network
    }

    pub fn is_single_host(&self) -> bool {
        self.prefix_len == max_prefix(&self.network)
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_host() {
            write!(f, "{}", self.network)
        } else {
            write!(f, "{}/{}", self.network, self.prefix_len)
        }
    }
}

/// `ip` with every bit past `prefix_len` cleared.
fn network_of(ip: &IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(*addr) & mask))
        }
        IpAddr::V6(addr) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(*addr) & mask))
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Configuration for trusted proxy validation.
///
/// When configured, forwarded headers are only honoured for requests whose
/// peer address lies within one of the ranges.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Arc<Vec<CidrRange>>,
}

impl TrustedProxyConfig {
    /// Create a new trusted proxy configuration from CIDR strings.
    ///
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self {
            ranges: Arc::new(ranges),
        }
    }

    /// Check if trusted proxy validation is enabled (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Check if a peer address is a trusted proxy.
    ///
    /// Every peer is trusted when no ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/forum/posts");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    fn resolve_default(req: &Request<Body>) -> String {
        resolve_client_identity(req, &TrustedProxyConfig::default()).to_string()
    }

    #[test]
    fn test_xff_first_entry_of_list() {
        let req = request(&[("x-forwarded-for", "192.168.1.1, 10.0.0.1")], None);
        assert_eq!(resolve_default(&req), "192.168.1.1");
    }

    #[test]
    fn test_xff_with_whitespace() {
        let req = request(&[("x-forwarded-for", "  203.0.113.50  , 10.0.0.1")], None);
        assert_eq!(resolve_default(&req), "203.0.113.50");
    }

    #[test]
    fn test_xff_ipv6_without_dots_is_accepted() {
        let req = request(
            &[("x-forwarded-for", "2001:db8::1, 10.0.0.1")],
            Some("10.0.0.1:443"),
        );
        assert_eq!(resolve_default(&req), "2001:db8::1");
    }

    #[test]
    fn test_xff_with_port_drops_port() {
        let req = request(&[("x-forwarded-for", "192.168.1.1:8080")], None);
        assert_eq!(resolve_default(&req), "192.168.1.1");

        let req = request(&[("x-forwarded-for", "[2001:db8::7]:8443")], None);
        assert_eq!(resolve_default(&req), "2001:db8::7");
    }

    #[test]
    fn test_ipv4_mapped_ipv6_is_folded() {
        let req = request(&[("x-forwarded-for", "::ffff:198.51.100.4")], None);
        assert_eq!(resolve_default(&req), "198.51.100.4");
    }

    #[test]
    fn test_real_ip_used_when_xff_absent() {
        let req = request(&[("x-real-ip", "192.168.1.1")], Some("10.0.0.9:1234"));
        assert_eq!(resolve_default(&req), "192.168.1.1");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let req = request(
            &[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")],
            None,
        );
        assert_eq!(resolve_default(&req), "10.0.0.1");
    }

    #[test]
    fn test_malformed_xff_falls_back_to_real_ip() {
        let req = request(
            &[("x-forwarded-for", "not-an-ip"), ("x-real-ip", "192.168.1.1")],
            None,
        );
        assert_eq!(resolve_default(&req), "192.168.1.1");
    }

    #[test]
    fn test_empty_headers_fall_back_to_peer() {
        let req = request(
            &[("x-forwarded-for", ""), ("x-real-ip", "   ")],
            Some("172.16.4.2:5000"),
        );
        assert_eq!(resolve_default(&req), "172.16.4.2");
    }

    #[test]
    fn test_empty_first_xff_entry_falls_back() {
        let req = request(&[("x-forwarded-for", ", 10.0.0.1")], Some("172.16.4.2:5000"));
        assert_eq!(resolve_default(&req), "172.16.4.2");
    }

    #[test]
    fn test_no_headers_no_peer_is_unknown() {
        let req = request(&[], None);
        let identity = resolve_client_identity(&req, &TrustedProxyConfig::default());
        assert!(identity.is_unknown());
        assert_eq!(identity.ip(), None);
    }

    #[test]
    fn test_long_proxy_chain() {
        let long_chain = (0..100)
            .map(|i| format!("10.0.0.{}", i % 256))
            .collect::<Vec<_>>()
            .join(", ");
        let req = request(&[("x-forwarded-for", &long_chain)], None);
        assert_eq!(resolve_default(&req), "10.0.0.0");
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = request(&[("x-forwarded-for", "203.0.113.9")], Some("198.51.100.1:4000"));

        assert_eq!(
            resolve_client_identity(&req, &trusted).as_str(),
            "198.51.100.1"
        );
    }

    #[test]
    fn test_trusted_peer_headers_honoured() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = request(&[("x-forwarded-for", "203.0.113.9")], Some("10.1.2.3:4000"));

        assert_eq!(
            resolve_client_identity(&req, &trusted).as_str(),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_request_identity_is_cached_in_extensions() {
        let mut req = request(&[("x-forwarded-for", "203.0.113.9")], None);
        let first = request_identity(&mut req, &TrustedProxyConfig::default());

        // Header changes after the first resolution are not observed
        req.headers_mut()
            .insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let second = request_identity(&mut req, &TrustedProxyConfig::default());

        assert_eq!(first, second);
        assert_eq!(req.extensions().get::<ClientIdentity>(), Some(&first));
    }

    #[test]
    fn test_parse_client_addr_rejects_garbage() {
        assert_eq!(parse_client_addr("unknown"), None);
        assert_eq!(parse_client_addr("1.2.3"), None);
        assert_eq!(parse_client_addr("[::1"), None);
        assert_eq!(parse_client_addr("[::1]"), Some("::1".parse().unwrap()));
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse_ipv4() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert_eq!(cidr.prefix_len(), 8);
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_cidr_parse_single_ip() {
        let cidr = CidrRange::parse("192.168.1.1").unwrap();
        assert_eq!(cidr.prefix_len(), 32);
        assert!(cidr.is_single_host());
        assert_eq!(cidr.to_string(), "192.168.1.1");
    }

    #[test]
    fn test_cidr_parse_invalid() {
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/abc").is_none());
    }

    #[test]
    fn test_cidr_contains_ipv4() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();

        assert!(cidr.contains(&"192.168.1.1".parse().unwrap()));
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_contains_ipv6() {
        let cidr = CidrRange::parse("2001:db8::/32").unwrap();

        assert!(cidr.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!cidr.contains(&"2001:db9::1".parse().unwrap()));
        assert!(!cidr.contains(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_host_bits_are_cleared() {
        let typed = CidrRange::parse("10.1.2.3/8").unwrap();
        assert_eq!(typed, CidrRange::parse("10.0.0.0/8").unwrap());
        assert_eq!(typed.to_string(), "10.0.0.0/8");

        let v6 = CidrRange::parse("2001:db8:aa::1/32").unwrap();
        assert_eq!(v6.network(), "2001:db8::".parse::<IpAddr>().unwrap());
        assert!(v6.contains(&"2001:db8:ffff::2".parse().unwrap()));
    }

    #[test]
    fn test_cidr_zero_prefix_matches_family() {
        let cidr = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(cidr.contains(&"8.8.8.8".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_empty_trusts_all() {
        let config = TrustedProxyConfig::new(&[]);
        assert!(!config.is_enabled());
        assert!(config.is_trusted(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_skips_invalid_entries() {
        let config = TrustedProxyConfig::new(&["bogus".to_string(), "172.16.0.0/12".to_string()]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }
}

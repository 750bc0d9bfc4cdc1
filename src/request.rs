//! Request normalisation and trust-proxy evaluation
//!
//! A raw HTTP message is enhanced exactly once into an `EnhancedRequest`
//! value; nothing here intercepts field access dynamically. Forwarded
//! headers are only honoured when the immediate peer is trusted.

use crate::error::{Error, Result};
use axum::http::{HeaderMap, Method, Uri};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// A single trust rule for proxy hops
#[derive(Debug, Clone)]
pub enum TrustRule {
    Loopback,
    LinkLocal,
    UniqueLocal,
    Exact(IpAddr),
    Cidr(IpCidr),
}

impl TrustRule {
    fn matches(&self, addr: IpAddr) -> bool {
        match self {
            TrustRule::Loopback => addr.is_loopback(),
            TrustRule::LinkLocal => match addr {
                IpAddr::V4(v4) => v4.is_link_local(),
                IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            },
            TrustRule::UniqueLocal => match addr {
                IpAddr::V4(v4) => v4.is_private(),
                IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
            },
            TrustRule::Exact(ip) => addr == *ip,
            TrustRule::Cidr(cidr) => cidr.contains(addr),
        }
    }
}

/// CIDR block, v4 or v6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("Invalid CIDR: {}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("Invalid CIDR address: {}", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Config(format!("Invalid CIDR prefix: {}", s)))?;

        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(Error::Config(format!(
                "CIDR prefix {} out of range for {}",
                prefix, s
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net = u128::from(net);
                let ip = u128::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (net & mask) == (ip & mask)
            }
            _ => false,
        }
    }
}

/// Trust-proxy policy applied to the forwarded chain
#[derive(Clone)]
pub enum TrustProxy {
    /// Never trust forwarded headers; the socket peer is the client
    Never,
    /// Trust hops matching any rule
    Rules(Vec<TrustRule>),
    /// Trust the N hops nearest the socket peer (rightmost-first)
    HopCount(usize),
    /// User-supplied predicate over (address, hop index from the right)
    Custom(Arc<dyn Fn(IpAddr, usize) -> bool + Send + Sync>),
}

impl std::fmt::Debug for TrustProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustProxy::Never => write!(f, "TrustProxy::Never"),
            TrustProxy::Rules(rules) => write!(f, "TrustProxy::Rules({} rules)", rules.len()),
            TrustProxy::HopCount(n) => write!(f, "TrustProxy::HopCount({})", n),
            TrustProxy::Custom(_) => write!(f, "TrustProxy::Custom"),
        }
    }
}

impl TrustProxy {
    /// Parse the configured trust expression. Rejects malformed entries so
    /// a typo never fails open at request time.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "false" {
            return Ok(TrustProxy::Never);
        }
        if let Ok(count) = expr.parse::<usize>() {
            return Ok(TrustProxy::HopCount(count));
        }

        let mut rules = Vec::new();
        for token in expr.split(',') {
            let token = token.trim();
            match token {
                "loopback" => rules.push(TrustRule::Loopback),
                "linklocal" => rules.push(TrustRule::LinkLocal),
                "uniquelocal" => rules.push(TrustRule::UniqueLocal),
                _ => {
                    if token.contains('/') {
                        rules.push(TrustRule::Cidr(IpCidr::parse(token)?));
                    } else {
                        let ip: IpAddr = token.parse().map_err(|_| {
                            Error::Config(format!("Invalid trust proxy entry: {}", token))
                        })?;
                        rules.push(TrustRule::Exact(ip));
                    }
                }
            }
        }
        Ok(TrustProxy::Rules(rules))
    }

    /// Is the hop at `index` (0 = socket peer, counting leftward) trusted?
    pub fn trusts(&self, addr: IpAddr, index: usize) -> bool {
        match self {
            TrustProxy::Never => false,
            TrustProxy::Rules(rules) => rules.iter().any(|r| r.matches(addr)),
            TrustProxy::HopCount(count) => index < *count,
            TrustProxy::Custom(f) => f(addr, index),
        }
    }

    /// Resolve the client address from the peer and `X-Forwarded-For`.
    ///
    /// Walks the forwarded chain from the rightmost hop (the peer side)
    /// leftward, stopping at the first untrusted address. Returns the
    /// resolved client plus the validated chain, peer first.
    pub fn resolve_client(&self, peer: IpAddr, forwarded_for: Option<&str>) -> (IpAddr, Vec<IpAddr>) {
        let mut chain = vec![peer];

        if !self.trusts(peer, 0) {
            return (peer, chain);
        }

        let Some(header) = forwarded_for else {
            return (peer, chain);
        };

        let mut hops: Vec<IpAddr> = Vec::new();
        for raw in header.split(',') {
            match raw.trim().parse::<IpAddr>() {
                Ok(ip) => hops.push(ip),
                Err(_) => {
                    // A malformed hop poisons everything to its left
                    break;
                }
            }
        }

        let mut client = peer;
        for (offset, addr) in hops.iter().rev().enumerate() {
            chain.push(*addr);
            client = *addr;
            // hop index counts from the socket peer; the peer itself is 0
            if !self.trusts(*addr, offset + 1) {
                break;
            }
        }

        (client, chain)
    }
}

/// Ordered multi-value query map; repeated keys keep their order
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryMap {
    entries: Vec<(String, String)>,
}

impl QueryMap {
    pub fn parse(query: &str) -> Self {
        let mut entries = Vec::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            entries.push((uri_decode(key), uri_decode(value)));
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Percent-decode with raw fallback: a malformed sequence leaves the input
/// untouched rather than erroring mid-request.
pub fn uri_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 3;
                    }
                    _ => return input.to_string(),
                }
            }
            b'%' => return input.to_string(),
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

/// The normalised request value handed to plugins and handlers
#[derive(Debug, Clone)]
pub struct EnhancedRequest {
    pub method: String,
    pub path: String,
    pub raw_url: String,
    pub query: QueryMap,
    /// Populated by the router after matching
    pub params: HashMap<String, String>,
    /// Populated by a body-parsing middleware when enabled
    pub body: Option<Vec<u8>>,
    pub cookies: HashMap<String, String>,
    pub ip: IpAddr,
    pub ips: Vec<IpAddr>,
    pub protocol: String,
    pub secure: bool,
    pub hostname: String,
    pub subdomains: Vec<String>,
    pub xhr: bool,
    headers: HashMap<String, String>,
}

impl EnhancedRequest {
    /// Build the request value once from raw parts.
    pub fn enhance(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: SocketAddr,
        trust: &TrustProxy,
    ) -> Self {
        let raw_url = uri.to_string();

        // WHATWG-style split; on a pathological URI fall back to the raw
        // string with an empty query.
        let (path, query) = match uri.path_and_query() {
            Some(pq) => (
                pq.path().to_string(),
                pq.query().map(QueryMap::parse).unwrap_or_default(),
            ),
            None => (raw_url.clone(), QueryMap::default()),
        };

        let mut header_map = HashMap::new();
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }

        let forwarded_for = header_map.get("x-forwarded-for").map(|s| s.as_str());
        let (ip, ips) = trust.resolve_client(peer.ip(), forwarded_for);
        let peer_trusted = trust.trusts(peer.ip(), 0);

        let protocol = if peer_trusted {
            header_map
                .get("x-forwarded-proto")
                .map(|p| p.split(',').next().unwrap_or("http").trim().to_string())
                .unwrap_or_else(|| "http".to_string())
        } else {
            "http".to_string()
        };
        let secure = protocol == "https";

        let hostname = {
            let host = if peer_trusted {
                header_map
                    .get("x-forwarded-host")
                    .or_else(|| header_map.get("host"))
            } else {
                header_map.get("host")
            };
            host.map(|h| strip_port(h))
                .unwrap_or_default()
        };

        let subdomains = subdomains_of(&hostname);

        let cookies = header_map
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        let xhr = header_map
            .get("x-requested-with")
            .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
            .unwrap_or(false);

        Self {
            method: method.as_str().to_string(),
            path,
            raw_url,
            query,
            params: HashMap::new(),
            body: None,
            cookies,
            ip,
            ips,
            protocol,
            secure,
            hostname,
            subdomains,
            xhr,
            headers: header_map,
        }
    }

    /// Case-insensitive single-value header accessor.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.get("user-agent").unwrap_or("")
    }
}

fn strip_port(host: &str) -> String {
    // Bracketed IPv6 keeps its brackets, loses the port
    if let Some(end) = host.find(']') {
        return host[..=end].to_string();
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h.to_string(),
        _ => host.to_string(),
    }
}

fn subdomains_of(hostname: &str) -> Vec<String> {
    if hostname.is_empty() || hostname.parse::<Ipv4Addr>().is_ok() || hostname.starts_with('[') {
        return Vec::new();
    }
    if hostname.parse::<Ipv6Addr>().is_ok() {
        return Vec::new();
    }
    let parts: Vec<&str> = hostname.split('.').collect();
    if parts.len() <= 2 {
        return Vec::new();
    }
    parts[..parts.len() - 2]
        .iter()
        .rev()
        .map(|s| s.to_string())
        .collect()
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), uri_decode(value.trim()));
        }
    }
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(ip: &str) -> SocketAddr {
        format!("{}:51000", ip).parse().unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_cidr_v4_contains() {
        let cidr = IpCidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains("10.200.3.4".parse().unwrap()));
        assert!(!cidr.contains("11.0.0.1".parse().unwrap()));
        assert!(!cidr.contains("::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_v6_contains() {
        let cidr = IpCidr::parse("fd00::/8").unwrap();
        assert!(cidr.contains("fd12:3456::1".parse().unwrap()));
        assert!(!cidr.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        assert!(IpCidr::parse("10.0.0.0/99").is_err());
        assert!(IpCidr::parse("not-an-ip/8").is_err());
        assert!(TrustProxy::parse("10.0.0.0/99").is_err());
        assert!(TrustProxy::parse("loopback, bogus").is_err());
    }

    #[test]
    fn test_parse_preset_list() {
        let trust = TrustProxy::parse("loopback, uniquelocal, 203.0.113.7").unwrap();
        assert!(trust.trusts("127.0.0.1".parse().unwrap(), 0));
        assert!(trust.trusts("192.168.1.1".parse().unwrap(), 0));
        assert!(trust.trusts("203.0.113.7".parse().unwrap(), 0));
        assert!(!trust.trusts("8.8.8.8".parse().unwrap(), 0));
    }

    #[test]
    fn test_untrusted_peer_yields_socket_ip() {
        let trust = TrustProxy::Never;
        let (ip, ips) = trust.resolve_client(
            "198.51.100.9".parse().unwrap(),
            Some("203.0.113.1, 10.0.0.1"),
        );
        assert_eq!(ip, "198.51.100.9".parse::<IpAddr>().unwrap());
        assert_eq!(ips.len(), 1);
    }

    #[test]
    fn test_forwarded_walk_stops_at_first_untrusted() {
        // Trust loopback and 10/8; the peer and the rightmost hop are
        // trusted proxies, the next hop out is the client.
        let trust = TrustProxy::parse("loopback, 10.0.0.0/8").unwrap();
        let (ip, ips) = trust.resolve_client(
            "127.0.0.1".parse().unwrap(),
            Some("203.0.113.50, 10.0.0.3"),
        );
        assert_eq!(ip, "203.0.113.50".parse::<IpAddr>().unwrap());
        assert_eq!(ips.len(), 3);
    }

    #[test]
    fn test_hop_count_is_rightmost_first() {
        // Hop count 2: peer (hop 0) and the rightmost header hop (hop 1)
        // are trusted; the hop at index 2 is the client even though more
        // entries sit to its left.
        let trust = TrustProxy::HopCount(2);
        let (ip, _) = trust.resolve_client(
            "10.0.0.1".parse().unwrap(),
            Some("1.1.1.1, 203.0.113.9, 10.0.0.2"),
        );
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_malformed_hop_stops_walk() {
        let trust = TrustProxy::parse("loopback, 10.0.0.0/8").unwrap();
        let (ip, _) = trust.resolve_client(
            "127.0.0.1".parse().unwrap(),
            Some("203.0.113.50, not-an-ip, 10.0.0.3"),
        );
        // The malformed middle hop truncates the chain; the rightmost valid
        // hop remains the best answer.
        assert_eq!(ip, "10.0.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_query_map_repeated_keys_ordered() {
        let query = QueryMap::parse("tag=a&tag=b&x=1&tag=c");
        assert_eq!(query.get_all("tag"), vec!["a", "b", "c"]);
        assert_eq!(query.get("x"), Some("1"));
        assert_eq!(query.len(), 4);
    }

    #[test]
    fn test_uri_decode_fallback_on_malformed() {
        assert_eq!(uri_decode("hello%20world"), "hello world");
        assert_eq!(uri_decode("a+b"), "a b");
        // Malformed escapes come back raw
        assert_eq!(uri_decode("bad%2"), "bad%2");
        assert_eq!(uri_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn test_enhance_basic_fields() {
        let req = EnhancedRequest::enhance(
            &Method::GET,
            &"/search?q=rust&q=cache".parse().unwrap(),
            &headers(&[
                ("host", "api.eu.example.com:8080"),
                ("cookie", "sid=abc%20def; theme=dark"),
                ("x-requested-with", "XMLHttpRequest"),
                ("user-agent", "smoke-test"),
            ]),
            peer("198.51.100.4"),
            &TrustProxy::Never,
        );

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/search");
        assert_eq!(req.query.get_all("q"), vec!["rust", "cache"]);
        assert_eq!(req.hostname, "api.eu.example.com");
        assert_eq!(req.subdomains, vec!["eu", "api"]);
        assert_eq!(req.cookies.get("sid").unwrap(), "abc def");
        assert_eq!(req.cookies.get("theme").unwrap(), "dark");
        assert!(req.xhr);
        assert_eq!(req.get("USER-AGENT"), Some("smoke-test"));
        assert_eq!(req.protocol, "http");
        assert!(!req.secure);
    }

    #[test]
    fn test_enhance_trusted_proxy_headers() {
        let trust = TrustProxy::parse("loopback").unwrap();
        let req = EnhancedRequest::enhance(
            &Method::POST,
            &"/submit".parse().unwrap(),
            &headers(&[
                ("host", "internal"),
                ("x-forwarded-for", "203.0.113.50"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-host", "app.example.com"),
            ]),
            peer("127.0.0.1"),
            &trust,
        );

        assert_eq!(req.ip, "203.0.113.50".parse::<IpAddr>().unwrap());
        assert_eq!(req.protocol, "https");
        assert!(req.secure);
        assert_eq!(req.hostname, "app.example.com");
    }

    #[test]
    fn test_enhance_untrusted_ignores_forwarded() {
        let req = EnhancedRequest::enhance(
            &Method::GET,
            &"/".parse().unwrap(),
            &headers(&[
                ("host", "example.com"),
                ("x-forwarded-for", "203.0.113.50"),
                ("x-forwarded-proto", "https"),
            ]),
            peer("198.51.100.4"),
            &TrustProxy::Never,
        );

        assert_eq!(req.ip, "198.51.100.4".parse::<IpAddr>().unwrap());
        assert_eq!(req.protocol, "http");
    }

    #[test]
    fn test_custom_predicate() {
        let trust = TrustProxy::Custom(Arc::new(|addr, _| {
            matches!(addr, IpAddr::V4(v4) if v4.octets()[0] == 10)
        }));
        assert!(trust.trusts("10.1.2.3".parse().unwrap(), 5));
        assert!(!trust.trusts("127.0.0.1".parse().unwrap(), 0));
    }

    #[test]
    fn test_subdomains_edge_cases() {
        assert!(subdomains_of("example.com").is_empty());
        assert!(subdomains_of("192.168.0.1").is_empty());
        assert_eq!(subdomains_of("a.b.example.com"), vec!["b", "a"]);
    }
}

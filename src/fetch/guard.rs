//! URL validation and SSRF guards for outbound requests
//!
//! Defence in depth before any connection is opened: scheme and port
//! checks, a blocked-TLD set covering infrastructure and internal-naming
//! domains, and resolution of every A/AAAA record with a reachability check
//! that rejects loopback, private, link-local, multicast and otherwise
//! non-global ranges (including their IPv4-mapped IPv6 forms). After the
//! connection, the actually connected peer address is verified again before
//! any response byte is surfaced.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use url::{Host, Url};

use crate::error::FetchError;

/// TLDs that never belong to a public upstream.
const BLOCKED_TLDS: &[&str] = &[
    "test",
    "example",
    "invalid",
    "localhost",
    "local",
    "internal",
    "arpa",
    "intranet",
    "corp",
    "home",
    "lan",
    "kubernetes",
];

/// Ports outbound requests may use.
const ALLOWED_PORTS: &[u16] = &[80, 443];

/// Check whether an IP address is globally reachable and safe to contact.
///
/// Everything that is not plain public unicast is rejected: loopback,
/// RFC 1918 private, carrier-grade NAT, link-local, unique-local,
/// site-local, multicast, broadcast, unspecified, documentation,
/// benchmarking and reserved ranges. IPv4-mapped IPv6 addresses are
/// unwrapped and judged by their IPv4 payload.
pub fn is_ip_safe(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_ipv4_safe(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_ipv4_safe(mapped);
            }
            is_ipv6_safe(v6)
        }
    }
}

fn is_ipv4_safe(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network"
        || octets[0] == 0
        // 100.64.0.0/10 shared address space (CGNAT)
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        // 192.0.0.0/24 IETF protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] == 18 || octets[1] == 19))
        // 240.0.0.0/4 reserved
        || octets[0] >= 240)
}

fn is_ipv6_safe(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    !(ip.is_loopback()
        || ip.is_multicast()
        || ip.is_unspecified()
        // fe80::/10 link-local
        || (segments[0] & 0xffc0) == 0xfe80
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fec0::/10 deprecated site-local
        || (segments[0] & 0xffc0) == 0xfec0
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0xdb8)
        // ::/96 IPv4-compatible (deprecated)
        || (segments[..6] == [0, 0, 0, 0, 0, 0] && (segments[6] != 0 || segments[7] > 1)))
}

/// Whether the hostname's last label is in the blocked TLD set.
///
/// A trailing dot (fully-qualified form) is stripped first so `foo.local.`
/// cannot bypass the check.
fn has_blocked_tld(host: &str) -> bool {
    let trimmed = host.trim_end_matches('.');
    if trimmed.is_empty() {
        return true;
    }
    match trimmed.rsplit('.').next() {
        Some(tld) => BLOCKED_TLDS.contains(&tld.to_ascii_lowercase().as_str()),
        None => true,
    }
}

/// Validate a URL without touching the network.
///
/// Checks scheme, host presence, port and the blocked-TLD set. Literal IP
/// hosts are range-checked here; hostnames are range-checked during
/// [`resolve_checked`].
pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| FetchError::UrlRejected(format!("unparseable URL ({e})")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FetchError::UrlRejected(format!(
                "scheme {other:?} not allowed"
            )))
        }
    }

    let host = url
        .host()
        .ok_or_else(|| FetchError::UrlRejected("missing host".into()))?;

    if let Some(port) = url.port() {
        if !ALLOWED_PORTS.contains(&port) {
            return Err(FetchError::UrlRejected(format!("port {port} not allowed")));
        }
    }

    match host {
        Host::Ipv4(ip) => {
            if !is_ip_safe(IpAddr::V4(ip)) {
                return Err(FetchError::UrlRejected(format!(
                    "address {ip} is not globally reachable"
                )));
            }
        }
        Host::Ipv6(ip) => {
            if !is_ip_safe(IpAddr::V6(ip)) {
                return Err(FetchError::UrlRejected(format!(
                    "address {ip} is not globally reachable"
                )));
            }
        }
        Host::Domain(name) => {
            if has_blocked_tld(name) {
                return Err(FetchError::UrlRejected(format!(
                    "hostname {name:?} uses a blocked TLD"
                )));
            }
        }
    }

    Ok(url)
}

/// Verify every address a hostname resolved to.
///
/// A single unsafe record fails the whole resolution: split-horizon answers
/// must not be able to steer a retry onto an internal address.
pub fn ensure_addrs_safe(host: &str, addrs: &[SocketAddr]) -> Result<(), FetchError> {
    if addrs.is_empty() {
        return Err(FetchError::Transport(format!("no addresses for {host}")));
    }
    for addr in addrs {
        if !is_ip_safe(addr.ip()) {
            return Err(FetchError::UrlRejected(format!(
                "hostname {host} resolves to blocked address {}",
                addr.ip()
            )));
        }
    }
    Ok(())
}

/// Verify the peer we actually connected to.
///
/// Runs after the TCP connection but before status or body are surfaced, so
/// a DNS answer that changed between validation and connect cannot reach an
/// internal service.
pub fn verify_peer(addr: Option<SocketAddr>) -> Result<(), FetchError> {
    match addr {
        Some(peer) if !is_ip_safe(peer.ip()) => {
            Err(FetchError::RebindingRejected(peer.ip().to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_blocked_ipv4_ranges() {
        for bad in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "198.18.0.1",
            "255.255.255.255",
            "240.0.0.1",
        ] {
            assert!(!is_ip_safe(v4(bad)), "{bad} must be blocked");
        }
        for good in ["8.8.8.8", "1.1.1.1", "185.11.136.4"] {
            assert!(is_ip_safe(v4(good)), "{good} must be allowed");
        }
    }

    #[test]
    fn test_blocked_ipv6_ranges() {
        for bad in ["::1", "fe80::1", "fc00::1", "ff02::1", "::", "2001:db8::1"] {
            assert!(!is_ip_safe(bad.parse().unwrap()), "{bad} must be blocked");
        }
        assert!(is_ip_safe("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_unwrapped() {
        assert!(!is_ip_safe("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_ip_safe("::ffff:192.168.1.1".parse().unwrap()));
        assert!(is_ip_safe("::ffff:8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_validate_url_schemes_and_ports() {
        assert!(validate_url("ftp://example.org/").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("https://example.org:9443/x").is_err());
        assert!(validate_url("https://example.org:8443/y").is_err());
        assert!(validate_url("https://example.org:443/ok").is_ok());
        assert!(validate_url("http://example.org:80/ok").is_ok());
        assert!(validate_url("https://example.org/ok").is_ok());
    }

    #[test]
    fn test_validate_url_blocked_tlds() {
        for bad in [
            "http://infra.arpa/",
            "http://service.kubernetes/",
            "http://foo.cluster.local/",
            "http://foo.local./",
            "http://foo.internal./",
            "http://localhost/",
            "http://localhost./",
            "http://gateway.lan/",
            "http://build.corp/",
        ] {
            assert!(validate_url(bad).is_err(), "{bad} must be rejected");
        }
        assert!(validate_url("http://example.org./").is_ok());
    }

    #[test]
    fn test_validate_url_metadata_endpoint() {
        // Cloud metadata service: rejected before any connection
        let err = validate_url("https://169.254.169.254/latest/").unwrap_err();
        assert!(matches!(err, FetchError::UrlRejected(_)));
    }

    #[test]
    fn test_validate_url_literal_ipv6() {
        assert!(validate_url("http://[::1]/").is_err());
        assert!(validate_url("http://[fe80::1]/").is_err());
    }

    #[test]
    fn test_ensure_addrs_safe() {
        let mixed: Vec<SocketAddr> = vec![
            "8.8.8.8:443".parse().unwrap(),
            "10.0.0.5:443".parse().unwrap(),
        ];
        assert!(ensure_addrs_safe("h.example.org", &mixed).is_err());
        let ok: Vec<SocketAddr> = vec!["8.8.8.8:443".parse().unwrap()];
        assert!(ensure_addrs_safe("h.example.org", &ok).is_ok());
        assert!(ensure_addrs_safe("h.example.org", &[]).is_err());
    }

    #[test]
    fn test_verify_peer() {
        let bad: SocketAddr = "127.0.0.1:443".parse().unwrap();
        assert!(matches!(
            verify_peer(Some(bad)),
            Err(FetchError::RebindingRejected(_))
        ));
        let good: SocketAddr = "8.8.8.8:443".parse().unwrap();
        assert!(verify_peer(Some(good)).is_ok());
        // Transports that cannot report a peer stay usable
        assert!(verify_peer(None).is_ok());
    }
}

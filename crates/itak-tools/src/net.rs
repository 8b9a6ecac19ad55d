//! SSRF guard and network allowlist.
//!
//! Two layers: [`SsrfGuard::check`] rejects bad URLs before a request is
//! built (scheme, allowlist, literal-IP ranges), and [`SafeDnsResolver`]
//! filters every DNS resolution at connect time so a hostname pointing
//! into a private range cannot slip past the URL check. Outbound HTTP
//! clients must come from [`SsrfGuard::client`] to get the resolver.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use url::Url;

use crate::error::{ToolError, ToolResult};

/// Network policy for network-originating tools: which hosts the agent
/// may reach, plus the optional local search service exemption.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    /// Allowed host suffixes (`example.org` admits `api.example.org`).
    /// Empty means any public host.
    pub allowlist: Vec<String>,
    /// Exact hosts exempt from the private-range block (a local search
    /// service on the allowlist).
    pub local_exemptions: Vec<String>,
}

impl NetworkPolicy {
    /// A policy allowing any public host.
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Restrict to the given host suffixes.
    #[must_use]
    pub fn with_allowlist(mut self, hosts: Vec<String>) -> Self {
        self.allowlist = hosts;
        self
    }

    /// Exempt an exact host from the private-range block.
    #[must_use]
    pub fn with_local_exemption(mut self, host: impl Into<String>) -> Self {
        self.local_exemptions.push(host.into());
        self
    }

    /// Exempt several exact hosts from the private-range block.
    #[must_use]
    pub fn with_local_exemptions(mut self, hosts: Vec<String>) -> Self {
        self.local_exemptions.extend(hosts);
        self
    }

    fn is_exempt(&self, host: &str) -> bool {
        self.local_exemptions
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }

    fn host_allowed(&self, host: &str) -> bool {
        if self.allowlist.is_empty() {
            return true;
        }
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }
}

/// Whether an address is safe for an agent-initiated connection.
///
/// IPv4-mapped and IPv4-compatible IPv6 addresses are unwrapped first so
/// `::ffff:127.0.0.1` cannot bypass the IPv4 rules. Blocked: loopback,
/// unspecified, multicast, broadcast, `0.0.0.0/8`, RFC1918, link-local
/// `169.254.0.0/16`, CGNAT `100.64.0.0/10`, IPv6 unique-local and
/// link-local.
#[must_use]
pub fn is_safe_ip(mut ip: IpAddr) -> bool {
    if let IpAddr::V6(v6) = ip {
        if let Some(v4) = v6.to_ipv4_mapped() {
            ip = IpAddr::V4(v4);
        } else if let Some(v4) = v6.to_ipv4() {
            ip = IpAddr::V4(v4);
        }
    }

    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }

    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let blocked = octets[0] == 0
                || octets[0] == 10
                || octets[0] == 127
                || octets[0] == 255
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || (octets[0] == 169 && octets[1] == 254)
                || (octets[0] == 100 && (64..=127).contains(&octets[1]));
            !blocked
        },
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let blocked =
                (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80;
            !blocked
        },
    }
}

/// Resolve a hostname and keep only safe addresses. Exempt hosts skip
/// the filter. Fails when every resolved address is blocked, so a name
/// pointing into a private range never reaches the connector.
pub(crate) async fn resolve_filtered(
    host: &str,
    policy: &NetworkPolicy,
) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
    if policy.is_exempt(host) {
        return Ok(addrs);
    }
    let safe: Vec<SocketAddr> = addrs.into_iter().filter(|a| is_safe_ip(a.ip())).collect();
    if safe.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "DNS resolved only to blocked private or local addresses",
        ));
    }
    Ok(safe)
}

/// DNS resolver that filters resolutions through [`is_safe_ip`] before
/// the client may connect.
#[derive(Clone)]
pub struct SafeDnsResolver {
    policy: NetworkPolicy,
}

impl SafeDnsResolver {
    /// Create a resolver with the given policy.
    #[must_use]
    pub fn new(policy: NetworkPolicy) -> Self {
        Self { policy }
    }
}

impl reqwest::dns::Resolve for SafeDnsResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let policy = self.policy.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            let safe = resolve_filtered(&host, &policy)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            let iter: reqwest::dns::Addrs = Box::new(safe.into_iter());
            Ok(iter)
        })
    }
}

/// Rejects URLs that would reach loopback, link-local, or private ranges,
/// enforces the host allowlist, and hands out HTTP clients whose DNS
/// resolutions are filtered the same way.
#[derive(Debug, Clone)]
pub struct SsrfGuard {
    policy: NetworkPolicy,
    client: reqwest::Client,
}

impl SsrfGuard {
    /// Create a guard with the given policy.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed (TLS backend
    /// init); this happens once, at service wiring.
    #[must_use]
    pub fn new(policy: NetworkPolicy) -> Self {
        let client = reqwest::Client::builder()
            .dns_resolver(Arc::new(SafeDnsResolver::new(policy.clone())))
            .build()
            .expect("guarded HTTP client construction");
        Self { policy, client }
    }

    /// An HTTP client wired to the guard's DNS filter. Every outbound
    /// agent request goes through one of these.
    #[must_use]
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Validate a URL before any outbound request. Returns the parsed URL
    /// so callers cannot accidentally fetch something else. Hostnames are
    /// additionally filtered at resolution time by the guard's client.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::PolicyViolation`] for non-HTTP schemes, blocked
    /// IP ranges, and hosts outside the allowlist.
    pub fn check(&self, raw: &str) -> ToolResult<Url> {
        let url = Url::parse(raw)
            .map_err(|e| ToolError::PolicyViolation(format!("unparseable URL: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::PolicyViolation(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }

        let Some(host) = url.host_str() else {
            return Err(ToolError::PolicyViolation("URL has no host".into()));
        };

        let exempt = self.policy.is_exempt(host);

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !is_safe_ip(ip) && !exempt {
                return Err(ToolError::PolicyViolation(format!(
                    "target {ip} is in a blocked range"
                )));
            }
        } else if !exempt {
            let lowered = host.to_ascii_lowercase();
            if lowered == "localhost" || lowered.ends_with(".local") {
                return Err(ToolError::PolicyViolation(format!(
                    "target host '{host}' is local"
                )));
            }
        }

        if !exempt && !self.policy.host_allowed(host) {
            return Err(ToolError::PolicyViolation(format!(
                "host '{host}' is not on the allowlist"
            )));
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SsrfGuard {
        SsrfGuard::new(NetworkPolicy::open())
    }

    #[test]
    fn metadata_endpoint_is_blocked() {
        let err = guard()
            .check("http://169.254.169.254/latest/meta-data")
            .unwrap_err();
        assert!(matches!(err, ToolError::PolicyViolation(_)));
    }

    #[test]
    fn loopback_and_private_ranges_are_blocked() {
        for url in [
            "http://127.0.0.1:8080/",
            "http://10.1.2.3/",
            "http://192.168.0.10/admin",
            "http://172.16.5.5/",
            "http://localhost/",
            "http://[::1]/",
        ] {
            assert!(guard().check(url).is_err(), "{url} should be blocked");
        }
    }

    #[test]
    fn mapped_cgnat_and_zero_ranges_are_blocked() {
        for ip in [
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
            "::ffff:169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.1",
            "fc00::1",
            "fe80::1",
        ] {
            assert!(!is_safe_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "2001:4860:4860::8888"] {
            assert!(is_safe_ip(ip.parse().unwrap()), "{ip} should pass");
        }
    }

    #[tokio::test]
    async fn hostname_resolving_to_loopback_is_blocked() {
        // A hostname, not a literal IP: resolution goes through the hosts
        // file and lands on 127.0.0.1, which the filter must reject.
        let err = resolve_filtered("localhost", &NetworkPolicy::open())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn exempt_hostname_resolves_despite_private_addresses() {
        let policy = NetworkPolicy::open().with_local_exemption("localhost");
        let addrs = resolve_filtered("localhost", &policy).await.unwrap();
        assert!(!addrs.is_empty());
    }

    #[test]
    fn public_hosts_pass_an_open_policy() {
        assert!(guard().check("https://example.org/page").is_ok());
    }

    #[test]
    fn allowlist_restricts_hosts() {
        let guard = SsrfGuard::new(
            NetworkPolicy::open().with_allowlist(vec!["example.org".to_string()]),
        );
        assert!(guard.check("https://api.example.org/v1").is_ok());
        assert!(guard.check("https://evil.test/").is_err());
    }

    #[test]
    fn local_search_exemption_admits_private_host() {
        let guard = SsrfGuard::new(
            NetworkPolicy::open()
                .with_allowlist(vec!["example.org".to_string()])
                .with_local_exemption("127.0.0.1"),
        );
        assert!(guard.check("http://127.0.0.1:8888/search?q=x").is_ok());
    }

    #[test]
    fn non_http_schemes_are_blocked() {
        assert!(guard().check("file:///etc/passwd").is_err());
        assert!(guard().check("ftp://example.org/").is_err());
    }
}

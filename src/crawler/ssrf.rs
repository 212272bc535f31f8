//! SSRF (Server-Side Request Forgery) validation for crawl targets.
//!
//! Every URL the crawler is about to dial — the feed URL itself and every
//! redirect hop — passes through [`validate_url`] first. Validation has two
//! layers: a cheap syntactic check (scheme, literal-IP host) and a DNS
//! resolution check that rejects a host whose *resolved* address is
//! loopback, private, link-local, or unspecified. A hostname that resolves
//! only to public addresses is allowed even if a DNS answer could
//! theoretically change later (TOCTOU against DNS is out of scope here —
//! see Non-goals).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("host is missing")]
    MissingHost,
    #[error("host resolves to a disallowed address: {0}")]
    DisallowedAddress(IpAddr),
    #[error("DNS resolution failed for host {host}: {source}")]
    ResolutionFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parses and validates a URL for crawling: scheme allowlist plus a literal-IP check.
///
/// This is the cheap, synchronous half of validation. Callers that are about
/// to dial the network should also call [`resolve_and_check`] on the
/// returned URL's host to catch hostnames that resolve to disallowed
/// addresses.
pub fn validate_url(url_str: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(url_str).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::UnsupportedScheme(other.to_owned())),
    }

    let host = url.host_str().ok_or(SsrfError::MissingHost)?;

    // If the host is itself a literal IP address, it must already be a
    // public address — no DNS resolution to perform.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed(&ip) {
            return Err(SsrfError::DisallowedAddress(ip));
        }
    }

    Ok(url)
}

/// Resolves `host` and rejects it unless every resolved address is a public,
/// routable address. Literal-IP hosts (already checked in [`validate_url`])
/// resolve to themselves and are re-checked here for defense in depth.
pub async fn resolve_and_check(host: &str, port: u16) -> Result<(), SsrfError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return if is_disallowed(&ip) {
            Err(SsrfError::DisallowedAddress(ip))
        } else {
            Ok(())
        };
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| SsrfError::ResolutionFailed {
            host: host.to_owned(),
            source,
        })?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        let ip = addr.ip();
        if is_disallowed(&ip) {
            return Err(SsrfError::DisallowedAddress(ip));
        }
    }

    if !saw_any {
        return Err(SsrfError::ResolutionFailed {
            host: host.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    }

    Ok(())
}

fn is_disallowed(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_disallowed_v4(v4),
        IpAddr::V6(v6) => is_disallowed_v6(v6),
    }
}

fn is_disallowed_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_disallowed_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }

    // IPv4-mapped IPv6 (::ffff:a.b.c.d) must be checked against the IPv4 ranges,
    // otherwise an attacker can bypass the IPv6 checks by wrapping a private
    // IPv4 address.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_disallowed_v4(&v4);
    }

    let segments = ip.segments();

    // Unique Local Address fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }

    // Link-Local fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }

    false
}

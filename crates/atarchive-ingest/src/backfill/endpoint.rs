//! Hosting endpoint normalization and validation.
//!
//! Endpoints come from untrusted directory operations, so before a job is
//! created the endpoint is normalized (so that cosmetic variants share one
//! host queue) and checked against a blocklist of addresses that must never
//! be fetched from.
//!
//! # Normalization Rules
//!
//! - Scheme must be `https://` or `http://`
//! - Scheme and host are lowercased, default ports dropped
//! - Trailing slashes removed, paths otherwise preserved
//! - Query strings, fragments and credentials are rejected
//!
//! # Filtering Rules
//!
//! Unless private hosts are explicitly allowed, endpoints are rejected if the
//! host is `localhost`, a `.local`/`.internal` name, or an IP literal in a
//! loopback, private, CGNAT, link-local, documentation, multicast or reserved
//! range (IPv4 or IPv6).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;

use crate::{Error, Result};

/// Options for endpoint normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointOptions {
    /// Allow loopback and private hosts. For local development and tests.
    pub allow_private: bool,
}

/// Normalize an endpoint, or explain why it is unusable.
pub fn normalize_endpoint(endpoint: &str, opts: EndpointOptions) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint.trim()).map_err(|e| invalid(&e.to_string()))?;

    if !matches!(url.scheme(), "https" | "http") {
        return Err(invalid("scheme must be https or http"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials not allowed"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment not allowed"));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    if !opts.allow_private
        && let Some(reason) = check_blocklist(host)
    {
        return Err(invalid(reason));
    }

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    Ok(normalized)
}

/// `host[:port]` of a normalized endpoint; the unit of per-host politeness.
pub fn host_key(endpoint: &str) -> String {
    Url::parse(endpoint)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| endpoint.to_string())
}

/// Returns `Some(reason)` if blocked, `None` if allowed.
fn check_blocklist(host: &str) -> Option<&'static str> {
    // IPv6 literals come bracketed.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return is_private_ip(&ip).then_some("private or reserved IP address not allowed");
    }

    let domain = host.trim_end_matches('.');
    if domain == "localhost" || domain.ends_with(".localhost") {
        Some("localhost not allowed")
    } else if domain.ends_with(".local") {
        Some(".local addresses not allowed")
    } else if domain.ends_with(".internal") {
        Some(".internal addresses not allowed")
    } else if !domain.contains('.') {
        Some("single-label host not allowed")
    } else {
        None
    }
}

/// Whether an address is loopback, private, or otherwise not publicly routable.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()                 // 127.0.0.0/8
            || ipv4.is_unspecified()           // 0.0.0.0
            || ipv4.is_broadcast()             // 255.255.255.255
            || ipv4.is_link_local()            // 169.254.0.0/16
            || ipv4.is_private()               // 10/8, 172.16/12, 192.168/16
            || ipv4.is_documentation()         // TEST-NET-1/2/3
            || ipv4.is_multicast()             // 224.0.0.0/4
            || is_ipv4_cgnat(*ipv4)            // 100.64.0.0/10
            || is_ipv4_benchmarking(*ipv4)     // 198.18.0.0/15
            || ipv4.octets()[0] >= 240 // 240.0.0.0/4
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()                 // ::1
            || ipv6.is_unspecified()           // ::
            || ipv6.is_multicast()             // ff00::/8
            || is_ipv6_link_local(*ipv6)       // fe80::/10
            || is_ipv6_unique_local(*ipv6)     // fc00::/7
            || ipv6.to_ipv4_mapped().is_some() // ::ffff:0:0/96
            || is_ipv6_documentation(*ipv6) // 2001:db8::/32
        }
    }
}

fn is_ipv4_cgnat(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (64..=127).contains(&octets[1])
}

fn is_ipv4_benchmarking(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 198 && (octets[1] == 18 || octets[1] == 19)
}

fn is_ipv6_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn is_ipv6_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_ipv6_documentation(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    segments[0] == 0x2001 && segments[1] == 0x0db8
}

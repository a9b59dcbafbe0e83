//! Seed validation and normalization.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

use crate::types::{Seed, SeedKind};

/// Public resolvers and placeholders that show up in cloud configs but
/// never belong to the account.
pub const IGNORED_IPS: &[&str] = &[
    "0.0.0.0",
    "1.0.0.1",
    "1.1.1.1",
    "1.1.1.2",
    "4.4.4.4",
    "8.8.4.4",
    "8.8.8.8",
    "9.9.9.9",
    "9.9.9.10",
    "149.112.112.112",
    "208.67.220.220",
    "208.67.222.222",
    "209.244.0.3",
    "209.244.0.4",
    "64.6.64.6",
    "64.6.65.6",
    "84.200.69.80",
    "84.200.70.40",
    "8.26.56.26",
    "8.20.247.20",
    "199.85.126.10",
    "199.85.127.10",
];

pub const IGNORED_DOMAINS: &[&str] = &[
    "amazonaws.com",
    "autodiscover.outlook.com",
    "aws.com",
    "azure.com",
    "dcv.digicert.com",
    "google.com",
    "lync.com",
    "mail.google.com",
    "microsoft.com",
    "sendgrid.net",
    "webdir.online.lync.com",
    "windows.net",
    "www.google.com",
    "www.microsoft.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeedRejection {
    #[error("not an IP address")]
    InvalidIp,
    #[error("IP address is not public")]
    NonPublicIp,
    #[error("IP address is in the ignore list")]
    IgnoredIp,
    #[error("domain is not valid")]
    InvalidDomain,
    #[error("domain contains an underscore")]
    Underscore,
    #[error("domain is in the ignore list")]
    IgnoredDomain,
}

/// Normalize a raw value into a seed of the given kind.
pub fn normalize(kind: SeedKind, raw: &str) -> Result<Seed, SeedRejection> {
    let value = match kind {
        SeedKind::Ip => normalize_ip(raw)?,
        SeedKind::Domain => normalize_domain(raw)?,
    };
    Ok(Seed { kind, value })
}

pub fn normalize_ip(raw: &str) -> Result<String, SeedRejection> {
    let ip: IpAddr = raw.trim().parse().map_err(|_| SeedRejection::InvalidIp)?;
    let public = match ip {
        IpAddr::V4(v4) => is_public_v4(&v4),
        IpAddr::V6(v6) => is_public_v6(&v6),
    };
    if !public {
        return Err(SeedRejection::NonPublicIp);
    }
    let value = ip.to_string();
    if IGNORED_IPS.contains(&value.as_str()) {
        return Err(SeedRejection::IgnoredIp);
    }
    Ok(value)
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10 shared address space
        || (a == 100 && (64..128).contains(&b))
        // 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(&v4);
    }
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8))
}

/// Reduce a hostname or URL to a lowercased host.
pub fn normalize_domain(raw: &str) -> Result<String, SeedRejection> {
    let mut value = raw.trim();
    if let Some((_, rest)) = value.split_once("://") {
        value = rest;
    }
    let value = value
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    // drop userinfo and port
    let value = value.rsplit('@').next().unwrap_or_default();
    let value = match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => value,
    };
    let host = value.strip_suffix('.').unwrap_or(value).to_lowercase();

    if host.contains('_') {
        return Err(SeedRejection::Underscore);
    }
    if !is_valid_host(&host) {
        return Err(SeedRejection::InvalidDomain);
    }
    if IGNORED_DOMAINS.contains(&host.as_str()) {
        return Err(SeedRejection::IgnoredDomain);
    }
    Ok(host)
}

fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '*')
    })
}

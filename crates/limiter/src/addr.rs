//! Source-address normalization for rate limiting

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Strip a port and scope id from an address string, yielding the bare IP
/// when it parses. Unparsable input is returned as-is so callers can still
/// use it as an opaque bucket key.
pub fn extract_ip(address: &str) -> (Option<IpAddr>, String) {
    let trimmed = address.trim();

    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return (Some(sock.ip()), sock.ip().to_string());
    }

    let bare = trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split('%')
        .next()
        .unwrap_or(trimmed);

    match bare.parse::<IpAddr>() {
        Ok(ip) => (Some(ip), ip.to_string()),
        Err(_) => (None, trimmed.to_string()),
    }
}

/// Bucket key for an address.
///
/// IPv4 addresses are keyed individually. IPv6 sources are keyed by their
/// /64 prefix, since a single host typically controls the whole prefix.
pub fn normalize_for_limit(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let prefix = Ipv6Addr::new(seg[0], seg[1], seg[2], seg[3], 0, 0, 0, 0);
            format!("{}/64", prefix)
        }
    }
}

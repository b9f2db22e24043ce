use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Resolve a target string to an IPv4 address.
///
/// Literal IPv4 addresses short-circuit the blocking DNS lookup. IPv6 results
/// are skipped since the probe transport is IPv4-only.
pub fn resolve_ipv4(target: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        };
    }

    (target, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_v4_address_resolves_without_dns() {
        assert_eq!(
            resolve_ipv4("203.0.113.5"),
            Some(Ipv4Addr::new(203, 0, 113, 5))
        );
        assert_eq!(resolve_ipv4("127.0.0.1"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn literal_v6_address_is_rejected() {
        assert_eq!(resolve_ipv4("::1"), None);
    }

    #[test]
    fn unresolvable_name_yields_none() {
        assert_eq!(resolve_ipv4("host.invalid."), None);
    }
}

//! Peer-address helpers: total-order comparison, numeric formatting, and
//! port extraction.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

/// A peer address across the supported families.
///
/// Families order `Unix < Inet4 < Inet6`, matching their numeric family
/// constants on the platforms this crate targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// A Unix-domain path.
    Unix(String),
    /// An IPv4 or IPv6 socket address.
    Inet(SocketAddr),
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

fn family_rank(addr: &PeerAddress) -> u8 {
    match addr {
        PeerAddress::Unix(_) => 0,
        PeerAddress::Inet(SocketAddr::V4(_)) => 1,
        PeerAddress::Inet(SocketAddr::V6(_)) => 2,
    }
}

/// Compare two addresses, yielding a total order.
///
/// Family first; within a family: Unix paths compare as strings, IPv4 by
/// host-order address then port, IPv6 by the 16 address bytes, port,
/// flowinfo, and scope id as tiebreakers.
#[must_use]
pub fn compare_address(x: &PeerAddress, y: &PeerAddress) -> Ordering {
    match family_rank(x).cmp(&family_rank(y)) {
        Ordering::Equal => {}
        unequal => return unequal,
    }

    match (x, y) {
        (PeerAddress::Unix(a), PeerAddress::Unix(b)) => a.cmp(b),
        (PeerAddress::Inet(SocketAddr::V4(a)), PeerAddress::Inet(SocketAddr::V4(b))) => {
            u32::from(*a.ip())
                .cmp(&u32::from(*b.ip()))
                .then_with(|| a.port().cmp(&b.port()))
        }
        (PeerAddress::Inet(SocketAddr::V6(a)), PeerAddress::Inet(SocketAddr::V6(b))) => a
            .ip()
            .octets()
            .cmp(&b.ip().octets())
            .then_with(|| a.port().cmp(&b.port()))
            .then_with(|| a.flowinfo().cmp(&b.flowinfo()))
            .then_with(|| a.scope_id().cmp(&b.scope_id())),
        _ => unreachable!("family ranks matched"),
    }
}

/// Format the numeric host part of an address.
///
/// IPv4 takes a fast path that formats the dotted quad from the host-order
/// 32-bit address; other inet addresses delegate to the standard numeric
/// formatter. Unix addresses have no host; `None`.
#[must_use]
pub fn numeric_host(addr: &PeerAddress) -> Option<String> {
    match addr {
        PeerAddress::Unix(_) => None,
        PeerAddress::Inet(inet) => match inet.ip() {
            IpAddr::V4(ip) => {
                let bits = u32::from(ip);
                Some(format!(
                    "{}.{}.{}.{}",
                    bits >> 24,
                    (bits >> 16) & 255,
                    (bits >> 8) & 255,
                    bits & 255
                ))
            }
            IpAddr::V6(ip) => Some(ip.to_string()),
        },
    }
}

/// The host-order port for inet addresses; `None` otherwise.
#[must_use]
pub fn port(addr: &PeerAddress) -> Option<u16> {
    match addr {
        PeerAddress::Unix(_) => None,
        PeerAddress::Inet(inet) => Some(inet.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> PeerAddress {
        PeerAddress::Inet(s.parse().unwrap())
    }

    #[test]
    fn families_order_unix_v4_v6() {
        let unix = PeerAddress::Unix("/tmp/sock".into());
        let four = v4("10.0.0.1:80");
        let six = PeerAddress::Inet("[::1]:80".parse().unwrap());
        assert_eq!(compare_address(&unix, &four), Ordering::Less);
        assert_eq!(compare_address(&four, &six), Ordering::Less);
        assert_eq!(compare_address(&six, &unix), Ordering::Greater);
    }

    #[test]
    fn v4_orders_by_address_then_port() {
        assert_eq!(
            compare_address(&v4("10.0.0.1:9000"), &v4("10.0.0.2:80")),
            Ordering::Less
        );
        assert_eq!(
            compare_address(&v4("10.0.0.1:80"), &v4("10.0.0.1:9000")),
            Ordering::Less
        );
        assert_eq!(
            compare_address(&v4("10.0.0.1:80"), &v4("10.0.0.1:80")),
            Ordering::Equal
        );
    }

    #[test]
    fn numeric_host_fast_path() {
        assert_eq!(
            numeric_host(&v4("192.168.1.10:443")).as_deref(),
            Some("192.168.1.10")
        );
        assert_eq!(numeric_host(&PeerAddress::Unix("/x".into())), None);
    }

    #[test]
    fn port_extraction() {
        assert_eq!(port(&v4("10.0.0.1:443")), Some(443));
        assert_eq!(port(&PeerAddress::Unix("/x".into())), None);
    }
}

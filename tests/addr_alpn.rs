//! Address-comparison ordering properties and ALPN selection scenarios.

mod common;

use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use common::{init_test_logging, test_proptest_config};
use evsock::alpn::{encode_protocol_list, select_protocol};
use evsock::{compare_address, numeric_host, port, PeerAddress};
use proptest::prelude::*;

fn arb_address() -> impl Strategy<Value = PeerAddress> {
    prop_oneof![
        "[a-z0-9/._-]{1,40}".prop_map(PeerAddress::Unix),
        (any::<u32>(), any::<u16>()).prop_map(|(ip, port)| {
            PeerAddress::Inet(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }),
        (any::<u128>(), any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
            |(ip, port, flowinfo, scope)| {
                PeerAddress::Inet(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    port,
                    flowinfo,
                    scope,
                )))
            }
        ),
    ]
}

proptest! {
    #![proptest_config(test_proptest_config(512))]

    /// Comparison is reflexive.
    #[test]
    fn compare_is_reflexive(addr in arb_address()) {
        init_test_logging();
        prop_assert_eq!(compare_address(&addr, &addr), Ordering::Equal);
    }

    /// Comparison is antisymmetric.
    #[test]
    fn compare_is_antisymmetric(x in arb_address(), y in arb_address()) {
        init_test_logging();
        let forward = compare_address(&x, &y);
        let backward = compare_address(&y, &x);
        prop_assert_eq!(forward, backward.reverse());
    }

    /// Comparison is transitive.
    #[test]
    fn compare_is_transitive(
        mut addrs in proptest::collection::vec(arb_address(), 3)
    ) {
        init_test_logging();
        addrs.sort_by(compare_address);
        let (a, b, c) = (&addrs[0], &addrs[1], &addrs[2]);
        prop_assert_ne!(compare_address(a, b), Ordering::Greater);
        prop_assert_ne!(compare_address(b, c), Ordering::Greater);
        prop_assert_ne!(compare_address(a, c), Ordering::Greater);
    }

    /// Equal comparison means equal observable fields.
    #[test]
    fn equal_addresses_agree_on_host_and_port(x in arb_address(), y in arb_address()) {
        init_test_logging();
        if compare_address(&x, &y) == Ordering::Equal {
            prop_assert_eq!(numeric_host(&x), numeric_host(&y));
            prop_assert_eq!(port(&x), port(&y));
        }
    }
}

#[test]
fn ipv4_numeric_host_matches_display() {
    init_test_logging();
    let addr = PeerAddress::Inet("203.0.113.9:8443".parse().unwrap());
    assert_eq!(numeric_host(&addr).as_deref(), Some("203.0.113.9"));
    assert_eq!(port(&addr), Some(8443));
}

#[test]
fn server_preference_wins_alpn_selection() {
    init_test_logging();
    let server = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    // Literal wire offer: "\x08http/1.1\x02h2".
    assert_eq!(
        select_protocol(&server, b"\x08http/1.1\x02h2"),
        Some(b"h2".as_slice())
    );
}

#[test]
fn malformed_client_offer_is_rejected() {
    init_test_logging();
    let server = vec![b"h2".to_vec()];
    // Truncated length prefix.
    assert_eq!(select_protocol(&server, b"\x10h2"), None);
}

#[test]
fn wire_roundtrip_keeps_client_order() {
    init_test_logging();
    let offer = vec![b"http/1.1".to_vec(), b"h2".to_vec()];
    let wire = encode_protocol_list(&offer);
    assert_eq!(wire, b"\x08http/1.1\x02h2");
    // A server preferring what the client listed last still wins.
    let server = vec![b"h2".to_vec()];
    assert_eq!(select_protocol(&server, &wire), Some(b"h2".as_slice()));
}

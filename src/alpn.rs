//! ALPN protocol lists: wire encoding and server-side selection.
//!
//! The client offers an ordered list of protocol names; the server picks
//! the first protocol from its *own* ordered list that appears anywhere in
//! the client's offer. A malformed client list rejects the negotiation
//! outright (no-ack); the connection then carries no protocol rather than
//! failing.
//!
//! [`select_protocol`] is the deciding function for server handshakes:
//! the rustls engine's accept path re-encodes each connection's parsed
//! offer through [`encode_protocol_list`] and applies the verdict to the
//! per-connection config (see `engine::rustls`).

/// Encode an ordered protocol list into the ALPN wire format
/// (length-prefixed names).
#[must_use]
pub fn encode_protocol_list(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(protocols.iter().map(|p| p.len() + 1).sum());
    for proto in protocols {
        debug_assert!(!proto.is_empty() && proto.len() <= 255);
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto);
    }
    wire
}

/// Select a protocol for the server side.
///
/// `server_preferences` is the server's ordered list; `client_wire` is the
/// client's offer in wire format. Returns the winning protocol, or `None`
/// (no-ack) when nothing matches or the client list is malformed.
#[must_use]
pub fn select_protocol<'a>(
    server_preferences: &'a [Vec<u8>],
    client_wire: &[u8],
) -> Option<&'a [u8]> {
    for preference in server_preferences {
        let mut rest = client_wire;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if tail.len() < len {
                // Broken offer.
                return None;
            }
            let (candidate, tail) = tail.split_at(len);
            if candidate == preference.as_slice() {
                return Some(preference);
            }
            rest = tail;
        }
    }
    None
}

//! Protocol sniffing for the first bytes of an inbound connection.
//!
//! Detection looks only at leading bytes and never consumes anything;
//! the caller keeps the sniffed bytes in the receive buffer and replays
//! them through whichever framer (or TLS session) detection selects.

use super::varlen;

/// HTTP method tokens accepted by the line-oriented upgrade path.
const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"OPTIONS", b"PATCH", b"TRACE", b"CONNECT",
];

/// Outcome of sniffing the leading bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    /// Variable-length binary framing signature.
    Binary,
    /// TLS record header (ClientHello); switch to an inline TLS session
    /// fed from the already-buffered bytes.
    Tls,
    /// ASCII HTTP method token; hand off to line framing.
    Http,
    /// Not enough bytes yet to decide.
    NeedMore,
    /// Leading bytes match no known protocol.
    Unknown,
}

/// Classify the leading bytes of an inbound connection.
pub fn sniff(src: &[u8]) -> Detected {
    if src.is_empty() {
        return Detected::NeedMore;
    }
    match src[0] {
        // Binary connect packet: fixed first byte plus a well-formed
        // variable-length header behind it.
        0x10 => match varlen::decode_len(&src[1..]) {
            Ok(Some(_)) => Detected::Binary,
            Ok(None) => Detected::NeedMore,
            Err(_) => Detected::Unknown,
        },
        // TLS record: content type 22 (handshake), major version 3.
        0x16 => {
            if src.len() < 3 {
                Detected::NeedMore
            } else if src[1] == 0x03 {
                Detected::Tls
            } else {
                Detected::Unknown
            }
        }
        _ => sniff_http(src),
    }
}

fn sniff_http(src: &[u8]) -> Detected {
    for method in HTTP_METHODS {
        let cmp = method.len().min(src.len());
        if &src[..cmp] != &method[..cmp] {
            continue;
        }
        if src.len() <= method.len() {
            return Detected::NeedMore;
        }
        if src[method.len()] == b' ' {
            return Detected::Http;
        }
    }
    Detected::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_binary_signature() {
        assert_eq!(sniff(&[0x10, 0x0C, 0x00]), Detected::Binary);
    }

    #[test]
    fn binary_signature_with_partial_length_waits() {
        assert_eq!(sniff(&[0x10]), Detected::NeedMore);
        assert_eq!(sniff(&[0x10, 0x80]), Detected::NeedMore);
    }

    #[test]
    fn recognizes_tls_client_hello() {
        assert_eq!(sniff(&[0x16, 0x03, 0x01]), Detected::Tls);
        assert_eq!(sniff(&[0x16, 0x03]), Detected::NeedMore);
        assert_eq!(sniff(&[0x16, 0x02, 0x00]), Detected::Unknown);
    }

    #[test]
    fn recognizes_http_methods() {
        assert_eq!(sniff(b"GET / HTTP/1.1"), Detected::Http);
        assert_eq!(sniff(b"OPTIONS *"), Detected::Http);
        assert_eq!(sniff(b"GE"), Detected::NeedMore);
        assert_eq!(sniff(b"GETX"), Detected::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(sniff(&[0xFF, 0x00, 0x01]), Detected::Unknown);
        assert_eq!(sniff(b"ZZZZ "), Detected::Unknown);
    }
}

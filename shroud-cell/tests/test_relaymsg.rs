//! Byte-level tests for relay-message encoding.
//!
//! Each case here round-trips a message through its wire form and
//! checks the bytes against a fixed vector, so that accidental format
//! changes show up as test failures rather than network breakage.

use shroud_cell::relaycell::msg::{
    Body, Connected, Data, End, EndReason, IpVersionPreference, RelayMsg, Resolve, Sendme,
};
use shroud_cell::relaycell::{RelayCell, RelayCmd, StreamId};

use hex_literal::hex;

/// Decode `body` as the relay message for `cmd`, and check that
/// re-encoding it gives the same bytes back.
fn msg_roundtrip(cmd: RelayCmd, body: &[u8]) -> RelayMsg {
    let mut r = shroud_bytes::Reader::from_slice(body);
    let msg = RelayMsg::decode_from_reader(cmd, &mut r).unwrap();
    r.should_be_exhausted().unwrap();
    let mut encoded = Vec::new();
    msg.clone().encode_onto(&mut encoded);
    assert_eq!(&encoded[..], body);
    msg
}

#[test]
fn begin_wire_format() {
    let msg = msg_roundtrip(RelayCmd::BEGIN, b"www.example.com:443\0");
    match msg {
        RelayMsg::Begin(b) => {
            assert_eq!(b.addr(), b"www.example.com");
            assert_eq!(b.port(), 443);
            assert!(b.ipv4_okay());
            assert!(!b.ipv6_okay());
        }
        _ => panic!(),
    }

    // With flags.
    let msg = msg_roundtrip(RelayCmd::BEGIN, &hex!("7777772e746f7270726f6a6563742e6f72673a34343300 00000001")[..]);
    match msg {
        RelayMsg::Begin(b) => {
            assert_eq!(b.port(), 443);
            assert!(b.ipv6_okay());
        }
        _ => panic!(),
    }

    // Non-ascii target addresses are rejected outright.
    use shroud_cell::relaycell::msg::Begin;
    assert!(Begin::new("contrôle.example", 80, IpVersionPreference::default()).is_err());
}

#[test]
fn end_wire_format() {
    // A plain END with no body decodes as MISC.
    let mut r = shroud_bytes::Reader::from_slice(&[]);
    let msg = RelayMsg::decode_from_reader(RelayCmd::END, &mut r).unwrap();
    match msg {
        RelayMsg::End(e) => assert_eq!(e.reason(), EndReason::MISC),
        _ => panic!(),
    }

    // DONE round-trips.
    let msg = msg_roundtrip(RelayCmd::END, &hex!("06"));
    match msg {
        RelayMsg::End(e) => assert_eq!(e.reason(), EndReason::DONE),
        _ => panic!(),
    }

    // EXITPOLICY carries address and ttl.
    let msg = msg_roundtrip(RelayCmd::END, &hex!("04 7f000001 00000100"));
    match msg {
        RelayMsg::End(e) => assert_eq!(e.reason(), EndReason::EXITPOLICY),
        _ => panic!(),
    }

    // Building one locally gives the same encoding.
    let mut v = Vec::new();
    End::new_exitpolicy("127.0.0.1".parse().unwrap(), 256).encode_onto(&mut v);
    assert_eq!(&v[..], &hex!("04 7f000001 00000100"));
}

#[test]
fn sendme_wire_format() {
    // Stream-level sendme: no body at all.
    let mut v = Vec::new();
    Sendme::new_empty().encode_onto(&mut v);
    assert_eq!(v.len(), 0);

    // Authenticated circuit-level sendme: version 1, 20-byte tag.
    let tag = hex!("6400000000000000000000000000000000000000");
    let msg = msg_roundtrip(RelayCmd::SENDME, &hex!("01 0014 6400000000000000000000000000000000000000")[..]);
    match msg {
        RelayMsg::Sendme(s) => assert_eq!(s.into_tag().unwrap(), tag.to_vec()),
        _ => panic!(),
    }

    // An unknown sendme version is an error.
    let mut r = shroud_bytes::Reader::from_slice(&hex!("02 0000"));
    assert!(RelayMsg::decode_from_reader(RelayCmd::SENDME, &mut r).is_err());
}

#[test]
fn connected_wire_format() {
    let msg = msg_roundtrip(RelayCmd::CONNECTED, &hex!("c633640a 00000e10"));
    match msg {
        RelayMsg::Connected(c) => {
            let (addr, ttl) = c.addr().unwrap();
            assert_eq!(addr, "198.51.100.10".parse::<std::net::IpAddr>().unwrap());
            assert_eq!(ttl, 3600);
        }
        _ => panic!(),
    }

    // An empty connected message is fine too.
    let mut v = Vec::new();
    Connected::new_empty().encode_onto(&mut v);
    assert_eq!(v.len(), 0);
}

#[test]
fn resolve_reverse_name() {
    let addr = "198.51.100.7".parse().unwrap();
    let r = Resolve::new_reverse(&addr);
    assert_eq!(r.query(), b"7.100.51.198.in-addr.arpa");
}

#[test]
fn relaycell_roundtrip() {
    let mut rng = rand::thread_rng();
    let data = Data::new(b"GET / HTTP/1.0\r\n");
    let cell = RelayCell::new(5.into(), data.into_message());
    let body = cell.encode(&mut rng).unwrap();
    let decoded = RelayCell::decode(body).unwrap();
    let (id, msg) = decoded.into_streamid_and_msg();
    assert_eq!(id, StreamId::from(5));
    match msg {
        RelayMsg::Data(d) => assert_eq!(d.as_ref(), b"GET / HTTP/1.0\r\n"),
        _ => panic!(),
    }
}

#[test]
fn data_counts_towards_windows() {
    let data: RelayMsg = Data::new(b"x").into_message();
    assert!(data.counts_towards_windows());
    let sendme: RelayMsg = Sendme::new_empty().into_message();
    assert!(!sendme.counts_towards_windows());
    let end: RelayMsg = End::new_misc().into_message();
    assert!(!end.counts_towards_windows());
}

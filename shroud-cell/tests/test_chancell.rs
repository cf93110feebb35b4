//! Byte-level tests for channel-cell encoding.

use shroud_cell::chancell::codec::ChannelCodec;
use shroud_cell::chancell::msg::{self, Body, ChanMsg};
use shroud_cell::chancell::{ChanCell, ChanCmd, CircId};

use bytes::BytesMut;
use hex_literal::hex;

/// Encode `cell` on a channel with protocol version `ver` and check
/// the bytes; then decode the bytes and re-encode, making sure we get
/// the same thing back.
fn test_encode(ver: u16, cell: ChanCell, expected_prefix: &[u8], fixed: bool) {
    let mut codec = ChannelCodec::new(ver);
    let mut encoded = BytesMut::new();
    codec.write_cell(cell, &mut encoded).unwrap();
    if fixed {
        let idlen = if ver >= 4 { 4 } else { 2 };
        assert_eq!(encoded.len(), 509 + 1 + idlen);
    }
    assert_eq!(&encoded[..expected_prefix.len()], expected_prefix);

    // Decode and re-encode: same bytes.
    let mut decode_from = encoded.clone();
    let decoded = codec.decode_cell(&mut decode_from).unwrap().unwrap();
    assert_eq!(decode_from.len(), 0);
    let mut reencoded = BytesMut::new();
    codec.write_cell(decoded, &mut reencoded).unwrap();
    assert_eq!(encoded, reencoded);
}

#[test]
fn netinfo() {
    // A client netinfo: zero timestamp, their address, no addresses
    // of our own.
    let their_addr = "127.0.0.2".parse().unwrap();
    let cell = ChanCell::new(0.into(), msg::Netinfo::for_client(Some(their_addr)).into());
    test_encode(
        4,
        cell,
        &hex!("00000000 08 00000000 04 04 7f000002 00"),
        true,
    );

    // A relay netinfo has a timestamp and its own address list.
    let my_addr: std::net::IpAddr = "10.0.0.7".parse().unwrap();
    let cell = ChanCell::new(
        0.into(),
        msg::Netinfo::for_relay(0x5f90_67f7, Some(their_addr), vec![my_addr]).into(),
    );
    test_encode(
        4,
        cell,
        &hex!("00000000 08 5f9067f7 04 04 7f000002 01 04 04 0a000007"),
        true,
    );
}

#[test]
fn destroy() {
    let cell = ChanCell::new(
        0x0102_0304.into(),
        msg::Destroy::new(msg::DestroyReason::RESOURCELIMIT).into(),
    );
    test_encode(4, cell, &hex!("01020304 04 05"), true);
}

#[test]
fn create2_and_created2() {
    let cell = ChanCell::new(
        0x7fff_0001.into(),
        msg::Create2::new(0x0002, &b"minimum-onionskin"[..]).into(),
    );
    test_encode(
        4,
        cell,
        &hex!("7fff0001 0a 0002 0011 6d696e696d756d2d6f6e696f6e736b696e"),
        true,
    );

    let cell = ChanCell::new(0x7fff_0001.into(), msg::Created2::new(&b"reply"[..]).into());
    test_encode(4, cell, &hex!("7fff0001 0b 0005 7265706c79"), true);
}

#[test]
fn versions_handshake_framing() {
    // VERSIONS always uses the legacy 2-byte circuit-ID framing.
    let v = msg::Versions::new([3_u16, 4]).unwrap();
    assert_eq!(v.encode_for_handshake(), hex!("0000 07 0004 0003 0004"));

    let v = msg::Versions::new([1_u16, 2, 3, 4, 5]).unwrap();
    assert_eq!(v.best_shared_link_protocol(&[3, 4]), Some(4));
    let v = msg::Versions::new([9_u16]).unwrap();
    assert_eq!(v.best_shared_link_protocol(&[3, 4]), None);
}

#[test]
fn vpadding_varcell() {
    let cell = ChanCell::new(0.into(), msg::VPadding::new(3).into());
    let mut codec = ChannelCodec::new(4);
    let mut encoded = BytesMut::new();
    codec.write_cell(cell, &mut encoded).unwrap();
    assert_eq!(&encoded[..], &hex!("00000000 80 0003 000000"));
}

#[test]
fn unrecognized_commands_survive() {
    // An unknown command decodes to Unrecognized and round-trips.
    let cell = ChanCell::new(0.into(), msg::Unrecognized::new(200.into(), &b"xyz"[..]).into());
    let mut codec = ChannelCodec::new(4);
    let mut encoded = BytesMut::new();
    codec.write_cell(cell, &mut encoded).unwrap();
    let decoded = codec.decode_cell(&mut encoded).unwrap().unwrap();
    match decoded.msg() {
        ChanMsg::Unrecognized(u) => {
            let mut body = Vec::new();
            u.clone().write_body_onto(&mut body);
            assert_eq!(&body[..], b"xyz");
        }
        other => panic!("wanted unrecognized, got {:?}", other),
    }
}

#[test]
fn relay_cells_are_opaque_here() {
    let body = [0x61_u8; 509];
    let cell = ChanCell::new(5.into(), msg::Relay::from_raw(body).into());
    let mut codec = ChannelCodec::new(4);
    let mut encoded = BytesMut::new();
    codec.write_cell(cell, &mut encoded).unwrap();
    assert_eq!(encoded.len(), 514);
    assert_eq!(encoded[4], u8::from(ChanCmd::RELAY));
    assert_eq!(&encoded[5..], &body[..]);
    let decoded = codec.decode_cell(&mut encoded).unwrap().unwrap();
    assert_eq!(decoded.circid(), CircId::from(5));
}

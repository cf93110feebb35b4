//! Link specifiers: the wire encoding used to tell a relay which
//! other relay to connect to.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

use shroud_bytes::{Error, Readable, Reader, Result, Writeable, Writer};
use shroud_llcrypto::pk::ed25519::Ed25519Identity;
use shroud_llcrypto::pk::rsa::RsaIdentity;

/// A piece of information about a relay and how to connect to it.
///
/// A set of these is sent in each EXTEND2 message, so a relay can
/// find (or recognize) its next hop.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// The TCP address of a relay's obfuscated-transport port.
    OrPort(IpAddr, u16),
    /// The RSA identity fingerprint of the relay.
    RsaId(RsaIdentity),
    /// The Ed25519 identity of the relay.
    Ed25519Id(Ed25519Identity),
    /// A link specifier that we didn't recognize.
    Unrecognized(u8, Vec<u8>),
}

/// Indicates an IPv4 ORPORT link specifier.
const LSTYPE_ORPORT_V4: u8 = 0;
/// Indicates an IPv6 ORPORT link specifier.
const LSTYPE_ORPORT_V6: u8 = 1;
/// Indicates an RSA ID fingerprint link specifier.
const LSTYPE_RSAID: u8 = 2;
/// Indicates an Ed25519 link specifier.
const LSTYPE_ED25519ID: u8 = 3;

impl Readable for LinkSpec {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        /// Return the expected length for a given link specifier type.
        fn lstype_len(tp: u8) -> Option<usize> {
            match tp {
                LSTYPE_ORPORT_V4 => Some(6),
                LSTYPE_ORPORT_V6 => Some(18),
                LSTYPE_RSAID => Some(20),
                LSTYPE_ED25519ID => Some(32),
                _ => None,
            }
        }
        let lstype = r.take_u8()?;
        let lslen = r.take_u8()? as usize;
        if let Some(wantlen) = lstype_len(lstype) {
            if wantlen != lslen {
                return Err(Error::BadMessage("Wrong length for link specifier"));
            }
        }
        Ok(match lstype {
            LSTYPE_ORPORT_V4 => {
                let addr = IpAddr::V4(r.extract()?);
                LinkSpec::OrPort(addr, r.take_u16()?)
            }
            LSTYPE_ORPORT_V6 => {
                let addr = IpAddr::V6(r.extract()?);
                LinkSpec::OrPort(addr, r.take_u16()?)
            }
            LSTYPE_RSAID => LinkSpec::RsaId(r.extract()?),
            LSTYPE_ED25519ID => LinkSpec::Ed25519Id(r.extract()?),
            _ => LinkSpec::Unrecognized(lstype, r.take(lslen)?.into()),
        })
    }
}
impl Writeable for LinkSpec {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) {
        use LinkSpec::*;
        match self {
            OrPort(IpAddr::V4(v4), port) => {
                w.write_u8(LSTYPE_ORPORT_V4);
                w.write_u8(6); // Length
                w.write(v4);
                w.write_u16(*port);
            }
            OrPort(IpAddr::V6(v6), port) => {
                w.write_u8(LSTYPE_ORPORT_V6);
                w.write_u8(18); // Length
                w.write(v6);
                w.write_u16(*port);
            }
            RsaId(r) => {
                w.write_u8(LSTYPE_RSAID);
                w.write_u8(20); // Length
                w.write(r);
            }
            Ed25519Id(e) => {
                w.write_u8(LSTYPE_ED25519ID);
                w.write_u8(32); // Length
                w.write(e);
            }
            Unrecognized(tp, vec) => {
                w.write_u8(*tp);
                assert!(vec.len() < std::u8::MAX as usize);
                w.write_u8(vec.len() as u8);
                w.write_all(&vec[..]);
            }
        }
    }
}

impl From<&SocketAddr> for LinkSpec {
    fn from(sa: &SocketAddr) -> Self {
        LinkSpec::OrPort(sa.ip(), sa.port())
    }
}
impl From<RsaIdentity> for LinkSpec {
    fn from(id: RsaIdentity) -> Self {
        LinkSpec::RsaId(id)
    }
}
impl From<Ed25519Identity> for LinkSpec {
    fn from(id: Ed25519Identity) -> Self {
        LinkSpec::Ed25519Id(id)
    }
}

impl LinkSpec {
    /// Helper: return the position in the canonical EXTEND2 ordering
    /// in which this link specifier should occur.
    fn sort_pos(&self) -> u8 {
        use LinkSpec::*;
        match self {
            OrPort(IpAddr::V4(_), _) => 0,
            RsaId(_) => 1,
            Ed25519Id(_) => 2,
            OrPort(IpAddr::V6(_), _) => 3,
            Unrecognized(n, _) => *n,
        }
    }

    /// Sort a slice of link specifiers into the canonical order.
    pub fn sort_by_type(lst: &mut [LinkSpec]) {
        lst.sort_by_key(LinkSpec::sort_pos);
    }
}

impl PartialOrd for LinkSpec {
    fn partial_cmp(&self, other: &LinkSpec) -> Option<Ordering> {
        Some(self.sort_pos().cmp(&other.sort_pos()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn roundtrip() {
        let cases: Vec<(&[u8], LinkSpec)> = vec![
            (
                &hex!("00 06 01020304 0050"),
                LinkSpec::OrPort("1.2.3.4".parse::<IpAddr>().unwrap(), 80),
            ),
            (
                &hex!("02 14 6261642d63657274696669636174652121"),
                LinkSpec::RsaId(RsaIdentity::from_bytes(b"bad-certificate!!\x21\x21\x21").unwrap()),
            ),
            (
                &hex!("aa 03 313233"),
                LinkSpec::Unrecognized(0xaa, b"123".to_vec()),
            ),
        ];
        for (b, expected) in cases {
            let mut r = Reader::from_slice(b);
            let got: LinkSpec = r.extract().unwrap();
            assert_eq!(got, expected);
            let mut v = Vec::new();
            v.write(&got);
            assert_eq!(&v[..], b);
        }
    }

    #[test]
    fn bad_lengths() {
        // An ORPort link specifier with a bad length is rejected.
        let b = hex!("00 05 0102030400");
        let mut r = Reader::from_slice(&b[..]);
        assert!(r.extract::<LinkSpec>().is_err());
    }

    #[test]
    fn ordering() {
        let mut lst = vec![
            LinkSpec::Ed25519Id([9; 32].into()),
            LinkSpec::OrPort("1.2.3.4".parse::<IpAddr>().unwrap(), 443),
            LinkSpec::RsaId(RsaIdentity::from_bytes(&[17; 20]).unwrap()),
        ];
        LinkSpec::sort_by_type(&mut lst);
        assert!(matches!(lst[0], LinkSpec::OrPort(_, _)));
        assert!(matches!(lst[1], LinkSpec::RsaId(_)));
        assert!(matches!(lst[2], LinkSpec::Ed25519Id(_)));
    }
}

//! Odds and ends needed for cryptographic purposes.
//!
//! For now: a workaround for other libraries' lack of full X.509
//! support, and a compatibility shim between incompatible versions of
//! the `rand_core` traits.

pub mod rand_compat;

use simple_asn1::{oid, ASN1Block, BigUint, OID};

/// Given an X.509 certificate, return its SubjectPublicKey if that
/// key is an RSA key.
///
/// WARNING: this does not validate the X.509 certificate at all!  We
/// use it only to pull the legacy RSA identity key out of the
/// self-signed certificate in a CERTS message; nothing about that
/// certificate is trusted.
pub fn x509_extract_rsa_subject_kludge(der: &[u8]) -> Option<crate::pk::rsa::PublicKey> {
    let blocks = simple_asn1::from_der(der).ok()?;
    let block = Asn1(blocks.get(0)?);
    // TBSCertificate
    let tbs_cert: Asn1 = block.into_seq()?.get(0)?.into();
    // SubjectPublicKeyInfo
    let spki: Asn1 = tbs_cert.into_seq()?.get(6)?.into();
    let spki_members = spki.into_seq()?;
    // Is it an RSA key?
    let algid: Asn1 = spki_members.get(0)?.into();
    let oid: Asn1 = algid.into_seq()?.get(0)?.into();
    oid.must_be_rsa_oid()?;

    // Try to get the RSA key.
    let key: Asn1 = spki_members.get(1)?.into();
    crate::pk::rsa::PublicKey::from_der(key.to_bitstr()?)
}

/// Helper to navigate parsed ASN.1 without panicking.
struct Asn1<'a>(&'a ASN1Block);
impl<'a> From<&'a ASN1Block> for Asn1<'a> {
    fn from(b: &'a ASN1Block) -> Asn1<'a> {
        Asn1(b)
    }
}
impl<'a> Asn1<'a> {
    /// View this block as a sequence, if it is one.
    fn into_seq(self) -> Option<&'a [ASN1Block]> {
        match self.0 {
            ASN1Block::Sequence(_, ref s) => Some(s),
            _ => None,
        }
    }
    /// Return Some(()) iff this block is the OID for rsaEncryption.
    fn must_be_rsa_oid(self) -> Option<()> {
        let oid = match self.0 {
            ASN1Block::ObjectIdentifier(_, ref oid) => Some(oid),
            _ => None,
        }?;
        if oid == oid!(1, 2, 840, 113549, 1, 1, 1) {
            Some(())
        } else {
            None
        }
    }
    /// View this block's contents as a bit string, if it is one.
    fn to_bitstr(&self) -> Option<&[u8]> {
        match self.0 {
            ASN1Block::BitString(_, _, ref v) => Some(&v[..]),
            _ => None,
        }
    }
}

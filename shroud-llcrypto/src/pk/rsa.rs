//! RSA public keys and the legacy identity digests derived from them.
//!
//! The overlay protocol identifies relays by the SHA1 digest of their
//! DER-encoded legacy RSA key; that digest shows up in handshakes and
//! link specifiers.  This module wraps the `rsa` crate so we can
//! validate PKCSv1 signatures and encode/decode keys from DER.

use arrayref::array_ref;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// How many bytes are in an "RSA ID"?  (A legacy concept: a relay is
/// identified by the SHA1 digest of its public RSA key.)
pub const RSA_ID_LEN: usize = 20;

/// An identifier for a relay, based on its legacy RSA identity key.
#[derive(Clone, Copy, Zeroize)]
pub struct RsaIdentity {
    /// SHA1 digest of a DER-encoded public RSA key.
    id: [u8; RSA_ID_LEN],
}

impl PartialEq<RsaIdentity> for RsaIdentity {
    fn eq(&self, rhs: &RsaIdentity) -> bool {
        self.id.ct_eq(&rhs.id).unwrap_u8() == 1
    }
}

impl Eq for RsaIdentity {}

impl std::hash::Hash for RsaIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", hex::encode(&self.id[..]))
    }
}
impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RsaIdentity {{ ${} }}", hex::encode(&self.id[..]))
    }
}

impl RsaIdentity {
    /// Expose an RsaIdentity as a slice of bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.id[..]
    }
    /// Construct an RsaIdentity from a slice of bytes.
    ///
    /// Returns None if the input is not of the correct length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == RSA_ID_LEN {
            Some(RsaIdentity {
                id: *array_ref![bytes, 0, RSA_ID_LEN],
            })
        } else {
            None
        }
    }
}

impl From<[u8; 20]> for RsaIdentity {
    fn from(id: [u8; 20]) -> RsaIdentity {
        RsaIdentity { id }
    }
}

/// An RSA public key.
///
/// A simple wrapper so that we can define extra methods and traits on
/// the type.
#[derive(Clone)]
pub struct PublicKey(rsa::RSAPublicKey);

impl PublicKey {
    /// Return true iff the exponent for this key is the same number as `e`.
    pub fn exponent_is(&self, e: u32) -> bool {
        use rsa::PublicKeyParts;
        *self.0.e() == rsa::BigUint::new(vec![e])
    }
    /// Return the number of bits in the modulus for this key.
    pub fn bits(&self) -> usize {
        use rsa::PublicKeyParts;
        self.0.n().bits()
    }
    /// Try to check a signature made with this key.
    ///
    /// The protocol uses RSA-PKCSv1 signatures, with hash algorithm
    /// OIDs omitted.  `hashed` is the digest of the signed document.
    pub fn verify(&self, hashed: &[u8], sig: &[u8]) -> std::result::Result<(), signature::Error> {
        use rsa::PublicKey as _;
        let padding = rsa::PaddingScheme::new_pkcs1v15_sign(None);
        self.0
            .verify(padding, hashed, sig)
            .map_err(signature::Error::from_source)
    }
    /// Decode an alleged DER byte string into a PublicKey.
    ///
    /// Returns None if the DER string does not contain a single valid
    /// RSAPublicKey object.  (A PublicKeyInfo wrapper is not accepted.)
    pub fn from_der(der: &[u8]) -> Option<Self> {
        // We don't use the rsa-der crate here, since it expects the key
        // inside of a bitstring inside of another asn1 object, and it
        // doesn't check for negative values.
        let blocks = simple_asn1::from_der(der).ok()?;
        if blocks.len() != 1 {
            return None;
        }
        let block = &blocks[0];
        use simple_asn1::ASN1Block::*;
        let (n, e) = match block {
            Sequence(_, v) => match &v[..] {
                [Integer(_, n), Integer(_, e)] => (n, e),
                _ => return None,
            },
            _ => return None,
        };
        use num_traits::sign::Signed;
        if n.is_negative() || e.is_negative() {
            return None;
        }
        let (_, nbytes) = n.to_bytes_be();
        let (_, ebytes) = e.to_bytes_be();
        let pk = PublicKey(
            rsa::RSAPublicKey::new(
                rsa::BigUint::from_bytes_be(&nbytes),
                rsa::BigUint::from_bytes_be(&ebytes),
            )
            .ok()?,
        );

        Some(pk)
    }
    /// Encode this public key into the DER format used on the wire.
    ///
    /// The result is an RSAPublicKey, not a PublicKeyInfo.
    pub fn to_der(&self) -> Vec<u8> {
        use rsa::BigUint; // not the same as the one in simple_asn1.
        use rsa::PublicKeyParts;
        use simple_asn1::{ASN1Block, BigInt};

        /// Helper: convert a BigUint to a signed asn1 integer block.
        fn to_asn1_int(x: &BigUint) -> ASN1Block {
            // prepend a zero so the value is never negative.
            let mut bytes = vec![0];
            bytes.extend(x.to_bytes_be());
            let bigint = BigInt::from_signed_bytes_be(&bytes);
            ASN1Block::Integer(0, bigint)
        }

        let asn1 = ASN1Block::Sequence(0, vec![to_asn1_int(self.0.n()), to_asn1_int(self.0.e())]);
        simple_asn1::to_der(&asn1).expect("RSA key not encodable as DER")
    }

    /// Compute the RsaIdentity for this public key.
    pub fn to_rsa_identity(&self) -> RsaIdentity {
        use crate::d::Sha1;
        use digest::Digest;
        let id = Sha1::digest(&self.to_der()).into();
        RsaIdentity { id }
    }
}

/// An RSA signature plus the key and document digest needed to
/// validate it.
pub struct ValidatableRsaSignature {
    /// The key that allegedly signed.
    key: PublicKey,
    /// The signature bytes.
    sig: Vec<u8>,
    /// The digest of the signed document.
    expected_hash: Vec<u8>,
}

impl ValidatableRsaSignature {
    /// Construct a new ValidatableRsaSignature.
    pub fn new(key: &PublicKey, sig: &[u8], expected_hash: &[u8]) -> Self {
        ValidatableRsaSignature {
            key: key.clone(),
            sig: sig.into(),
            expected_hash: expected_hash.into(),
        }
    }
}

impl super::ValidatableSignature for ValidatableRsaSignature {
    fn is_valid(&self) -> bool {
        self.key
            .verify(&self.expected_hash[..], &self.sig[..])
            .is_ok()
    }
}

//! Implementation of the binary certificate types used when
//! authenticating channels on the shroud overlay.
//!
//! # Overview
//!
//! During the link handshake, each relay presents a chain of small
//! binary certificates (inside a CERTS message) binding its TLS key
//! to its Ed25519 identity, and its Ed25519 identity to its legacy
//! RSA identity.  This crate parses and validates those certificate
//! formats.
//!
//! Validation is deliberately staged: parsing yields a
//! [`KeyUnknownCert`], which must be given a signing key
//! ([`KeyUnknownCert::check_key`]), then signature-checked, then
//! checked for timeliness.  The staging makes it hard to use a
//! certificate while skipping one of the checks, and lets the caller
//! batch the (expensive) signature checks.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]

pub mod rsa;

use caret::caret_int;
use shroud_bytes::{Readable, Reader};
use shroud_llcrypto::pk::ed25519;
use signature::Verifier;

use std::time;
use thiserror::Error;

/// An error produced when decoding or checking a certificate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CertError {
    /// The byte-level encoding of the certificate was invalid.
    #[error("parsing error: {0}")]
    Bytes(#[from] shroud_bytes::Error),
    /// The certificate did not include a signing key, and none was
    /// supplied.
    #[error("missing public key on certificate")]
    MissingPubKey,
    /// The signing key in the certificate did not match the one we
    /// expected.
    #[error("mismatched public key on certificate")]
    KeyMismatch,
    /// The signature on the certificate was invalid.
    #[error("invalid certificate signature")]
    BadSignature,
    /// The certificate is expired (or not yet valid) at the time of
    /// the check.
    #[error("certificate expired or not yet valid")]
    Untimely,
}

/// Result type for this crate.
pub type CertResult<T> = std::result::Result<T, CertError>;

caret_int! {
    /// Recognized values for the certificate type field.
    ///
    /// In the names used here, "X_V_Y" means "key X verifying key Y",
    /// whereas "X_CC_Y" means "key X cross-certifying key Y".  In
    /// both cases X is the key doing the signing and Y is the key or
    /// object getting signed.
    ///
    /// Not every type here is an Ed25519 certificate: some are X.509
    /// certificates or RSA->Ed crosscerts that appear alongside them
    /// in a CERTS message.
    pub struct CertType(u8) {
        /// TLS link key, signed with RSA identity. X.509 format. (Obsolete)
        TLS_LINK_X509 = 0x01,
        /// Self-signed RSA identity certificate. X.509 format. (Legacy)
        RSA_ID_X509 = 0x02,
        /// RSA link authentication key signed with the RSA identity
        /// key. X.509 format. (Obsolete)
        LINK_AUTH_X509 = 0x03,
        /// Identity verifying a signing key, directly.
        IDENTITY_V_SIGNING = 0x04,
        /// Signing key verifying a TLS certificate by digest.
        SIGNING_V_TLS_CERT = 0x05,
        /// Signing key verifying a link authentication key.
        SIGNING_V_LINK_AUTH = 0x06,
        /// RSA identity key certifying an Ed25519 identity key.
        /// RSA crosscert format. (Legacy)
        RSA_ID_V_IDENTITY = 0x07,
    }
}

caret_int! {
    /// Extension identifiers for extensions in certificates.
    pub struct ExtType(u8) {
        /// Extension indicating the Ed25519 key that signed this
        /// certificate.
        ///
        /// Certificates do not always contain the key that signed them.
        SIGNED_WITH_ED25519_KEY = 0x04,
    }
}

caret_int! {
    /// Identifiers for the type of key or object getting signed.
    pub struct KeyType(u8) {
        /// Identifier for an Ed25519 key.
        ED25519_KEY = 0x01,
        /// Identifier for the SHA256 of a DER-encoded RSA key.
        SHA256_OF_RSA = 0x02,
        /// Identifies the SHA256 of an X.509 certificate.
        SHA256_OF_X509 = 0x03,
    }
}

/// Structure for an Ed25519-signed certificate.
pub struct Ed25519Cert {
    /// How many _hours_ after the epoch will this certificate expire?
    exp_hours: u32,
    /// Type of the certificate.
    cert_type: CertType,
    /// The key or object being certified.
    cert_key: CertifiedKey,
    /// A list of extensions.
    #[allow(unused)]
    extensions: Vec<CertExt>,
    /// The key that signed this certificate.
    ///
    /// Once the certificate has been unwrapped from a
    /// [`KeyUnknownCert`], this field is always set.
    signed_with: Option<ed25519::PublicKey>,
}

/// One of the data types that can be certified by an Ed25519Cert.
#[non_exhaustive]
pub enum CertifiedKey {
    /// An Ed25519 public key, signed directly.
    Ed25519(ed25519::PublicKey),
    /// The SHA256 digest of a DER-encoded RSA public key.
    RsaSha256Digest([u8; 32]),
    /// The SHA256 digest of an X.509 certificate.
    X509Sha256Digest([u8; 32]),
    /// Some unrecognized key type.
    Unrecognized(UnrecognizedKey),
}

/// A key whose type we didn't recognize.
pub struct UnrecognizedKey {
    /// Actual type of the key.
    key_type: KeyType,
    /// Digest of the key, or the key itself.
    key_digest: [u8; 32],
}

impl CertifiedKey {
    /// Return the byte that identifies the type of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            CertifiedKey::Ed25519(_) => KeyType::ED25519_KEY,
            CertifiedKey::RsaSha256Digest(_) => KeyType::SHA256_OF_RSA,
            CertifiedKey::X509Sha256Digest(_) => KeyType::SHA256_OF_X509,
            CertifiedKey::Unrecognized(u) => u.key_type,
        }
    }
    /// Return the bytes that make up the body of this certified key
    /// or object.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CertifiedKey::Ed25519(k) => k.as_bytes(),
            CertifiedKey::RsaSha256Digest(k) => &k[..],
            CertifiedKey::X509Sha256Digest(k) => &k[..],
            CertifiedKey::Unrecognized(u) => &u.key_digest[..],
        }
    }
    /// If this is an Ed25519 public key, return Some(key); else None.
    pub fn as_ed25519(&self) -> Option<&ed25519::PublicKey> {
        match self {
            CertifiedKey::Ed25519(k) => Some(k),
            _ => None,
        }
    }
    /// Try to extract a CertifiedKey from a Reader, given that we
    /// have already read its type as `key_type`.
    fn from_reader(key_type: KeyType, r: &mut Reader<'_>) -> CertResult<Self> {
        Ok(match key_type {
            KeyType::ED25519_KEY => CertifiedKey::Ed25519(r.extract()?),
            KeyType::SHA256_OF_RSA => CertifiedKey::RsaSha256Digest(r.extract()?),
            KeyType::SHA256_OF_X509 => CertifiedKey::X509Sha256Digest(r.extract()?),
            _ => CertifiedKey::Unrecognized(UnrecognizedKey {
                key_type,
                key_digest: r.extract()?,
            }),
        })
    }
}

/// An extension in a certificate.
enum CertExt {
    /// Indicates which Ed25519 public key signed this certificate.
    SignedWithEd25519(SignedWithEd25519Ext),
    /// An extension whose identity we don't recognize.
    Unrecognized(UnrecognizedExt),
}

/// Any unrecognized extension on a certificate.
#[allow(unused)]
struct UnrecognizedExt {
    /// True iff this extension must be understood in order to
    /// validate the certificate.
    affects_validation: bool,
    /// The type of the extension.
    ext_type: ExtType,
    /// The body of the extension.
    body: Vec<u8>,
}

/// Extension recording the key that signed a given certificate.
struct SignedWithEd25519Ext {
    /// The key that signed the certificate including this extension.
    pk: ed25519::PublicKey,
}

impl CertExt {
    /// Return the identifier code for this extension.
    fn ext_id(&self) -> ExtType {
        match self {
            CertExt::SignedWithEd25519(_) => ExtType::SIGNED_WITH_ED25519_KEY,
            CertExt::Unrecognized(u) => u.ext_type,
        }
    }
}

impl Readable for CertExt {
    fn take_from(b: &mut Reader<'_>) -> shroud_bytes::Result<Self> {
        use shroud_bytes::Error;
        let len = b.take_u16()?;
        let ext_type: ExtType = b.take_u8()?.into();
        let flags = b.take_u8()?;
        let body = b.take(len as usize)?;

        Ok(match ext_type {
            ExtType::SIGNED_WITH_ED25519_KEY => {
                if body.len() != 32 {
                    return Err(Error::BadMessage("wrong length on Ed25519 key"));
                }
                CertExt::SignedWithEd25519(SignedWithEd25519Ext {
                    pk: ed25519::PublicKey::from_bytes(body)
                        .map_err(|_| Error::BadMessage("invalid Ed25519 public key"))?,
                })
            }
            _ => {
                if (flags & 1) != 0 {
                    return Err(Error::BadMessage(
                        "unrecognized certificate extension, with 'affects_validation' flag set.",
                    ));
                }
                CertExt::Unrecognized(UnrecognizedExt {
                    affects_validation: false,
                    ext_type,
                    body: body.into(),
                })
            }
        })
    }
}

impl Ed25519Cert {
    /// Try to decode a certificate from a byte slice.
    ///
    /// This function returns an error unless the byte slice is
    /// completely exhausted.
    ///
    /// Note that the resulting [`KeyUnknownCert`] is not checked for
    /// validity at all: you will need to provide it with an expected
    /// signing key, then check it for timeliness and
    /// well-signedness.
    pub fn decode(cert: &[u8]) -> CertResult<KeyUnknownCert> {
        use shroud_bytes::Error;
        let mut r = Reader::from_slice(cert);
        let v = r.take_u8()?;
        if v != 1 {
            // Some version of the certificate format we don't know.
            return Err(Error::BadMessage("Unrecognized certificate version").into());
        }
        let cert_type = r.take_u8()?.into();
        let exp_hours = r.take_u32()?;
        let mut cert_key_type: KeyType = r.take_u8()?.into();

        // Workaround for a bug in a widely-deployed implementation:
        // the key type field in SIGNING_V_TLS_CERT certificates is
        // ED25519_KEY when it should be SHA256_OF_X509.
        if cert_type == CertType::SIGNING_V_TLS_CERT && cert_key_type == KeyType::ED25519_KEY {
            cert_key_type = KeyType::SHA256_OF_X509;
        }

        let cert_key = CertifiedKey::from_reader(cert_key_type, &mut r)?;
        let n_exts = r.take_u8()?;
        let mut extensions = Vec::new();
        for _ in 0..n_exts {
            let e: CertExt = r.extract()?;
            extensions.push(e);
        }

        let sig_offset = r.consumed();
        let signature: ed25519::Signature = r.extract()?;
        r.should_be_exhausted()?;

        let keyext = extensions
            .iter()
            .find(|e| e.ext_id() == ExtType::SIGNED_WITH_ED25519_KEY);

        let included_pkey = match keyext {
            Some(CertExt::SignedWithEd25519(s)) => Some(s.pk),
            _ => None,
        };

        Ok(KeyUnknownCert {
            cert: UncheckedCert {
                cert: Ed25519Cert {
                    exp_hours,
                    cert_type,
                    cert_key,
                    extensions,
                    signed_with: included_pkey,
                },
                text: cert[0..sig_offset].into(),
                signature,
            },
        })
    }

    /// Return the time at which this certificate becomes expired.
    pub fn expiry(&self) -> time::SystemTime {
        let d = time::Duration::new(u64::from(self.exp_hours) * 3600, 0);
        time::SystemTime::UNIX_EPOCH + d
    }

    /// Return true iff this certificate will be expired at the time `when`.
    pub fn is_expired_at(&self, when: time::SystemTime) -> bool {
        when >= self.expiry()
    }

    /// Return the signed key or object that is authenticated by this
    /// certificate.
    pub fn subject_key(&self) -> &CertifiedKey {
        &self.cert_key
    }

    /// Return the ed25519 key that signed this certificate.
    pub fn signing_key(&self) -> Option<&ed25519::PublicKey> {
        self.signed_with.as_ref()
    }

    /// Return the type of this certificate.
    pub fn cert_type(&self) -> CertType {
        self.cert_type
    }
}

/// A parsed Ed25519 certificate.  Maybe it includes its signing key;
/// maybe it doesn't.
pub struct KeyUnknownCert {
    /// The certificate whose signing key might not be known.
    cert: UncheckedCert,
}

impl KeyUnknownCert {
    /// Return the certificate type of the underlying certificate.
    pub fn peek_cert_type(&self) -> CertType {
        self.cert.cert.cert_type
    }
    /// Return the subject key of the underlying certificate.
    pub fn peek_subject_key(&self) -> &CertifiedKey {
        &self.cert.cert.cert_key
    }

    /// Check whether a given pkey is (or might be) the key that has
    /// signed this certificate.
    ///
    /// On success we can proceed to checking the signature itself;
    /// until then, nothing about the certificate is usable.
    pub fn check_key(self, pkey: &Option<ed25519::PublicKey>) -> CertResult<UncheckedCert> {
        let real_key = match (pkey, self.cert.cert.signed_with) {
            (Some(a), Some(b)) if a == &b => b,
            (Some(_), Some(_)) => return Err(CertError::KeyMismatch),
            (Some(a), None) => *a,
            (None, Some(b)) => b,
            (None, None) => return Err(CertError::MissingPubKey),
        };
        Ok(UncheckedCert {
            cert: Ed25519Cert {
                signed_with: Some(real_key),
                ..self.cert.cert
            },
            ..self.cert
        })
    }
}

/// A certificate that has been parsed, but whose signature and
/// timeliness have not been checked.
pub struct UncheckedCert {
    /// The parsed certificate, possibly modified by inserting an
    /// externally supplied key as its signing key.
    cert: Ed25519Cert,
    /// The signed text of the certificate.  (Checking ed25519
    /// signatures forces us to keep this around.)
    text: Vec<u8>,
    /// The alleged signature.
    signature: ed25519::Signature,
}

impl UncheckedCert {
    /// Check the signature on this certificate, returning a
    /// signature-checked certificate on success.
    pub fn check_signature(self) -> CertResult<SigCheckedCert> {
        let pubkey = self.cert.signed_with.ok_or(CertError::MissingPubKey)?;
        pubkey
            .verify(&self.text[..], &self.signature)
            .map_err(|_| CertError::BadSignature)?;
        Ok(SigCheckedCert { cert: self.cert })
    }

    /// Split this unchecked certificate into a component that assumes
    /// it has been checked, and a signature to validate separately.
    ///
    /// Used to batch-verify the signatures on several certificates at
    /// once; the caller takes responsibility for actually validating
    /// the returned signature.
    pub fn dangerously_split(
        self,
    ) -> CertResult<(SigCheckedCert, ed25519::ValidatableEd25519Signature)> {
        let signing_key = self.cert.signed_with.ok_or(CertError::MissingPubKey)?;
        let signature =
            ed25519::ValidatableEd25519Signature::new(signing_key, self.signature, &self.text[..]);
        Ok((SigCheckedCert { cert: self.cert }, signature))
    }

    /// Return the subject key of the underlying certificate.
    pub fn peek_subject_key(&self) -> &CertifiedKey {
        &self.cert.cert_key
    }
    /// Return the signing key of the underlying certificate.
    pub fn peek_signing_key(&self) -> &ed25519::PublicKey {
        self.cert
            .signed_with
            .as_ref()
            .expect("made an UncheckedCert without a signing key")
    }
}

/// A certificate that has been parsed and signature-checked, but
/// whose timeliness has not been checked.
pub struct SigCheckedCert {
    /// The certificate that might or might not be timely.
    cert: Ed25519Cert,
}

impl SigCheckedCert {
    /// Check that this certificate is timely at the time `when`.
    ///
    /// A `None` value means "use the current system time".
    pub fn check_valid_at_opt(self, when: Option<time::SystemTime>) -> CertResult<Ed25519Cert> {
        let when = when.unwrap_or_else(time::SystemTime::now);
        if self.cert.is_expired_at(when) {
            return Err(CertError::Untimely);
        }
        Ok(self.cert)
    }

    /// Return the certificate without checking timeliness.
    ///
    /// Only for callers that have some other way to know the
    /// certificate is still live.
    pub fn dangerously_assume_timely(self) -> Ed25519Cert {
        self.cert
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn parse_unrecognized_ext() {
        // case one: a flag is set but we don't know it
        let b = hex!("0009 99 10 657874656e73696f6e");
        let mut r = Reader::from_slice(&b);
        let e: CertExt = r.extract().unwrap();
        r.should_be_exhausted().unwrap();

        assert_eq!(e.ext_id(), 0x99.into());

        // case two: we've been told to ignore the certificate if we
        // can't handle the extension.
        let b = hex!("0009 99 11 657874656e73696f6e");
        let mut r = Reader::from_slice(&b);
        let e: shroud_bytes::Result<CertExt> = r.extract();
        assert!(e.is_err());
        assert_eq!(
            e.err().unwrap(),
            shroud_bytes::Error::BadMessage(
                "unrecognized certificate extension, with 'affects_validation' flag set."
            )
        );
    }

    #[test]
    fn certified_key() {
        let b =
            hex!("4c27616d6f757220756e6974206365757820717527656e636861c3ae6e616974206c6520666572");
        let mut r = Reader::from_slice(&b);

        let ck = CertifiedKey::from_reader(KeyType::SHA256_OF_RSA, &mut r).unwrap();
        assert_eq!(ck.as_bytes(), &b[..32]);
        assert_eq!(ck.key_type(), KeyType::SHA256_OF_RSA);
        assert_eq!(r.remaining(), 7);

        let mut r = Reader::from_slice(&b);
        let ck = CertifiedKey::from_reader(42.into(), &mut r).unwrap();
        assert_eq!(ck.as_bytes(), &b[..32]);
        assert_eq!(ck.key_type(), 42.into());
        assert_eq!(r.remaining(), 7);
    }
}

//! RSA->Ed25519 cross-certificates.
//!
//! These appear in the link handshake to prove that a given ed25519
//! identity key speaks for a given (legacy) RSA identity.

use crate::{CertError, CertResult};
use shroud_bytes::Reader;
use shroud_llcrypto as ll;

use digest::Digest;

/// A RSA->Ed25519 cross-certificate.
///
/// This certifies that the Ed25519 identity key speaks on behalf of
/// the RSA identity key.  (There is no converse type: the RSA
/// identity keys are too weak to be worth certifying with the
/// Ed25519 key.)
#[must_use]
pub struct RsaCrosscert {
    /// The key that is being certified.
    subject_key: ll::pk::ed25519::PublicKey,
    /// The expiration time of this certificate, in hours since the
    /// unix epoch.
    exp_hours: u32,
    /// The digest of the signed part of the certificate (for checking).
    digest: [u8; 32],
    /// The (alleged) signature on the certificate.
    signature: Vec<u8>,
}

impl RsaCrosscert {
    /// Return the time at which this certificate becomes expired.
    pub fn expiry(&self) -> std::time::SystemTime {
        let d = std::time::Duration::new(u64::from(self.exp_hours) * 3600, 0);
        std::time::SystemTime::UNIX_EPOCH + d
    }

    /// Return true if the subject key in this certificate matches
    /// `other`.
    pub fn subject_key_matches(&self, other: &ll::pk::ed25519::PublicKey) -> bool {
        &self.subject_key == other
    }

    /// Decode a slice of bytes into an RSA crosscert.
    pub fn decode(bytes: &[u8]) -> CertResult<UncheckedRsaCrosscert> {
        let mut r = Reader::from_slice(bytes);
        let signed_portion = r.peek(36)?;
        let subject_key = r.extract()?;
        let exp_hours = r.take_u32()?;
        let siglen = r.take_u8()?;
        let signature = r.take(siglen as usize)?.into();

        let mut d = ll::d::Sha256::new();
        d.update(&b"Tor TLS RSA/Ed25519 cross-certificate"[..]);
        d.update(signed_portion);
        let digest = d.finalize().into();

        let cc = RsaCrosscert {
            subject_key,
            exp_hours,
            digest,
            signature,
        };

        Ok(UncheckedRsaCrosscert(cc))
    }
}

/// An RsaCrosscert whose signature has not been checked.
pub struct UncheckedRsaCrosscert(RsaCrosscert);

impl UncheckedRsaCrosscert {
    /// Check the signature on this certificate with the provided RSA
    /// key, yielding a certificate whose timeliness still needs to be
    /// checked.
    pub fn check_signature(self, k: &ll::pk::rsa::PublicKey) -> CertResult<TimecheckRsaCrosscert> {
        k.verify(&self.0.digest[..], &self.0.signature[..])
            .map_err(|_| CertError::BadSignature)?;
        Ok(TimecheckRsaCrosscert(self.0))
    }
}

/// An RsaCrosscert whose signature has been checked, but whose
/// timeliness has not.
pub struct TimecheckRsaCrosscert(RsaCrosscert);

impl TimecheckRsaCrosscert {
    /// Check that this certificate is timely at `when` (or at the
    /// current time, for `None`).
    pub fn check_valid_at_opt(
        self,
        when: Option<std::time::SystemTime>,
    ) -> CertResult<RsaCrosscert> {
        let when = when.unwrap_or_else(std::time::SystemTime::now);
        if when >= self.0.expiry() {
            return Err(CertError::Untimely);
        }
        Ok(self.0)
    }
}

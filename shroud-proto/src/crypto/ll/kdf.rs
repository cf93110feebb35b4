//! Key derivation functions.
//!
//! The overlay protocol uses different key derivation functions for
//! different purposes: an iterated-digest KDF for the oldest
//! handshakes, HKDF-SHA256 for the current circuit-extension
//! handshake, and SHAKE-256 where an extensible output is wanted.

use crate::{Error, Result, SecretBytes};
use digest::Digest;
use shroud_llcrypto::d::{Sha1, Sha256, Shake256};

use zeroize::Zeroizing;

/// A trait for a key derivation function.
pub(crate) trait Kdf {
    /// Derive `n_bytes` of key data from some secret `seed`.
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes>;
}

/// A legacy KDF, based on iterated uses of SHA1.
///
/// The byte stream is `H(seed | [i]) | H(seed | [i+1]) | ...`, where
/// `i` is the initial index chosen at construction.  (Different
/// protocol pieces use different starting indices to keep their
/// outputs disjoint.)
pub(crate) struct LegacyKdf {
    /// The starting value for the counter byte.
    idx: u8,
}

/// A parameterized KDF, based on HKDF, as used with the ntor
/// handshake.
pub(crate) struct Ntor1Kdf<'a, 'b> {
    /// A constant for parameterizing the KDF, during the key
    /// extraction phase.
    t_key: &'a [u8],
    /// Another constant for parameterizing the KDF, during the key
    /// expansion phase.
    m_expand: &'b [u8],
}

/// A modern KDF, based on SHAKE-256.
pub(crate) struct ShakeKdf();

impl LegacyKdf {
    /// Instantiate a LegacyKdf with a given starting counter.
    pub(crate) fn new(idx: u8) -> Self {
        LegacyKdf { idx }
    }
}
impl Kdf for LegacyKdf {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes> {
        let mut result = Zeroizing::new(Vec::with_capacity(n_bytes + Sha1::output_size()));
        let mut k = self.idx;
        if n_bytes > Sha1::output_size() * 256 {
            return Err(Error::InvalidOutputLength);
        }

        while result.len() < n_bytes {
            let mut d = Sha1::new();
            d.update(seed);
            d.update(&[k]);
            result.extend(d.finalize());
            k = k.wrapping_add(1);
        }

        result.truncate(n_bytes);
        Ok(result)
    }
}

impl<'a, 'b> Ntor1Kdf<'a, 'b> {
    /// Instantiate an Ntor1Kdf, with given values for `t_key` and
    /// `m_expand`.
    pub(crate) fn new(t_key: &'a [u8], m_expand: &'b [u8]) -> Self {
        Ntor1Kdf { t_key, m_expand }
    }
}

impl Kdf for Ntor1Kdf<'_, '_> {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes> {
        let hkdf = hkdf::Hkdf::<Sha256>::new(Some(self.t_key), seed);

        let mut result = Zeroizing::new(vec![0; n_bytes]);
        hkdf.expand(self.m_expand, &mut result[..])
            .map_err(|_| Error::InvalidOutputLength)?;
        Ok(result)
    }
}

impl ShakeKdf {
    /// Instantiate a ShakeKdf.
    pub(crate) fn new() -> Self {
        ShakeKdf()
    }
}
impl Kdf for ShakeKdf {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes> {
        use digest::{ExtendableOutput, Update, XofReader};
        let mut xof = Shake256::default();
        xof.update(seed);
        let mut result = Zeroizing::new(vec![0; n_bytes]);
        xof.finalize_xof().read(&mut result[..]);
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn legacy_kdf_prefix_property() {
        // Deriving a longer key begins with the shorter key.
        let seed = b"a seed of some sort";
        let k20 = LegacyKdf::new(0).derive(seed, 20).unwrap();
        let k50 = LegacyKdf::new(0).derive(seed, 50).unwrap();
        assert_eq!(&k50[..20], &k20[..]);

        // Different starting indices give different streams.
        let other = LegacyKdf::new(1).derive(seed, 20).unwrap();
        assert_ne!(&other[..], &k20[..]);
    }

    #[test]
    fn ntor1_kdf_vector() {
        // HKDF-SHA256 test vector from RFC 5869, section A.1.
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex!("000102030405060708090a0b0c");
        let info = hex!("f0f1f2f3f4f5f6f7f8f9");
        let okm = Ntor1Kdf::new(&salt[..], &info[..])
            .derive(&ikm[..], 42)
            .unwrap();
        let expected = hex!(
            "3cb25f25faacd57a90434f64d0362f2a
             2d2d0a90cf1a5a4c5db02d56ecc4c5bf
             34007208d5b887185865"
        );
        assert_eq!(&okm[..], &expected[..]);
    }

    #[test]
    fn shake_kdf_is_deterministic() {
        let k1 = ShakeKdf::new().derive(b"zymurgy", 100).unwrap();
        let k2 = ShakeKdf::new().derive(b"zymurgy", 100).unwrap();
        let k3 = ShakeKdf::new().derive(b"zymurg", 100).unwrap();
        assert_eq!(&k1[..], &k2[..]);
        assert_ne!(&k1[..], &k3[..]);
    }
}

//! Helpers for testing the cryptographic code.

use rand_core::{impls, CryptoRng, Error, RngCore};

/// A pseudo-RNG that yields bytes from a caller-provided buffer, then
/// zeros.
///
/// Used to drive handshakes with known "ephemeral" keys in test
/// vectors.  Obviously, never touch this outside of tests.
pub(crate) struct FakePrng<'a> {
    /// The bytes we have yet to yield.
    bytes: &'a [u8],
}

impl<'a> FakePrng<'a> {
    /// Create a new FakePrng that yields the given bytes.
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        FakePrng { bytes }
    }
}

impl<'a> RngCore for FakePrng<'a> {
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }
    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let n = std::cmp::min(dest.len(), self.bytes.len());
        dest[..n].copy_from_slice(&self.bytes[..n]);
        for b in dest[n..].iter_mut() {
            *b = 0;
        }
        self.bytes = &self.bytes[n..];
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl<'a> CryptoRng for FakePrng<'a> {}

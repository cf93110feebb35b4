//! Implementation of the cursor type used to parse protocol objects.

use crate::{Error, Readable, Result};

/// A byte-oriented cursor over a slice, used for parsing protocol
/// objects.
///
/// A Reader never copies the underlying data; every accessor either
/// returns a subslice or decodes a fixed-width integer.  All accessors
/// fail with [Error::Truncated] rather than panicking when there is
/// not enough data left.
pub struct Reader<'a> {
    /// The underlying data.
    b: &'a [u8],
    /// The next position in `b` that we intend to read from.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader over a given slice.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }

    /// Construct a new Reader over anything that can be viewed as
    /// bytes.  (Helper for working with `bytes::Bytes`.)
    pub fn from_bytes<T: AsRef<[u8]> + ?Sized>(b: &'a T) -> Self {
        Self::from_slice(b.as_ref())
    }

    /// Return the total length of the underlying slice, consumed or not.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }

    /// Return the number of unconsumed bytes in this reader.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }

    /// Consume this reader, and return a slice of its remaining bytes.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }

    /// Return the number of bytes that have been consumed so far.
    pub fn consumed(&self) -> usize {
        self.off
    }

    /// Drop the last `n` bytes of the unconsumed portion of this
    /// reader, so that no accessor can see them.
    ///
    /// Used to limit parsing to a length-prefixed region.
    pub fn truncate(&mut self, n: usize) {
        if n < self.remaining() {
            self.b = &self.b[..self.off + n];
        }
    }

    /// Check whether this reader is exhausted (out of bytes).
    ///
    /// Gives `Error::ExtraneousBytes` if there are bytes remaining.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }

    /// Advance this reader by `n` bytes without returning them.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Truncated);
        }
        self.off += n;
        Ok(())
    }

    /// Return the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Truncated);
        }
        Ok(&self.b[self.off..self.off + n])
    }

    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let result = self.peek(n)?;
        self.advance(n)?;
        Ok(result)
    }

    /// Consume and return all bytes up to (but not including) the next
    /// occurrence of `term`.  The terminator itself is consumed.
    pub fn take_until(&mut self, term: u8) -> Result<&'a [u8]> {
        let pos = self.b[self.off..]
            .iter()
            .position(|b| *b == term)
            .ok_or(Error::Truncated)?;
        let result = self.take(pos)?;
        self.advance(1)?;
        Ok(result)
    }

    /// Consume and return a single u8.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }
    /// Consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    /// Consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    /// Consume and return a big-endian u64.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut x = [0_u8; 8];
        x.copy_from_slice(b);
        Ok(u64::from_be_bytes(x))
    }
    /// Consume and return a big-endian u128.
    pub fn take_u128(&mut self) -> Result<u128> {
        let b = self.take(16)?;
        let mut x = [0_u8; 16];
        x.copy_from_slice(b);
        Ok(u128::from_be_bytes(x))
    }

    /// Try to decode and consume a Readable object from this reader.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        E::take_from(self)
    }

    /// Try to decode and consume exactly `n` Readable objects from
    /// this reader, returning them in a Vec.
    pub fn extract_n<E: Readable>(&mut self, n: usize) -> Result<Vec<E>> {
        let mut result = Vec::with_capacity(n);
        for _ in 0..n {
            result.push(E::take_from(self)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounds() {
        let v = [7_u8; 8];
        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.total_len(), 8);
        assert!(r.take(9).is_err());
        assert_eq!(r.take(8).unwrap(), &v[..]);
        assert_eq!(r.consumed(), 8);
        assert!(r.should_be_exhausted().is_ok());
    }

    #[test]
    fn truncate() {
        let v = b"top of the key: wing: corner";
        let mut r = Reader::from_slice(&v[..]);
        r.advance(4).unwrap();
        r.truncate(10);
        assert_eq!(r.remaining(), 10);
        assert_eq!(r.take_until(b':').unwrap(), &b"of the key"[..]);
        assert!(r.take_u8().is_err());
    }

    #[test]
    fn take_until_missing() {
        let v = b"no terminator here";
        let mut r = Reader::from_slice(&v[..]);
        assert!(r.take_until(0).is_err());
        // Nothing was consumed by the failed call.
        assert_eq!(r.remaining(), v.len());
    }

    #[test]
    fn extract_n() {
        let v = [0_u8, 1, 0, 2, 0, 3];
        let mut r = Reader::from_slice(&v[..]);
        let shorts: Vec<u16> = r.extract_n(3).unwrap();
        assert_eq!(shorts, vec![1, 2, 3]);
    }
}

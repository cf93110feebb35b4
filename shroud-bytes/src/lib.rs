//! Utilities to decode/encode things into bytes.
//!
//! The shroud overlay protocols are built out of small binary objects:
//! cells, handshakes, link specifiers, certificates.  This crate
//! provides the [Reader] and [Writer] types used to parse and build
//! all of them.
//!
//! These tools are meant for objects of at most a few kilobytes; they
//! keep everything in memory and never do I/O.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod err;
mod impls;
mod reader;
mod writer;

pub use err::Error;
pub use reader::Reader;
pub use writer::Writer;

use arrayref::array_ref;

/// Result type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for an object that can be encoded onto a Writer by reference.
///
/// Most fixed-layout protocol objects should implement this.
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B);
}

/// Trait for an object that can be encoded onto a Writer, consuming
/// the original object.
///
/// This exists for objects (like MAC outputs) that can't be encoded
/// by reference.
pub trait WriteableOnce {
    /// Encode this object into the writer `b`, and consume it.
    fn write_into<B: Writer + ?Sized>(self, b: &mut B);
}

// ----------------------------------------------------------------------

/// Trait for an object that can be extracted from a Reader.
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    ///
    /// Implementations should generally not consume bytes from the
    /// reader if they return an error.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writer() {
        let mut v: Vec<u8> = Vec::new();
        v.write_u8(0x57);
        v.write_u16(0x6520);
        v.write_u32(0x68617665);
        v.write_u64(0x2061206d61636869);
        v.write_all(b"ne in a plexiglass dome");
        v.write_zeros(3);
        assert_eq!(&v[..], &b"We have a machine in a plexiglass dome\0\0\0"[..]);
    }

    #[test]
    fn reader() {
        let v = b"We have a machine in a plexiglass dome";
        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.take_u8().unwrap(), 0x57);
        assert_eq!(r.take_u16().unwrap(), 0x6520);
        assert_eq!(r.take(7).unwrap(), &b"have a "[..]);
        assert_eq!(r.remaining(), v.len() - 10);
        r.advance(8).unwrap();
        assert_eq!(r.take_until(b' ').unwrap(), &b"in"[..]);
        assert_eq!(r.take(17).unwrap(), &b"a plexiglass dome"[..]);
        assert!(r.should_be_exhausted().is_ok());

        assert!(r.take_u8().is_err());
        assert!(r.advance(1).is_err());
    }
}

//! Define an error type for the shroud-cell crate.

use std::sync::Arc;
use thiserror::Error;

/// An error type for the shroud-cell crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in shroud-bytes while decoding an
    /// object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] shroud_bytes::Error),
    /// An IO error occurred while reading or writing a cell.
    #[error("IO error: {0}")]
    IoErr(Arc<std::io::Error>),
    /// A cell was malformed in a way that went beyond its raw
    /// byte-level encoding.
    #[error("malformed cell: {0}")]
    MalformedCell(&'static str),
    /// A cell or message was too long to represent on the wire.
    #[error("object too big to encode")]
    CantEncode,
    /// Protocol violation at the channel level.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// Tried to make or use a stream to an invalid destination
    /// address.
    #[error("invalid stream target address")]
    BadStreamAddress,
    /// There was a programming error somewhere in the code.
    #[error("internal programming error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IoErr(Arc::new(e))
    }
}

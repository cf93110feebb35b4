//! Error type for the shroud-bytes crate.

use thiserror::Error;

/// Error type for decoding overlay-protocol objects from bytes.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The object is truncated: there weren't as many bytes as the
    /// object's encoding claims there should be.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// The object is complete, but there were extra bytes after it.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// The object's encoding is invalid for some type-specific reason.
    #[error("bad object: {0}")]
    BadMessage(&'static str),
    /// Something went wrong that should never happen.
    #[error("internal programming error")]
    Internal,
}

//! Low-level cryptographic implementations for the shroud overlay.
//!
//! There is not much original work here: for the most part this crate
//! wraps or re-exports other crates that implement the underlying
//! primitives, so that the rest of the workspace sees one consistent
//! interface and we have a single place to swap implementations.
//!
//! Symmetric encryption lives in [`cipher`], digests and XOFs in
//! [`d`], and public-key operations (signatures, key agreement,
//! identity digests) in [`pk`].

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod cipher;
pub mod d;
pub mod pk;
pub mod util;

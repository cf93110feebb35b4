//! Digests and XOFs used by the overlay protocols.
//!
//! For legacy reasons the wire protocol still relies on SHA1 in its
//! relay-crypto running digests; newer constructions use SHA2, SHA3,
//! and SHAKE.  Everything is re-exported here so that callers go
//! through the traits in the [digest](https://docs.rs/digest) crate.

pub use sha1::Sha1;
pub use sha2::{Sha256, Sha512};
pub use sha3::{Sha3_256, Shake128, Shake256};

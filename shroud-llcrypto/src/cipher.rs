//! Ciphers used by the overlay protocols.
//!
//! So far that means AES, and only AES in counter mode.

/// Re-exports implementations of counter-mode AES.
///
/// These types implement the
/// [StreamCipher](https://docs.rs/cipher/0.2.1/cipher/stream/trait.StreamCipher.html)
/// trait; use the [cipher](https://docs.rs/cipher/0.2.1/cipher/)
/// crate to access them.
pub mod aes {
    // These implement StreamCipher.
    pub use ::aes_ctr::{Aes128Ctr, Aes256Ctr};
}

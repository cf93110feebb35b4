//! Public-key cryptography for the shroud overlay.
//!
//! Legacy pieces of the protocol use RSA; everything newer is built
//! on curve25519 and ed25519.

pub mod ed25519;
pub mod rsa;

/// Re-exporting Curve25519 implementations.
///
/// Eventually there should probably be a key-agreement trait or two
/// here, but for now we just use the API from x25519-dalek.
pub mod curve25519 {
    pub use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
}

/// A type for a validatable signature.
///
/// It necessarily includes the signature, the public key, and (a hash
/// of) the document being checked.
pub trait ValidatableSignature {
    /// Check whether this signature is a correct signature for the
    /// document.
    fn is_valid(&self) -> bool;

    /// Return this value as a validatable Ed25519 signature, if it is
    /// one.
    fn as_ed25519(&self) -> Option<&ed25519::ValidatableEd25519Signature> {
        None
    }
}

/// Check whether all of the signatures in this list are valid.
///
/// Having a special implementation here allows us to batch-verify
/// Ed25519 signatures, which is significantly faster.
pub fn validate_all_sigs(v: &[Box<dyn ValidatableSignature>]) -> bool {
    let mut ed_sigs = Vec::new();
    let mut other_sigs = Vec::new();
    for sig in v {
        match sig.as_ed25519() {
            Some(ed) => ed_sigs.push(ed),
            None => other_sigs.push(sig),
        }
    }
    ed25519::validate_batch(&ed_sigs[..]) && other_sigs.iter().all(|b| b.is_valid())
}

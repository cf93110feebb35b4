//! Circuit-extension handshakes.
//!
//! Every circuit handshake is a one-way-authenticated key exchange:
//! a client that knows a public "onion key" for a relay sends it a
//! client onionskin, and receives a server onionskin in response.
//! When the handshake succeeds, both sides share fresh key material,
//! and the client knows that nobody else does unless they hold the
//! relay's private onion key.
//!
//! The current handshake is "ntor" ([ntor]); [fast] implements the
//! unauthenticated handshake used for first hops when no onion key is
//! known.

pub(crate) mod fast;
pub(crate) mod ntor;

use crate::{Result, SecretBytes};
use rand_core::{CryptoRng, RngCore};

/// A ClientHandshake is used to generate a client onionskin and
/// handle a server onionskin.
pub(crate) trait ClientHandshake {
    /// The type for the onion key.
    type KeyType;
    /// The type for the state that the client holds while waiting for
    /// a reply.
    type StateType;
    /// A type that is returned and used to generate session keys.
    type KeyGen;
    /// Generate a new client onionskin for a relay with a given onion
    /// key.
    ///
    /// On success, return a state object that will be used to
    /// complete the handshake, along with the message to send.
    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)>;
    /// Handle a server onionskin from a relay, and produce a key
    /// generator.
    ///
    /// The state object must match the one that was used to make the
    /// client onionskin that the server is replying to.
    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen>;
}

/// A ServerHandshake is used to handle a client onionskin and
/// generate a server onionskin.
pub(crate) trait ServerHandshake {
    /// The type for the onion key.  This is a private key type.
    type KeyType;
    /// The returned key generator type.
    type KeyGen;

    /// Perform the server handshake.  Take as input a strong PRNG in
    /// `rng`, a slice of all our private onion keys, and the client's
    /// message.
    ///
    /// On success, return a key generator and a server handshake
    /// message to send in reply.
    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &[Self::KeyType],
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)>;
}

/// A KeyGenerator is returned by a handshake, and used to generate
/// session keys for the protocol.
///
/// Typically it wraps a KDF and some seed key material.  It can only
/// be used once.
pub(crate) trait KeyGenerator {
    /// Consume the key material and return `keylen` bytes of key
    /// data.
    fn expand(self, keylen: usize) -> Result<SecretBytes>;
}

/// Generates keys based on the legacy iterated-digest KDF.
///
/// Only the CREATE_FAST handshake still uses this.
pub(crate) struct LegacyKeyGenerator {
    /// Seed for the legacy KDF.
    seed: SecretBytes,
}

impl LegacyKeyGenerator {
    /// Create a key generator based on a provided seed.
    pub(crate) fn new(seed: SecretBytes) -> Self {
        LegacyKeyGenerator { seed }
    }
}

impl KeyGenerator for LegacyKeyGenerator {
    fn expand(self, keylen: usize) -> Result<SecretBytes> {
        use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
        LegacyKdf::new(1).derive(&self.seed[..], keylen)
    }
}

/// Generates keys based on SHAKE-256.
pub(crate) struct ShakeKeyGenerator {
    /// Seed for the key generator.
    seed: SecretBytes,
}

impl ShakeKeyGenerator {
    /// Create a key generator based on a provided seed.
    #[allow(dead_code)] // used in tests; will be used by newer crypto schemes
    pub(crate) fn new(seed: SecretBytes) -> Self {
        ShakeKeyGenerator { seed }
    }
}

impl KeyGenerator for ShakeKeyGenerator {
    fn expand(self, keylen: usize) -> Result<SecretBytes> {
        use crate::crypto::ll::kdf::{Kdf, ShakeKdf};
        ShakeKdf::new().derive(&self.seed[..], keylen)
    }
}

//! Traits defining what the core needs to know about a relay.

use shroud_llcrypto::pk;
use std::net::SocketAddr;

/// Information about a relay, sufficient to open a channel to it.
///
/// The path-selection layer hands the core objects implementing this
/// trait; the core uses them to know where to connect and which
/// identities to demand during the link handshake.
pub trait ChanTarget {
    /// Return the addresses at which you can connect to this relay.
    fn addrs(&self) -> &[SocketAddr];
    /// Return the ed25519 identity for this relay.
    fn ed_identity(&self) -> &pk::ed25519::Ed25519Identity;
    /// Return the legacy RSA identity for this relay.
    fn rsa_identity(&self) -> &pk::rsa::RsaIdentity;
}

/// Information about a relay, sufficient to extend a circuit to it.
pub trait CircTarget: ChanTarget {
    /// Return a new vector of link specifiers for this relay, in the
    /// order in which they should appear in an EXTEND2 message.
    fn linkspecs(&self) -> Vec<crate::LinkSpec> {
        let mut result: Vec<crate::LinkSpec> = vec![(*self.ed_identity()).into()];
        for addr in self.addrs().iter() {
            result.push(addr.into());
        }
        result.push((*self.rsa_identity()).into());
        result
    }
    /// Return the ntor onion key for this relay.
    fn ntor_onion_key(&self) -> &pk::curve25519::PublicKey;
    /// Return true if this relay supports digest-authenticated
    /// circuit-level SENDME messages.
    ///
    /// (Every relay on the current network does; this exists so tests
    /// and downgraded peers can turn it off.)
    fn supports_authenticated_sendme(&self) -> bool {
        true
    }
}

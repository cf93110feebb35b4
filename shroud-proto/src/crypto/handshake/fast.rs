//! Implementation for the CREATE_FAST handshake.
//!
//! This handshake uses no public-key cryptography at all: it is only
//! safe when the circuit is one hop long and the channel under it is
//! already secure.  We use it when we want a first hop but know no
//! onion key for it.

use crate::crypto::ll::kdf::{Kdf, LegacyKdf};
use crate::util::ct::bytes_eq;
use crate::{Error, Result};

use rand_core::{CryptoRng, RngCore};

/// Number of bytes used for a CREATE_FAST handshake by the initiator.
pub(crate) const FAST_C_HANDSHAKE_LEN: usize = 20;
/// Number of bytes used for a CREATE_FAST handshake response.
pub(crate) const FAST_S_HANDSHAKE_LEN: usize = 20 * 2;

/// State for a CREATE_FAST client handshake.
pub(crate) struct CreateFastClientState([u8; FAST_C_HANDSHAKE_LEN]);

/// Client-handshake for CREATE_FAST.
///
/// See module documentation; you probably don't want to use this.
pub(crate) struct CreateFastClient;

impl super::ClientHandshake for CreateFastClient {
    type KeyType = ();
    type StateType = CreateFastClientState;
    type KeyGen = super::LegacyKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        _key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let mut state = [0_u8; FAST_C_HANDSHAKE_LEN];
        rng.fill_bytes(&mut state);
        Ok((CreateFastClientState(state), state.into()))
    }

    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen> {
        let msg = msg.as_ref();
        if msg.len() != FAST_S_HANDSHAKE_LEN {
            return Err(Error::BadHandshake);
        }
        let mut inp = Vec::new();
        inp.extend(&state.0[..]);
        inp.extend(&msg[0..20]);

        let kh_expect = LegacyKdf::new(0).derive(&inp[..], 20)?;

        if !bytes_eq(&kh_expect, &msg[20..40]) {
            return Err(Error::BadHandshake);
        }

        Ok(super::LegacyKeyGenerator::new(inp.into()))
    }
}

/// Relay-handshake for CREATE_FAST.
///
/// See module documentation; you probably don't want to use this.
pub(crate) struct CreateFastServer;

impl super::ServerHandshake for CreateFastServer {
    type KeyType = ();
    type KeyGen = super::LegacyKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        _key: &[Self::KeyType],
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)> {
        let msg = msg.as_ref();
        if msg.len() != FAST_C_HANDSHAKE_LEN {
            return Err(Error::BadHandshake);
        }
        let mut reply = vec![0_u8; FAST_S_HANDSHAKE_LEN];
        rng.fill_bytes(&mut reply[0..20]);

        let mut inp = Vec::new();
        inp.extend(&msg[..]);
        inp.extend(&reply[0..20]);
        let kh = LegacyKdf::new(0).derive(&inp[..], 20)?;
        reply[20..].copy_from_slice(&kh);

        Ok((super::LegacyKeyGenerator::new(inp.into()), reply))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::handshake::{ClientHandshake, KeyGenerator, ServerHandshake};

    #[test]
    fn roundtrip() {
        let mut rng = rand::thread_rng();

        let (state, cmsg) = CreateFastClient::client1(&mut rng, &()).unwrap();
        let (skg, smsg) = CreateFastServer::server(&mut rng, &[()], cmsg).unwrap();
        let ckg = CreateFastClient::client2(state, smsg).unwrap();

        let skeys = skg.expand(100).unwrap();
        let ckeys = ckg.expand(100).unwrap();

        assert_eq!(skeys, ckeys);
    }

    #[test]
    fn bad_lengths() {
        let mut rng = rand::thread_rng();

        let (state, _cmsg) = CreateFastClient::client1(&mut rng, &()).unwrap();
        assert!(matches!(
            CreateFastClient::client2(state, [4_u8; 39]),
            Err(Error::BadHandshake)
        ));

        assert!(matches!(
            CreateFastServer::server(&mut rng, &[()], [4_u8; 21]),
            Err(Error::BadHandshake)
        ));
    }

    #[test]
    fn tampered_reply() {
        let mut rng = rand::thread_rng();

        let (state, cmsg) = CreateFastClient::client1(&mut rng, &()).unwrap();
        let (_skg, mut smsg) = CreateFastServer::server(&mut rng, &[()], cmsg).unwrap();
        smsg[35] ^= 0x40;
        assert!(matches!(
            CreateFastClient::client2(state, smsg),
            Err(Error::BadHandshake)
        ));
    }
}

//! Relay cell cryptography.
//!
//! Everything a circuit carries is a relay cell.  The client who
//! built the circuit shares two separate sets of keys and state with
//! each relay on the circuit: one for traffic flowing away from the
//! client ("outbound"), and one for traffic flowing back ("inbound").
//! This module implements those per-hop states, the layered
//! encryption the client performs, and the single-layer operations a
//! forwarding relay performs.

use crate::{Error, Result};
use shroud_cell::chancell::RawCellBody;
use std::convert::TryInto;

use generic_array::GenericArray;

/// Type for the body of a relay cell.
#[derive(Clone)]
pub(crate) struct RelayCellBody(RawCellBody);

impl From<RawCellBody> for RelayCellBody {
    fn from(body: RawCellBody) -> Self {
        RelayCellBody(body)
    }
}
impl From<RelayCellBody> for RawCellBody {
    fn from(cell: RelayCellBody) -> Self {
        cell.0
    }
}
impl AsRef<[u8]> for RelayCellBody {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl AsMut<[u8]> for RelayCellBody {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

/// Represents the ability for circuit crypto state to be initialized
/// from a given seed.
pub(crate) trait CryptInit: Sized {
    /// Return the number of bytes that this state will require.
    fn seed_len() -> usize;
    /// Construct this state from a seed of the appropriate length.
    fn initialize(seed: &[u8]) -> Self;
    /// Initialize this object from a key generator.
    fn construct<K: super::handshake::KeyGenerator>(keygen: K) -> Result<Self> {
        let seed = keygen.expand(Self::seed_len())?;
        Ok(Self::initialize(&seed))
    }
}

/// A paired object containing the inbound and outbound cryptographic
/// layers used by a client for a single hop.
pub(crate) trait ClientLayer<F, B>
where
    F: OutboundClientLayer,
    B: InboundClientLayer,
{
    /// Consume this layer and return a paired outbound and inbound
    /// state.
    fn split(self) -> (F, B);
}

/// Represents a relay's view of the crypto state on a given circuit.
///
/// A forwarding relay holds exactly one layer of keys: decrypting an
/// outbound cell _is_ the removal of this relay's onion layer, and
/// encrypting an inbound cell is the addition of it.
pub(crate) trait RelayCrypt {
    /// Prepare a RelayCellBody to be sent towards the client,
    /// originating at this relay.
    ///
    /// Return the authentication tag that a SENDME acknowledging this
    /// cell would have to echo.
    fn originate(&mut self, cell: &mut RelayCellBody) -> &[u8];
    /// Encrypt a RelayCellBody that is moving towards the client.
    fn encrypt_inbound(&mut self, cell: &mut RelayCellBody);
    /// Decrypt a RelayCellBody that is moving away from the client.
    ///
    /// If the cell is addressed to this relay, return the
    /// authentication tag we would echo in a SENDME for it.
    fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> Option<&[u8]>;
}

/// A client's view of the crypto state shared with a single relay, as
/// used for outbound cells.
pub(crate) trait OutboundClientLayer {
    /// Prepare a RelayCellBody to be sent to the relay at this layer,
    /// and encrypt it.
    ///
    /// Return the authentication tag a SENDME acknowledging this cell
    /// would have to echo.
    fn originate_for(&mut self, cell: &mut RelayCellBody) -> &[u8];
    /// Encrypt a RelayCellBody that is to be decrypted by this layer.
    fn encrypt_outbound(&mut self, cell: &mut RelayCellBody);
}

/// A client's view of the crypto state shared with a single relay, as
/// used for inbound cells.
pub(crate) trait InboundClientLayer {
    /// Decrypt a RelayCellBody that passed through this layer.
    ///
    /// Return the authentication tag if this layer is the originator.
    fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> Option<&[u8]>;
}

/// Type to store hop indices on a circuit.
///
/// Hop indices are zero-based: "0" denotes the first hop on the
/// circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct HopNum(u8);

impl From<HopNum> for u8 {
    fn from(hop: HopNum) -> u8 {
        hop.0
    }
}

impl From<u8> for HopNum {
    fn from(v: u8) -> HopNum {
        HopNum(v)
    }
}

impl From<HopNum> for usize {
    fn from(hop: HopNum) -> usize {
        hop.0 as usize
    }
}

impl std::fmt::Display for HopNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

/// A client's view of the cryptographic state for an entire
/// constructed circuit, as used for sending cells.
pub(crate) struct OutboundClientCrypt {
    /// Vector of layers, one for each hop on the circuit, ordered
    /// from the closest hop to the farthest.
    layers: Vec<Box<dyn OutboundClientLayer + Send>>,
}

/// A client's view of the cryptographic state for an entire
/// constructed circuit, as used for receiving cells.
pub(crate) struct InboundClientCrypt {
    /// Vector of layers, one for each hop on the circuit, ordered
    /// from the closest hop to the farthest.
    layers: Vec<Box<dyn InboundClientLayer + Send>>,
}

impl OutboundClientCrypt {
    /// Return a new (empty) OutboundClientCrypt.
    pub(crate) fn new() -> Self {
        OutboundClientCrypt { layers: Vec::new() }
    }
    /// Prepare a cell body to be sent away from the client.
    ///
    /// The cell is prepared for the `hop`th hop, and then encrypted
    /// with the keys of every earlier layer, innermost first, so the
    /// outermost encryption belongs to the first hop.
    ///
    /// On success, returns a reference to the tag that should be
    /// expected in an authenticated SENDME sent in response to this
    /// cell.
    pub(crate) fn encrypt(&mut self, cell: &mut RelayCellBody, hop: HopNum) -> Result<&[u8; 20]> {
        let hop: usize = hop.into();
        if hop >= self.layers.len() {
            return Err(Error::NoSuchHop);
        }

        let mut layers = self.layers.iter_mut().take(hop + 1).rev();
        let first_layer = layers.next().ok_or(Error::NoSuchHop)?;
        let tag = first_layer.originate_for(cell);
        for layer in layers {
            layer.encrypt_outbound(cell);
        }
        Ok(tag.try_into().expect("wrong SENDME digest size"))
    }

    /// Add a new layer to this OutboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: Box<dyn OutboundClientLayer + Send>) {
        assert!(self.layers.len() < std::u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Return the number of layers configured on this
    /// OutboundClientCrypt.
    pub(crate) fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

impl InboundClientCrypt {
    /// Return a new (empty) InboundClientCrypt.
    pub(crate) fn new() -> Self {
        InboundClientCrypt { layers: Vec::new() }
    }
    /// Decrypt an incoming cell that is coming to the client.
    ///
    /// The cell is decrypted one layer at a time, closest hop first;
    /// the first layer at which the cell becomes "recognized" (and
    /// its digest checks out) is the hop that originated the cell.
    ///
    /// On success, return which hop was the originator, and the
    /// authentication tag for SENDMEs acknowledging this cell.
    pub(crate) fn decrypt(&mut self, cell: &mut RelayCellBody) -> Result<(HopNum, &[u8])> {
        for (hopnum, layer) in self.layers.iter_mut().enumerate() {
            if let Some(tag) = layer.decrypt_inbound(cell) {
                assert!(hopnum <= std::u8::MAX as usize);
                return Ok(((hopnum as u8).into(), tag));
            }
        }
        Err(Error::BadCellAuth)
    }
    /// Add a new layer to this InboundClientCrypt.
    pub(crate) fn add_layer(&mut self, layer: Box<dyn InboundClientLayer + Send>) {
        assert!(self.layers.len() < std::u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Return the number of layers configured on this
    /// InboundClientCrypt.
    #[allow(dead_code)]
    pub(crate) fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Standard relay crypto, as instantiated for RELAY cells.
pub(crate) type Onion1RelayCrypto =
    onion1::CryptStatePair<shroud_llcrypto::cipher::aes::Aes128Ctr, shroud_llcrypto::d::Sha1>;

/// The current relay cell crypto scheme: a stream cipher for the
/// body, and a running digest truncated to four bytes for
/// authentication.
pub(crate) mod onion1 {
    use super::*;
    use cipher::{NewStreamCipher, StreamCipher};
    use digest::Digest;
    use std::convert::TryInto;
    use typenum::Unsigned;

    /// A CryptState is one half of the state shared with one hop: a
    /// cipher and a running digest for a single direction.
    ///
    /// It is parameterized on a stream cipher and a digest type:
    /// everything deployed today uses AES-128-CTR and SHA1.
    pub(crate) struct CryptState<SC: StreamCipher, D: Digest + Clone> {
        /// Stream cipher for en/decrypting cell bodies.
        cipher: SC,
        /// Digest for authenticating cells to/from this hop.
        digest: D,
        /// Most recent digest value generated by this state.
        ///
        /// (This is the tag that an authenticated SENDME for the
        /// corresponding cell must echo.)
        last_digest_val: GenericArray<u8, D::OutputSize>,
    }

    /// A pair of CryptStates, one for the outbound (away from the
    /// client) direction and one for the inbound direction.
    pub(crate) struct CryptStatePair<SC: StreamCipher, D: Digest + Clone> {
        /// State for en/decrypting cells sent away from the client.
        fwd: CryptState<SC, D>,
        /// State for en/decrypting cells sent towards the client.
        back: CryptState<SC, D>,
    }

    impl<SC: StreamCipher + NewStreamCipher, D: Digest + Clone> CryptInit for CryptStatePair<SC, D> {
        fn seed_len() -> usize {
            SC::KeySize::to_usize() * 2 + D::OutputSize::to_usize() * 2
        }
        fn initialize(seed: &[u8]) -> Self {
            assert!(seed.len() == Self::seed_len());
            let keylen = SC::KeySize::to_usize();
            let dlen = D::OutputSize::to_usize();
            let fdinit = &seed[0..dlen];
            let bdinit = &seed[dlen..dlen * 2];
            let fckey = &seed[dlen * 2..dlen * 2 + keylen];
            let bckey = &seed[dlen * 2 + keylen..dlen * 2 + keylen * 2];
            let fwd = CryptState {
                cipher: SC::new(fckey.try_into().expect("Wrong length"), &Default::default()),
                digest: D::new().chain(fdinit),
                last_digest_val: GenericArray::default(),
            };
            let back = CryptState {
                cipher: SC::new(bckey.try_into().expect("Wrong length"), &Default::default()),
                digest: D::new().chain(bdinit),
                last_digest_val: GenericArray::default(),
            };
            CryptStatePair { fwd, back }
        }
    }

    impl<SC, D> ClientLayer<CryptState<SC, D>, CryptState<SC, D>> for CryptStatePair<SC, D>
    where
        SC: StreamCipher,
        D: Digest + Clone,
    {
        fn split(self) -> (CryptState<SC, D>, CryptState<SC, D>) {
            (self.fwd, self.back)
        }
    }

    impl<SC: StreamCipher, D: Digest + Clone> RelayCrypt for CryptStatePair<SC, D> {
        fn originate(&mut self, cell: &mut RelayCellBody) -> &[u8] {
            cell.set_digest(&mut self.back.digest, &mut self.back.last_digest_val);
            &self.back.last_digest_val
        }
        fn encrypt_inbound(&mut self, cell: &mut RelayCellBody) {
            self.back.cipher.apply_keystream(cell.as_mut());
        }
        fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> Option<&[u8]> {
            self.fwd.cipher.apply_keystream(cell.as_mut());
            if cell.recognized(&mut self.fwd.digest, &mut self.fwd.last_digest_val) {
                Some(&self.fwd.last_digest_val)
            } else {
                None
            }
        }
    }

    impl<SC: StreamCipher, D: Digest + Clone> OutboundClientLayer for CryptState<SC, D> {
        fn originate_for(&mut self, cell: &mut RelayCellBody) -> &[u8] {
            cell.set_digest(&mut self.digest, &mut self.last_digest_val);
            self.encrypt_outbound(cell);
            &self.last_digest_val
        }
        fn encrypt_outbound(&mut self, cell: &mut RelayCellBody) {
            self.cipher.apply_keystream(&mut cell.0[..]);
        }
    }

    impl<SC: StreamCipher, D: Digest + Clone> InboundClientLayer for CryptState<SC, D> {
        fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> Option<&[u8]> {
            self.cipher.apply_keystream(&mut cell.0[..]);
            if cell.recognized(&mut self.digest, &mut self.last_digest_val) {
                Some(&self.last_digest_val)
            } else {
                None
            }
        }
    }

    impl RelayCellBody {
        /// Prepare a cell body by setting its digest and recognized
        /// field.
        fn set_digest<D: Digest + Clone>(
            &mut self,
            d: &mut D,
            used_digest: &mut GenericArray<u8, D::OutputSize>,
        ) {
            self.0[1] = 0; // "recognized"
            self.0[2] = 0;
            self.0[5] = 0; // digest
            self.0[6] = 0;
            self.0[7] = 0;
            self.0[8] = 0;

            d.update(&self.0[..]);
            *used_digest = d.clone().finalize();
            self.0[5..9].copy_from_slice(&used_digest[0..4]);
        }
        /// Check a cell to see whether its recognized field and
        /// digest say it belongs to this hop.
        ///
        /// On success, the running digest `d` is advanced past this
        /// cell, and the full digest value is stored in `rcvd`.
        fn recognized<D: Digest + Clone>(
            &self,
            d: &mut D,
            rcvd: &mut GenericArray<u8, D::OutputSize>,
        ) -> bool {
            use crate::util::ct;
            use arrayref::array_ref;

            // The 'Recognized' field must be all zero.
            let recognized = u16::from_be_bytes(*array_ref![self.0, 1, 2]);
            if recognized != 0 {
                return false;
            }

            // Now check the digest field, computed over the cell with
            // the digest bytes themselves zeroed.
            let mut dtmp = d.clone();
            dtmp.update(&self.0[..5]);
            dtmp.update([0_u8; 4]);
            dtmp.update(&self.0[9..]);
            // Clone the digest before finalize destroys it; on a
            // match it becomes the new running state.
            let dtmp_clone = dtmp.clone();
            let result = dtmp.finalize();

            if ct::bytes_eq(&self.0[5..9], &result[0..4]) {
                *d = dtmp_clone;
                *rcvd = result;
                return true;
            }

            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SecretBytes;
    use rand::RngCore;

    fn add_layers(
        cc_out: &mut OutboundClientCrypt,
        cc_in: &mut InboundClientCrypt,
        pair: Onion1RelayCrypto,
    ) {
        let (outbound, inbound) = pair.split();
        cc_out.add_layer(Box::new(outbound));
        cc_in.add_layer(Box::new(inbound));
    }

    fn s(seed: &[u8]) -> SecretBytes {
        let mut s: SecretBytes = SecretBytes::new(Vec::new());
        s.extend(seed);
        s
    }

    #[test]
    fn roundtrip() {
        // Build a three-layer client stack and three independent
        // relay states from canned keys, and make sure cells are
        // recognized exactly where they should be.
        use crate::crypto::handshake::ShakeKeyGenerator as KGen;

        let seed1 = s(b"hidden we are free");
        let seed2 = s(b"free to speak, to free ourselves");
        let seed3 = s(b"free to hide no more");

        let mut cc_out = OutboundClientCrypt::new();
        let mut cc_in = InboundClientCrypt::new();
        let pair = Onion1RelayCrypto::construct(KGen::new(seed1.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);
        let pair = Onion1RelayCrypto::construct(KGen::new(seed2.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);
        let pair = Onion1RelayCrypto::construct(KGen::new(seed3.clone())).unwrap();
        add_layers(&mut cc_out, &mut cc_in, pair);

        assert_eq!(cc_in.n_layers(), 3);
        assert_eq!(cc_out.n_layers(), 3);

        let mut r1 = Onion1RelayCrypto::construct(KGen::new(seed1)).unwrap();
        let mut r2 = Onion1RelayCrypto::construct(KGen::new(seed2)).unwrap();
        let mut r3 = Onion1RelayCrypto::construct(KGen::new(seed3)).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 1..300 {
            // outbound cell
            let mut cell = [0_u8; 509];
            let mut cell_orig = [0_u8; 509];
            rng.fill_bytes(&mut cell_orig[..]);
            cell.copy_from_slice(&cell_orig[..]);
            let mut cell = cell.into();
            let _tag = cc_out.encrypt(&mut cell, 2.into()).unwrap();
            assert_ne!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);
            assert!(r1.decrypt_outbound(&mut cell).is_none());
            assert!(r2.decrypt_outbound(&mut cell).is_none());
            assert!(r3.decrypt_outbound(&mut cell).is_some());

            assert_eq!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);

            // inbound cell
            let mut cell = [0_u8; 509];
            let mut cell_orig = [0_u8; 509];
            rng.fill_bytes(&mut cell_orig[..]);
            cell.copy_from_slice(&cell_orig[..]);
            let mut cell = cell.into();

            r3.originate(&mut cell);
            r3.encrypt_inbound(&mut cell);
            r2.encrypt_inbound(&mut cell);
            r1.encrypt_inbound(&mut cell);
            let (layer, _tag) = cc_in.decrypt(&mut cell).unwrap();
            assert_eq!(layer, 2.into());
            assert_eq!(&cell.as_ref()[9..], &cell_orig.as_ref()[9..]);
        }

        // Try a failure: sending a cell to a nonexistent hop.
        {
            let mut cell = [0_u8; 509].into();
            let err = cc_out.encrypt(&mut cell, 10.into());
            assert!(matches!(err, Err(Error::NoSuchHop)));
        }

        // Try a failure: a junk cell with no correct auth from any
        // layer.
        {
            let mut cell = [0_u8; 509].into();
            let err = cc_in.decrypt(&mut cell);
            assert!(matches!(err, Err(Error::BadCellAuth)));
        }
    }

    #[test]
    fn cell_recognized_at_intermediate_hop() {
        // Address a cell to hop 2 of 3 and check that hop 3's state
        // never sees it as its own, while hop 2 recognizes it after
        // exactly two decryptions.
        use crate::crypto::handshake::ShakeKeyGenerator as KGen;
        let seeds = [
            s(b"first hop seed material....."),
            s(b"second hop seed material...."),
            s(b"third hop seed material....."),
        ];
        let mut cc_out = OutboundClientCrypt::new();
        let mut cc_in = InboundClientCrypt::new();
        let mut relays = Vec::new();
        for seed in seeds.iter() {
            let pair = Onion1RelayCrypto::construct(KGen::new(seed.clone())).unwrap();
            add_layers(&mut cc_out, &mut cc_in, pair);
            relays.push(Onion1RelayCrypto::construct(KGen::new(seed.clone())).unwrap());
        }

        let mut cell: RelayCellBody = [7_u8; 509].into();
        let _ = cc_out.encrypt(&mut cell, 1.into()).unwrap();

        // Hop 1 peels one layer and does not recognize the cell.
        assert!(relays[0].decrypt_outbound(&mut cell).is_none());
        // Hop 2 peels the next layer and recognizes it.
        assert!(relays[1].decrypt_outbound(&mut cell).is_some());
    }
}

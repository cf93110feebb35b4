//! Types to track and manage the circuit IDs in use on a channel.

use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::{Error, Result};
use shroud_cell::chancell::CircId;

use std::collections::{hash_map::Entry, HashMap};

use futures::channel::{mpsc, oneshot};

use rand::distributions::Distribution;
use rand::Rng;

/// Which group of circuit IDs are we allowed to allocate in this map?
///
/// The initiator of a channel uses one half of the ID space and the
/// responder the other, so the two sides can never collide on a
/// locally-chosen ID.  (A client may use the whole nonzero space,
/// since the relay side of its channels never allocates IDs.)
pub(super) enum CircIdRange {
    /// Only IDs with the high bit cleared.
    #[allow(dead_code)] // relays taking the responder role use this
    Low,
    /// Only IDs with the high bit set.
    High,
    /// Any nonzero ID.
    #[allow(dead_code)]
    All,
}

impl CircIdRange {
    /// Return a random circuit ID in the appropriate range.
    ///
    /// `wide_ids` is true on channels whose negotiated link protocol
    /// uses 4-byte circuit IDs.
    fn new_id<R: Rng>(&self, rng: &mut R, wide_ids: bool) -> CircId {
        /// Largest value available with 2-byte circuit IDs.
        const NARROW_MASK: u32 = 0xffff;
        // Make sure v is nonzero.
        let mut v = loop {
            match rng.gen() {
                0_u32 => (),
                x => break x,
            }
        };
        if !wide_ids {
            v &= NARROW_MASK;
            if v == 0 {
                v = 1;
            }
        }
        let high_bit = if wide_ids { 0x8000_0000 } else { 0x8000 };
        // Force the high bit of v to the appropriate value.
        match self {
            CircIdRange::Low => v & !high_bit,
            CircIdRange::High => v | high_bit,
            CircIdRange::All => v,
        }
        .into()
    }
}

/// An entry in the circuit map.
pub(super) enum CircEnt {
    /// A circuit that has not yet received a CREATED cell.
    ///
    /// For this circuit, the CREATED* cell or DESTROY cell gets sent
    /// to the oneshot sender to tell the corresponding
    /// PendingClientCirc that the handshake is done.
    ///
    /// (The mpsc sender is saved here so that the circuit can get
    /// subsequent messages once it opens.)
    Opening(
        oneshot::Sender<CreateResponse>,
        mpsc::Sender<ClientCircChanMsg>,
    ),
    /// A circuit that is open and can receive cells.
    Open(mpsc::Sender<ClientCircChanMsg>),
    /// A circuit that we have torn down (or refused), but where the
    /// peer might still send a few cells before it hears our DESTROY.
    ///
    /// We keep this entry so that a cell for a dead circuit is
    /// distinguishable from a cell for a circuit that never existed,
    /// and so that we send at most one DESTROY per circuit ID.
    DestroySent(HalfCirc),
}

/// A map from circuit IDs to circuit entries.  Each channel has one.
pub(super) struct CircMap {
    /// Which random circuit IDs are we allowed to allocate?
    idrange: CircIdRange,
    /// True if this channel uses 4-byte circuit IDs.
    wide_ids: bool,
    /// The entries, indexed by circuit ID.
    m: HashMap<CircId, CircEnt>,
}

impl CircMap {
    /// Make a new empty CircMap.
    pub(super) fn new(idrange: CircIdRange, wide_ids: bool) -> Self {
        CircMap {
            idrange,
            wide_ids,
            m: HashMap::new(),
        }
    }

    /// Add a new pair of elements to this map, in the Opening state,
    /// under a randomly-chosen circuit ID.
    ///
    /// On success return the circuit ID.  If we fail
    /// [`MAX_ID_ATTEMPTS`](crate::util::idmap::MAX_ID_ATTEMPTS) times
    /// in a row, the channel's ID space is saturated and we refuse
    /// the circuit with a transient resource error.
    pub(super) fn add_opening_ent<R: Rng>(
        &mut self,
        rng: &mut R,
        createdsink: oneshot::Sender<CreateResponse>,
        sink: mpsc::Sender<ClientCircChanMsg>,
    ) -> Result<CircId> {
        for _ in 0..crate::util::idmap::MAX_ID_ATTEMPTS {
            let id = self.idrange.new_id(rng, self.wide_ids);
            if let Entry::Vacant(v) = self.m.entry(id) {
                v.insert(CircEnt::Opening(createdsink, sink));
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Insert an entry for a circuit whose ID was chosen by the peer.
    ///
    /// (Only forwarding circuits have peer-chosen IDs.)  Fails if the
    /// ID is already in use by a live circuit.
    pub(super) fn put_peer_ent(
        &mut self,
        id: CircId,
        sink: mpsc::Sender<ClientCircChanMsg>,
    ) -> Result<()> {
        match self.m.entry(id) {
            Entry::Vacant(v) => {
                v.insert(CircEnt::Open(sink));
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::ChanProto(format!(
                "Peer reused a live circuit ID {}",
                id
            ))),
        }
    }

    /// Testing only: return the entry for `id` in this map, if any.
    #[cfg(test)]
    pub(super) fn get_mut(&mut self, id: CircId) -> Option<&mut CircEnt> {
        self.m.get_mut(&id)
    }

    /// If `id` is the ID for an opening circuit, mark it open and
    /// return the oneshot that will tell that circuit about the
    /// CREATED* message we just received.
    pub(super) fn advance_from_opening(
        &mut self,
        id: CircId,
    ) -> Result<oneshot::Sender<CreateResponse>> {
        // We need to remove the entry before inserting the new one,
        // since the Opening variant owns both senders.
        let old = self.m.remove(&id);
        match old {
            Some(CircEnt::Opening(oneshot, sink)) => {
                self.m.insert(id, CircEnt::Open(sink));
                Ok(oneshot)
            }
            Some(ent) => {
                // Not opening: put it back untouched.
                self.m.insert(id, ent);
                Err(Error::ChanProto(
                    "Unexpected CREATED* cell for open circuit".into(),
                ))
            }
            None => Err(Error::ChanProto(
                "Unexpected CREATED* cell for nonexistent circuit".into(),
            )),
        }
    }

    /// Return an open-circuit sink for `id`, or information about why
    /// we can't deliver to it.
    pub(super) fn open_ent_mut(
        &mut self,
        id: CircId,
    ) -> Option<&mut CircEnt> {
        self.m.get_mut(&id)
    }

    /// Remove the live entry for `id`, replacing it with a
    /// DestroySent placeholder that will accept (and count) a bounded
    /// number of further relay cells.
    pub(super) fn destroy_sent(&mut self, id: CircId, hs: HalfCirc) -> Option<CircEnt> {
        self.m.insert(id, CircEnt::DestroySent(hs))
    }

    /// Remove the entry for `id` from this map entirely.
    pub(super) fn remove(&mut self, id: CircId) -> Option<CircEnt> {
        self.m.remove(&id)
    }

    /// Return the number of live (non-DestroySent) circuits in this
    /// map.
    pub(super) fn n_open_circs(&self) -> usize {
        self.m
            .values()
            .filter(|ent| !matches!(ent, CircEnt::DestroySent(_)))
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_in_range() {
        let mut rng = rand::thread_rng();
        let high = CircIdRange::High;
        let low = CircIdRange::Low;
        for _ in 0..100 {
            let h: u32 = high.new_id(&mut rng, true).into();
            assert!(h & 0x8000_0000 != 0);
            let l: u32 = low.new_id(&mut rng, true).into();
            assert!(l & 0x8000_0000 == 0);
            assert!(l != 0);

            // Narrow (2-byte) IDs stay in range too.
            let h: u32 = high.new_id(&mut rng, false).into();
            assert!(h & 0x8000 != 0);
            assert!(h <= 0xffff);
            let l: u32 = low.new_id(&mut rng, false).into();
            assert!(l & 0x8000 == 0);
            assert!(l != 0 && l <= 0xffff);
        }
    }

    #[test]
    fn opening_lifecycle() {
        let mut rng = rand::thread_rng();
        let mut map = CircMap::new(CircIdRange::High, true);
        let (created_snd, _created_rcv) = oneshot::channel();
        let (cell_snd, _cell_rcv) = mpsc::channel(4);
        let id = map.add_opening_ent(&mut rng, created_snd, cell_snd).unwrap();
        assert!(matches!(map.get_mut(id), Some(CircEnt::Opening(_, _))));

        // Advancing the circuit makes it open and yields the oneshot.
        let _created = map.advance_from_opening(id).unwrap();
        assert!(matches!(map.get_mut(id), Some(CircEnt::Open(_))));

        // A second CREATED for the same circuit is a protocol error.
        assert!(map.advance_from_opening(id).is_err());

        // After a destroy, the entry sticks around as a placeholder.
        map.destroy_sent(id, HalfCirc::new(100));
        assert!(matches!(map.get_mut(id), Some(CircEnt::DestroySent(_))));
        assert_eq!(map.n_open_circs(), 0);
    }

    #[test]
    fn peer_chosen_ids() {
        let mut map = CircMap::new(CircIdRange::Low, true);
        let (snd, _rcv) = mpsc::channel(4);
        map.put_peer_ent(77.into(), snd).unwrap();
        let (snd2, _rcv2) = mpsc::channel(4);
        assert!(map.put_peer_ent(77.into(), snd2).is_err());
    }
}

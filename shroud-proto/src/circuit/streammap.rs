//! Types to track and manage the streams on a circuit.

use crate::circuit::halfstream::HalfStream;
use crate::circuit::sendme::{StreamRecvWindow, StreamSendWindow};
use crate::Result;
use shroud_cell::relaycell::{msg::RelayMsg, StreamId};

use rand::distributions::Distribution;
use rand::Rng;

use futures::channel::mpsc;

/// The entry for a stream.
pub(super) enum StreamEnt {
    /// An open stream: cells may be sent and received.
    Open {
        /// Sink that leads to the stream object's reader.
        sink: mpsc::Sender<RelayMsg>,
        /// The send window for this stream, shared with the stream
        /// object.
        send_window: StreamSendWindow,
        /// The receive window for this stream: how many more data
        /// cells we will accept before the peer must wait for a
        /// SENDME.
        recv_window: StreamRecvWindow,
        /// True once a CONNECTED message has arrived for this
        /// stream.
        received_connected: bool,
    },
    /// A stream on which we have sent an END, but not yet received
    /// one.
    EndSent(HalfStream),
    /// A stream on which the peer sent us an END; the entry only
    /// remains until the local stream object notices.
    EndReceived,
}

/// Distribution that yields random nonzero stream IDs.
struct StreamIdDist;
impl Distribution<StreamId> for StreamIdDist {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> StreamId {
        loop {
            let val: u16 = rng.gen();
            if val != 0 {
                return val.into();
            }
        }
    }
}

/// What to do after removing a stream from the map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum ShouldSendEnd {
    /// We still owe the peer an END for this stream.
    Send,
    /// The peer already ended the stream; no END is needed.
    DontSend,
}

/// A map from stream IDs to stream entries.  Each circuit has one per
/// hop.
pub(super) struct StreamMap {
    /// Underlying identifier-keyed map.
    m: crate::util::idmap::IdMap<StreamId, StreamIdDist, StreamEnt>,
}

impl StreamMap {
    /// Make a new empty StreamMap.
    pub(super) fn new() -> Self {
        StreamMap {
            m: crate::util::idmap::IdMap::new(StreamIdDist),
        }
    }

    /// Add an entry to this map, allocating a random stream ID for
    /// it; return the ID on success.
    pub(super) fn add_ent<R: Rng>(
        &mut self,
        rng: &mut R,
        sink: mpsc::Sender<RelayMsg>,
        send_window: StreamSendWindow,
        recv_window: StreamRecvWindow,
    ) -> Result<StreamId> {
        let ent = StreamEnt::Open {
            sink,
            send_window,
            recv_window,
            received_connected: false,
        };
        self.m.add_ent(rng, ent)
    }

    /// Add an entry to this map under a stream ID chosen by the peer.
    ///
    /// (Exit-side streams have peer-chosen IDs.)
    pub(super) fn add_ent_with_id(
        &mut self,
        id: StreamId,
        sink: mpsc::Sender<RelayMsg>,
        send_window: StreamSendWindow,
        recv_window: StreamRecvWindow,
    ) -> Result<()> {
        if self.m.get_mut(&id).is_some() {
            return Err(crate::Error::CircProto(format!(
                "Peer reused stream ID {}",
                id
            )));
        }
        self.m.put_ent(
            id,
            StreamEnt::Open {
                sink,
                send_window,
                recv_window,
                // Exit-side streams never see CONNECTED; we sent it.
                received_connected: true,
            },
        );
        Ok(())
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEnt> {
        self.m.get_mut(&id)
    }

    /// Note that we received an END cell on the stream with `id`.
    pub(super) fn end_received(&mut self, id: StreamId) -> Result<()> {
        match self.m.remove(&id) {
            Some(StreamEnt::Open { .. }) => {
                self.m.put_ent(id, StreamEnt::EndReceived);
                Ok(())
            }
            // Both sides have ended: the entry can go away entirely.
            Some(StreamEnt::EndSent(_)) => Ok(()),
            Some(StreamEnt::EndReceived) => Err(crate::Error::CircProto(
                "Received two END cells on same stream".into(),
            )),
            None => Err(crate::Error::CircProto(
                "Received END cell on nonexistent stream".into(),
            )),
        }
    }

    /// Remove the entry for a stream that the local side is done
    /// with, and return whether we still need to send an END for it.
    ///
    /// The windows are retained in a half-stream entry so that
    /// in-flight cells from the peer stay accountable.
    pub(super) fn terminate(&mut self, id: StreamId) -> Result<ShouldSendEnd> {
        match self.m.remove(&id) {
            Some(StreamEnt::Open {
                send_window,
                recv_window,
                received_connected,
                ..
            }) => {
                // The peer may still have data in flight; keep the
                // windows alive in a half-closed entry.  A CONNECTED
                // is still acceptable there if none arrived yet.
                let half = HalfStream::new(send_window, recv_window, !received_connected);
                self.m.put_ent(id, StreamEnt::EndSent(half));
                Ok(ShouldSendEnd::Send)
            }
            Some(StreamEnt::EndReceived) => Ok(ShouldSendEnd::DontSend),
            Some(StreamEnt::EndSent(_)) => Err(crate::Error::InternalError(
                "Terminated a stream that was already terminated".into(),
            )),
            None => Err(crate::Error::InternalError(
                "Terminated a nonexistent stream".into(),
            )),
        }
    }

    /// Return the number of entries in this map.
    ///
    /// Half-closed entries count too; for the per-circuit stream cap
    /// that is the conservative direction.
    pub(super) fn n_streams(&self) -> usize {
        self.m.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::circuit::sendme::{RecvWindow, SendWindow};

    fn open_parts() -> (
        mpsc::Sender<RelayMsg>,
        StreamSendWindow,
        StreamRecvWindow,
        mpsc::Receiver<RelayMsg>,
    ) {
        let (snd, rcv) = mpsc::channel(64);
        (snd, SendWindow::new(500), RecvWindow::new(500), rcv)
    }

    #[test]
    fn lifecycle() {
        let mut rng = rand::thread_rng();
        let mut map = StreamMap::new();
        let (snd, sw, rw, _rcv) = open_parts();
        let id = map.add_ent(&mut rng, snd, sw, rw).unwrap();
        assert!(matches!(map.get_mut(id), Some(StreamEnt::Open { .. })));

        // Locally closing the stream means we owe an END.
        assert_eq!(map.terminate(id).unwrap(), ShouldSendEnd::Send);
        assert!(matches!(map.get_mut(id), Some(StreamEnt::EndSent(_))));

        // When the peer's END arrives afterwards, the entry is gone.
        map.end_received(id).unwrap();
        assert!(map.get_mut(id).is_none());
    }

    #[test]
    fn end_first() {
        let mut rng = rand::thread_rng();
        let mut map = StreamMap::new();
        let (snd, sw, rw, _rcv) = open_parts();
        let id = map.add_ent(&mut rng, snd, sw, rw).unwrap();

        // The peer ends the stream first.
        map.end_received(id).unwrap();
        assert!(matches!(map.get_mut(id), Some(StreamEnt::EndReceived)));
        // A duplicate END is a violation.
        assert!(map.end_received(id).is_err());

        // When we then close locally, no END is owed.
        assert_eq!(map.terminate(id).unwrap(), ShouldSendEnd::DontSend);
        assert!(map.get_mut(id).is_none());
    }

    #[test]
    fn peer_chosen_id() {
        let mut map = StreamMap::new();
        let (snd, sw, rw, _rcv) = open_parts();
        map.add_ent_with_id(42.into(), snd, sw, rw).unwrap();
        let (snd2, sw2, rw2, _rcv2) = open_parts();
        assert!(map.add_ent_with_id(42.into(), snd2, sw2, rw2).is_err());
    }
}

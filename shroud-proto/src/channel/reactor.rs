//! Code to handle incoming cells on a channel.
//!
//! The role of this code is to run in a separate asynchronous task,
//! and route cells to the right circuits.

use super::circmap::{CircEnt, CircMap};
use crate::circuit::celltypes::ClientCircChanMsg;
use crate::circuit::halfcirc::HalfCirc;
use crate::util::err::ReactorError;
use crate::{Error, Result};
use shroud_cell::chancell::msg::{Destroy, DestroyReason};
use shroud_cell::chancell::{msg::ChanMsg, ChanCell, CircId};

use futures::channel::{mpsc, oneshot};
use futures::lock::Mutex;
use futures::select_biased;
use futures::sink::SinkExt;
use futures::stream::{self, StreamExt};

use std::convert::TryInto;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

/// A message telling the channel reactor to do something.
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// Shut down the reactor.
    Shutdown,
    /// Register a new one-shot receiver that can send a CtrlMsg to
    /// the reactor.
    Register(oneshot::Receiver<CtrlMsg>),
    /// Tell the reactor that a given circuit has gone away, and with
    /// what reason to destroy it.
    CloseCircuit(CircId, DestroyReason),
}

/// Type returned by a oneshot channel for a CtrlMsg.
///
/// The oneshot itself can also be dropped without sending, in which
/// case we get a Canceled notification; those are ignorable.
pub(crate) type CtrlResult = std::result::Result<CtrlMsg, oneshot::Canceled>;

/// A stream to multiplex over a bunch of oneshot CtrlMsg replies.
///
/// (We can't let everyone use the mpsc control stream, since a
/// `Drop` impl can't call async send; oneshot senders can fire
/// synchronously.)
type OneshotStream = stream::SelectAll<stream::Once<oneshot::Receiver<CtrlMsg>>>;

/// How many straggler RELAY cells we accept on a circuit after
/// sending a DESTROY for it.
///
/// A full pair of circuit windows can be in flight when we tear a
/// circuit down; anything beyond that is a protocol violation.
const RELAY_CELLS_PER_DEAD_CIRC: u16 = 3000;

/// Object to handle incoming cells on a channel.
///
/// This type is returned when you finish a channel; you need to spawn
/// a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the channel won't work."]
pub struct Reactor {
    /// A stream of oneshot receivers that this reactor can use to get
    /// control messages.
    control: stream::Fuse<stream::Select<mpsc::Receiver<CtrlResult>, OneshotStream>>,
    /// A Stream from which we can read ChanCells.  This should be
    /// backed by a TLS connection.
    input: stream::Fuse<super::BoxedChannelStream>,
    /// A map from circuit ID to Sinks on which we can deliver cells.
    circs: Arc<Mutex<CircMap>>,
    /// Channel pointer, used to send DESTROY cells and to mark the
    /// channel closed.
    channel: Weak<super::Channel>,
    /// Where to deliver circuit-creation requests from the peer, when
    /// this channel belongs to a relay.  None on client channels.
    incoming: Option<mpsc::Sender<crate::relay::IncomingCircuit>>,
    /// Logging identifier for this channel.
    unique_id: super::UniqId,
}

impl Reactor {
    /// Construct a new Reactor.
    ///
    /// Cells should be taken from input and routed according to
    /// circmap.  When closeflag fires, the reactor should shut down.
    pub(crate) fn new(
        channel: &Arc<super::Channel>,
        circmap: Arc<Mutex<CircMap>>,
        control: mpsc::Receiver<CtrlResult>,
        closeflag: oneshot::Receiver<CtrlMsg>,
        input: super::BoxedChannelStream,
        incoming: Option<mpsc::Sender<crate::relay::IncomingCircuit>>,
    ) -> Self {
        let mut oneshots = stream::SelectAll::new();
        oneshots.push(stream::once(closeflag));
        let control = stream::select(control, oneshots);
        Reactor {
            control: control.fuse(),
            input: input.fuse(),
            circs: circmap,
            channel: Arc::downgrade(channel),
            incoming,
            unique_id: channel.unique_id(),
        }
    }

    /// Launch the reactor, and run until the channel closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the channel is dead and every
    /// circuit on it will see its cell stream end.
    pub async fn run(mut self) -> Result<()> {
        if let Some(chan) = self.channel.upgrade() {
            if chan.is_closing() {
                return Err(Error::ChannelClosed);
            }
        } else {
            return Err(Error::ChannelClosed);
        }
        debug!("{}: Running reactor", self.unique_id);
        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        debug!("{}: Reactor stopped: {:?}", self.unique_id, result);
        if let Some(chan) = self.channel.upgrade() {
            chan.mark_closed();
        }
        // Dropping the reactor drops the circuit map, which closes
        // every circuit's cell stream; circuits treat that as
        // "channel closed" and shut down with CHANNEL_CLOSED.
        result
    }

    /// Helper for run(): handles only one action.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        // What's next: maybe we got a cell, maybe the TLS connection
        // got closed, maybe we've been told to shut down.
        select_biased! {
            // we got a control message!
            ctrl = self.control.next() => {
                match ctrl {
                    Some(Ok(CtrlMsg::Shutdown)) =>
                        return Err(ReactorError::Shutdown),
                    Some(Ok(msg)) => self.handle_control(msg).await?,
                    Some(Err(_)) => (), // sender cancelled; ignore.
                    None => return Err(ReactorError::Shutdown),
                }
            }
            // we got a cell or a close.
            item = self.input.next() => {
                let item = match item {
                    None => return Err(ReactorError::Shutdown), // the TLS connection closed.
                    Some(r) => r.map_err(Error::CellErr)?, // it's a cell.
                };
                self.handle_cell(item).await?;
            }
        };

        Ok(()) // Run again.
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        trace!("{}: reactor received {:?}", self.unique_id, msg);
        match msg {
            CtrlMsg::Shutdown => (), // was handled in reactor loop.
            CtrlMsg::Register(ch) => self.register(ch),
            CtrlMsg::CloseCircuit(id, reason) => self.outbound_destroy_circ(id, reason).await?,
        }
        Ok(())
    }

    /// Ensure that we get a message on self.control when `ch` fires.
    fn register(&mut self, ch: oneshot::Receiver<CtrlMsg>) {
        let (_, select_all) = self.control.get_mut().get_mut();
        select_all.push(stream::once(ch));
    }

    /// Helper: process a cell on a channel.  Most cell types get
    /// ignored or rejected; a few get delivered to circuits.
    async fn handle_cell(&mut self, cell: ChanCell) -> Result<()> {
        let (circid, msg) = cell.into_circid_and_msg();
        use ChanMsg::*;

        match msg {
            Relay(_) | RelayEarly(_) | Padding(_) | VPadding(_) => {} // too frequent to log.
            _ => trace!("{}: received {} for {}", self.unique_id, msg.cmd(), circid),
        }

        match msg {
            // These are allowed, and need to be handled.
            Relay(_) | RelayEarly(_) => self.deliver_relay(circid, msg).await,

            Destroy(_) => self.deliver_destroy(circid, msg).await,

            CreatedFast(_) | Created2(_) => self.deliver_created(circid, msg).await,

            // Circuit-creation requests: only relays take these.
            Create(_) | CreateFast(_) | Create2(_) => self.deliver_create(circid, msg).await,

            // The obsolete-format response; we never send the request
            // that would merit it.
            Created(_) => Err(Error::ChanProto(format!("{} cell received", msg.cmd()))),

            // These aren't allowed after handshaking is done.
            Versions(_) | Certs(_) | Authorize(_) | Authenticate(_) | AuthChallenge(_)
            | Netinfo(_) => Err(Error::ChanProto(format!(
                "{} cell after handshake is done",
                msg.cmd()
            ))),

            // Padding is always ignored.
            Padding(_) | VPadding(_) => Ok(()),

            // The peer would like to adjust our padding schedule.
            PaddingNegotiate(p) => {
                if let Some(chan) = self.channel.upgrade() {
                    let (low, high) = p.timing_bounds();
                    let params =
                        super::padding::PaddingParams::from_negotiation(p.is_start(), low, high);
                    let mut inner = chan.inner.lock().await;
                    inner.padding.reconfigure(params);
                }
                Ok(())
            }

            // Unrecognized cell types are safe to allow _on
            // channels_, since they can't propagate.
            Unrecognized(m) => {
                debug!(
                    "{}: dropping unrecognized cell command {}",
                    self.unique_id,
                    m.cmd()
                );
                Ok(())
            }
        }
    }

    /// Give the RELAY or RELAY_EARLY cell `msg` to the appropriate
    /// circuit.
    async fn deliver_relay(&mut self, circid: CircId, msg: ChanMsg) -> Result<()> {
        let mut map = self.circs.lock().await;

        match map.open_ent_mut(circid) {
            Some(CircEnt::Open(s)) => {
                // There's an open circuit; we can give it the RELAY
                // cell.  An error here means the circuit reactor has
                // gone away but its map entry hasn't been cleaned up
                // yet; that's a local race, not a peer violation.
                s.send(msg.try_into()?)
                    .await
                    .map_err(|_| Error::CircuitClosed)
            }
            Some(CircEnt::Opening(_, _)) => Err(Error::ChanProto(
                "Relay cell on pending circuit before CREATED* received".into(),
            )),
            Some(CircEnt::DestroySent(hs)) => hs.receive_cell(),
            None => {
                // A cell on an unknown circuit gets exactly one
                // DESTROY in response, then silence.
                drop(map);
                self.unknown_circid(circid).await
            }
        }
    }

    /// Handle a CREATED{_FAST,2} cell by passing it on to the
    /// appropriate circuit, if that circuit is waiting for one.
    async fn deliver_created(&mut self, circid: CircId, msg: ChanMsg) -> Result<()> {
        let mut map = self.circs.lock().await;
        let target = map.advance_from_opening(circid)?;
        let created = msg.try_into()?;
        // Failure here means the circuit went away before the
        // CREATED arrived; no harm done.
        let _ = target.send(created);
        Ok(())
    }

    /// Handle a DESTROY cell by removing the corresponding circuit
    /// from the map, and passing the destroy cell onward to the
    /// circuit.
    async fn deliver_destroy(&mut self, circid: CircId, msg: ChanMsg) -> Result<()> {
        let mut map = self.circs.lock().await;
        // Remove the circuit from the map: nothing more can be done
        // with it.
        let entry = map.remove(circid);
        match entry {
            // If the circuit is waiting for CREATED, tell it that it
            // won't get one.
            Some(CircEnt::Opening(oneshot, _)) => {
                trace!(
                    "{}: Passing destroy to pending circuit {}",
                    self.unique_id,
                    circid
                );
                let _ = oneshot.send(msg.try_into()?);
                Ok(())
            }
            // It's an open circuit: tell it that it got a DESTROY cell.
            Some(CircEnt::Open(mut sink)) => {
                trace!("{}: Passing destroy to open circuit {}", self.unique_id, circid);
                let _ = sink.send(msg.try_into()?).await;
                Ok(())
            }
            // We already sent a destroy; nothing to do.
            Some(CircEnt::DestroySent(_)) => Ok(()),
            // Got a DESTROY for a circuit we don't have.
            None => {
                trace!("{}: Destroy for nonexistent circuit {}", self.unique_id, circid);
                Err(Error::ChanProto("Destroy for nonexistent circuit".into()))
            }
        }
    }

    /// Handle a CREATE{,_FAST,2} cell: on a relay channel, deliver
    /// the request to the relay engine; on a client channel, it's a
    /// protocol violation.
    async fn deliver_create(&mut self, circid: CircId, msg: ChanMsg) -> Result<()> {
        let incoming = match &mut self.incoming {
            Some(snd) => snd,
            None => {
                return Err(Error::ChanProto(format!(
                    "{} cell on client channel",
                    msg.cmd()
                )))
            }
        };
        let channel = match self.channel.upgrade() {
            Some(c) => c,
            None => return Err(Error::ChannelClosed),
        };

        let handshake = match msg {
            ChanMsg::Create2(m) => crate::relay::CreateHandshake::Create2(m),
            ChanMsg::CreateFast(m) => crate::relay::CreateHandshake::CreateFast(m),
            ChanMsg::Create(_) => {
                // The obsolete public-key handshake must be refused.
                let destroy = Destroy::new(DestroyReason::PROTOCOL).into();
                let cell = ChanCell::new(circid, destroy);
                let mut map = self.circs.lock().await;
                map.destroy_sent(circid, HalfCirc::new(RELAY_CELLS_PER_DEAD_CIRC));
                drop(map);
                return channel.send_response(cell).await;
            }
            _ => unreachable!("deliver_create called with a non-create cell"),
        };

        // Register the circuit under the peer's chosen ID before
        // answering, so no later cell on it can slip past us.
        let (snd, rcv) = mpsc::channel(128);
        {
            let mut map = self.circs.lock().await;
            map.put_peer_ent(circid, snd)?;
        }

        let req = crate::relay::IncomingCircuit {
            circid,
            handshake,
            channel: Arc::clone(&channel),
            cells: rcv,
        };
        incoming
            .send(req)
            .await
            .map_err(|_| Error::InternalError("relay engine went away".into()))
    }

    /// Respond to a cell on an unknown circuit ID: send exactly one
    /// DESTROY and remember that we did.
    async fn unknown_circid(&mut self, circid: CircId) -> Result<()> {
        trace!(
            "{}: Cell on unknown circuit {}; sending DESTROY",
            self.unique_id,
            circid
        );
        {
            let mut map = self.circs.lock().await;
            map.destroy_sent(circid, HalfCirc::new(RELAY_CELLS_PER_DEAD_CIRC));
        }
        if let Some(chan) = self.channel.upgrade() {
            let destroy = Destroy::new(DestroyReason::NONE).into();
            let cell = ChanCell::new(circid, destroy);
            chan.send_response(cell).await?;
        }
        Ok(())
    }

    /// Called when a circuit goes away: sends a DESTROY cell and
    /// removes the circuit.
    async fn outbound_destroy_circ(&mut self, id: CircId, reason: DestroyReason) -> Result<()> {
        trace!("{}: Circuit {} is gone; sending DESTROY", self.unique_id, id);
        if let Some(chan) = self.channel.upgrade() {
            // Only one DESTROY per circuit ID, no matter how many
            // owners let go of it.
            if chan.release_circ_id(id).await {
                let destroy = Destroy::new(reason).into();
                let cell = ChanCell::new(id, destroy);
                chan.send_response(cell).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::test::fake_channel_with_reactor;
    use futures_await_test::async_test;
    use shroud_cell::chancell::msg;

    // Try shutdown from inside run_once.
    #[async_test]
    async fn shutdown() {
        let (chan, mut reactor, _output, _input) = fake_channel_with_reactor();

        chan.terminate().await;
        let r = reactor.run_once().await;
        assert!(matches!(r, Err(ReactorError::Shutdown)));

        // This "run" won't even start.
        let r = reactor.run().await;
        assert!(matches!(r, Err(Error::ChannelClosed)));
    }

    #[async_test]
    async fn new_circ_closed() {
        let mut rng = rand::thread_rng();
        let (chan, mut reactor, _output, _input) = fake_channel_with_reactor();

        let (pending, _circr) = chan.new_circ(&mut rng).await.unwrap();
        reactor.run_once().await.unwrap();

        let id = pending.peek_circid().await;

        {
            let mut circs = reactor.circs.lock().await;
            let ent = circs.get_mut(id);
            assert!(matches!(ent, Some(CircEnt::Opening(_, _))));
        }
        // Now drop the circuit; this should tell the reactor to
        // remove the circuit from the map and mark the entry
        // destroy-sent.
        drop(pending);

        reactor.run_once().await.unwrap();
        {
            let mut circs = reactor.circs.lock().await;
            let ent = circs.get_mut(id);
            assert!(matches!(ent, Some(CircEnt::DestroySent(_))));
        }
    }

    // Try incoming cells that shouldn't arrive on channels.
    #[async_test]
    async fn bad_cells() {
        use futures::sink::SinkExt;
        let (_chan, mut reactor, _output, mut input) = fake_channel_with_reactor();

        // We shouldn't get create cells on a client channel, ever.
        let create_cell = msg::Create2::new(2, *b"hihi").into();
        input
            .send(Ok(ChanCell::new(9.into(), create_cell)))
            .await
            .unwrap();

        let e = reactor.run_once().await.unwrap_err().unwrap_err();
        assert_eq!(
            format!("{}", e),
            "channel protocol violation: CREATE2 cell on client channel"
        );

        // Can't get handshaking cells while channel is open.
        let versions_cell = msg::Versions::new([3]).unwrap().into();
        input
            .send(Ok(ChanCell::new(0.into(), versions_cell)))
            .await
            .unwrap();
        let e = reactor.run_once().await.unwrap_err().unwrap_err();
        assert_eq!(
            format!("{}", e),
            "channel protocol violation: VERSIONS cell after handshake is done"
        );
    }

    // A relay cell on an unknown circuit provokes one DESTROY, then
    // silence.
    #[async_test]
    async fn unknown_circ_destroyed_once() {
        use futures::sink::SinkExt;
        use futures::stream::StreamExt;
        let (_chan, mut reactor, mut output, mut input) = fake_channel_with_reactor();

        let relay_cell = msg::Relay::new(b"junk").into();
        input
            .send(Ok(ChanCell::new(4.into(), relay_cell)))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();

        // We sent exactly one DESTROY with reason NONE.
        let cell = output.next().await.unwrap();
        assert_eq!(cell.circid(), 4.into());
        match cell.msg() {
            ChanMsg::Destroy(d) => assert_eq!(d.reason(), DestroyReason::NONE),
            other => panic!("expected destroy, got {:?}", other),
        }

        // A second cell on the same dead circuit is swallowed without
        // another DESTROY.
        let relay_cell = msg::Relay::new(b"more junk").into();
        input
            .send(Ok(ChanCell::new(4.into(), relay_cell)))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();
        assert!(output.try_next().is_err()); // i.e., nothing ready
    }

    // Destroying a nonexistent circuit is a protocol violation.
    #[async_test]
    async fn destroy_unknown() {
        use futures::sink::SinkExt;
        let (_chan, mut reactor, _output, mut input) = fake_channel_with_reactor();

        let destroy_cell = msg::Destroy::new(DestroyReason::NONE).into();
        input
            .send(Ok(ChanCell::new(5.into(), destroy_cell)))
            .await
            .unwrap();
        let e = reactor.run_once().await.unwrap_err().unwrap_err();
        assert_eq!(
            format!("{}", e),
            "channel protocol violation: Destroy for nonexistent circuit"
        );
    }
}

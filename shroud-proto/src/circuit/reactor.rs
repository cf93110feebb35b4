//! Code to handle incoming cells on an origin circuit.
//!
//! The role of this code is to run in a separate asynchronous task,
//! decrypt and route every cell that the circuit's channel delivers,
//! and keep the inbound flow-control windows honest.

use super::streammap::{ShouldSendEnd, StreamEnt, StreamMap};
use crate::circuit::celltypes::ClientCircChanMsg;
use crate::circuit::sendme;
use crate::circuit::ClientCirc;
use crate::crypto::cell::{HopNum, InboundClientCrypt, InboundClientLayer};
use crate::util::err::ReactorError;
use crate::{Error, Result};
use shroud_cell::chancell::msg::Relay;
use shroud_cell::relaycell::msg::{End, RelayMsg, Sendme};
use shroud_cell::relaycell::{RelayCell, StreamId};

use futures::channel::{mpsc, oneshot};
use futures::select_biased;
use futures::sink::SinkExt;
use futures::stream::{self, StreamExt};

use std::sync::Weak;

use tracing::trace;

/// A message telling the circuit reactor to do something.
pub(crate) enum CtrlMsg {
    /// Shut down the reactor.
    Shutdown,
    /// Register a new one-shot receiver that can send a CtrlMsg to
    /// the reactor.
    ///
    /// (We can't just let everyone use the mpsc control stream, since
    /// that would require every sender to be able to `.await`; drop
    /// handlers can't.  One-shot senders fire synchronously.)
    Register(oneshot::Receiver<CtrlMsg>),
    /// Tell the reactor about a new stream: it should allocate an ID
    /// for it on the given hop and store its sink and windows.
    AddStream(
        HopNum,
        mpsc::Sender<RelayMsg>,
        sendme::StreamSendWindow,
        oneshot::Sender<Result<StreamId>>,
    ),
    /// Tell the reactor about a new hop: it should store the inbound
    /// state and crypto layer, then acknowledge.
    AddHop(
        InboundHop,
        Box<dyn InboundClientLayer + Send>,
        oneshot::Sender<()>,
    ),
    /// Tell the reactor that a given stream has gone away.
    CloseStream(HopNum, StreamId),
}

impl std::fmt::Debug for CtrlMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CtrlMsg::*;
        match self {
            Shutdown => write!(f, "Shutdown"),
            Register(_) => write!(f, "Register(..)"),
            AddStream(h, _, _, _) => write!(f, "AddStream({}, ..)", h),
            AddHop(_, _, _) => write!(f, "AddHop(..)"),
            CloseStream(h, id) => write!(f, "CloseStream({}, {})", h, id),
        }
    }
}

/// Type returned by a oneshot channel for a CtrlMsg.  For
/// convenience, we also use this as the type of the control mpsc
/// stream, so we can join them.
pub(crate) type CtrlResult = std::result::Result<CtrlMsg, oneshot::Canceled>;

/// A stream of oneshot CtrlMsg receivers, multiplexed together.
type OneshotStream = stream::SelectAll<stream::Once<oneshot::Receiver<CtrlMsg>>>;

/// The receiver-side state for one hop of an origin circuit: its
/// stream map and its circuit-level deliver window.
pub(crate) struct InboundHop {
    /// Map from stream IDs to stream state.
    map: StreamMap,
    /// Window tracking how many more cells we'll accept from this hop
    /// before it owes us a SENDME exchange.
    recvwindow: sendme::CircRecvWindow,
}

impl InboundHop {
    /// Create a new, empty hop.
    pub(crate) fn new() -> Self {
        InboundHop {
            map: StreamMap::new(),
            recvwindow: sendme::CircRecvWindow::new(1000),
        }
    }
}

/// Object to handle incoming cells and messages on a circuit.
///
/// This type is returned when you build a circuit; you need to spawn
/// a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the circuit won't work."]
pub struct Reactor {
    /// A stream of oneshot receivers that tell this reactor about
    /// things it needs to handle, like closed streams.
    control: stream::Fuse<stream::Select<mpsc::Receiver<CtrlResult>, OneshotStream>>,
    /// Input stream, on which we receive cells from this circuit's
    /// channel.
    input: stream::Fuse<mpsc::Receiver<ClientCircChanMsg>>,
    /// The main implementation of the reactor.
    core: ReactorCore,
}

/// The cell-handling core of the reactor, separated out so the select
/// loop and the handlers can borrow different pieces of state.
struct ReactorCore {
    /// Reference to the circuit.  Weak, so that dropping every
    /// user-facing handle tears the circuit down.
    circuit: Weak<ClientCirc>,
    /// The cryptographic state for decrypting inbound cells.
    crypto_in: InboundClientCrypt,
    /// Receiver-side state for each hop.
    hops: Vec<InboundHop>,
    /// Logging identifier.
    unique_id: super::UniqId,
}

impl Reactor {
    /// Construct a new Reactor.
    pub(super) fn new(
        circuit: &std::sync::Arc<ClientCirc>,
        control: mpsc::Receiver<CtrlResult>,
        closeflag: oneshot::Receiver<CtrlMsg>,
        input: mpsc::Receiver<ClientCircChanMsg>,
        unique_id: super::UniqId,
    ) -> Self {
        let core = ReactorCore {
            circuit: std::sync::Arc::downgrade(circuit),
            crypto_in: InboundClientCrypt::new(),
            hops: Vec::new(),
            unique_id,
        };

        let mut oneshots = stream::SelectAll::new();
        oneshots.push(stream::once(closeflag));
        let control = stream::select(control, oneshots);
        Reactor {
            input: input.fuse(),
            control: control.fuse(),
            core,
        }
    }

    /// Launch the reactor, and run until the circuit closes or we
    /// encounter an error.
    pub async fn run(mut self) -> Result<()> {
        trace!("{}: Running circuit reactor", self.core.unique_id);
        let result = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        trace!(
            "{}: Circuit reactor stopped: {:?}",
            self.core.unique_id,
            result
        );
        // However we exited, the circuit is now unusable.
        self.propagate_close().await;
        result
    }

    /// Handle one incoming message or control request.
    pub(crate) async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        let item = select_biased! {
            // Got a control message!
            ctrl = self.control.next() => {
                match ctrl {
                    Some(Ok(CtrlMsg::Shutdown)) => return Err(ReactorError::Shutdown),
                    Some(Ok(msg)) => {
                        self.handle_control(msg).await?;
                        return Ok(());
                    }
                    Some(Err(_)) => return Ok(()), // sender cancelled; ignore.
                    None => return Err(ReactorError::Shutdown),
                }
            }
            // We got a message on our channel, or it closed.
            item = self.input.next() => item,
        };
        let item = match item {
            // The channel has gone away: every circuit on it is dead.
            None => {
                self.propagate_close().await;
                return Err(ReactorError::Err(Error::ChannelClosed));
            }
            Some(r) => r,
        };

        let exit = self.core.handle_cell(item).await?;
        if exit {
            return Err(ReactorError::Shutdown);
        }
        Ok(())
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        trace!("{}: reactor received {:?}", self.core.unique_id, msg);
        match msg {
            CtrlMsg::Shutdown => (), // was handled in the reactor loop.
            CtrlMsg::Register(ch) => self.register(ch),
            CtrlMsg::AddStream(hop, sink, window, sender) => {
                let id = self.core.add_stream(hop, sink, window);
                // If the requester went away, no harm done.
                let _ = sender.send(id);
            }
            CtrlMsg::AddHop(hop, layer, sender) => {
                self.core.hops.push(hop);
                self.core.crypto_in.add_layer(layer);
                let _ = sender.send(());
            }
            CtrlMsg::CloseStream(hop, id) => self.core.close_stream(hop, id).await?,
        }
        Ok(())
    }

    /// Ensure that we get a message on self.control when `ch` fires.
    fn register(&mut self, ch: oneshot::Receiver<CtrlMsg>) {
        let (_, select_all) = self.control.get_mut().get_mut();
        select_all.push(stream::once(ch));
    }

    /// Mark the circuit as closed, so that every pending operation on
    /// it fails.
    pub(crate) async fn propagate_close(&mut self) {
        if let Some(circ) = self.core.circuit.upgrade() {
            circ.terminate().await;
        }
    }
}

impl ReactorCore {
    /// Allocate a stream ID on `hopnum` and store the stream's sink
    /// and send window.
    fn add_stream(
        &mut self,
        hopnum: HopNum,
        sink: mpsc::Sender<RelayMsg>,
        window: sendme::StreamSendWindow,
    ) -> Result<StreamId> {
        let hop = self
            .hops
            .get_mut(Into::<usize>::into(hopnum))
            .ok_or(Error::NoSuchHop)?;
        let mut rng = rand::thread_rng();
        let recv_window = sendme::StreamRecvWindow::new(500);
        hop.map.add_ent(&mut rng, sink, window, recv_window)
    }

    /// Close the stream associated with `id` because the stream was
    /// dropped.
    ///
    /// If we have not already received an END cell on this stream,
    /// send one.
    async fn close_stream(&mut self, hopnum: HopNum, id: StreamId) -> Result<()> {
        let hop = match self.hops.get_mut(Into::<usize>::into(hopnum)) {
            Some(h) => h,
            None => return Ok(()), // the hop is gone; nothing to close.
        };
        let should_send_end = hop.map.terminate(id)?;
        if should_send_end == ShouldSendEnd::Send {
            let end_cell = RelayCell::new(id, End::new_misc().into());
            if let Some(circ) = self.circuit.upgrade() {
                let mut c = circ.c.lock().await;
                c.send_relay_cell(hopnum, false, end_cell).await?;
            }
        }
        Ok(())
    }

    /// Helper: process a cell from the channel.
    ///
    /// Return true if we should exit.
    async fn handle_cell(&mut self, cell: ClientCircChanMsg) -> Result<bool> {
        use ClientCircChanMsg::*;
        match cell {
            Relay(r) => {
                self.handle_relay_cell(r).await?;
                Ok(false)
            }
            RelayEarly(_) => {
                // Only circuit-extension requests ride in RELAY_EARLY
                // cells, and those never travel towards the origin.
                Err(Error::CircProto(
                    "RELAY_EARLY cell sent towards circuit origin".into(),
                ))
            }
            Destroy(d) => {
                trace!(
                    "{}: circuit destroyed by peer (reason {})",
                    self.unique_id,
                    d.reason()
                );
                Ok(true)
            }
        }
    }

    /// React to a Relay cell.
    async fn handle_relay_cell(&mut self, cell: Relay) -> Result<()> {
        let mut body = cell.into_relay_body().into();

        // Decrypt the cell.  If it's recognized, then find the
        // corresponding hop.
        let (hopnum, tag) = self.crypto_in.decrypt(&mut body)?;
        // Make a copy of the authentication tag.
        let mut tag_copy = [0_u8; 20];
        tag_copy.copy_from_slice(tag);
        // Decode the cell.
        let msg = RelayCell::decode(body.into())?;

        // Decrement the circuit sendme windows, and see if we need to
        // send a sendme cell.
        let send_circ_sendme = if msg.counts_towards_circuit_windows() {
            let hop = self
                .hops
                .get_mut(Into::<usize>::into(hopnum))
                .ok_or_else(|| Error::CircProto("Cell from nonexistent hop!".into()))?;
            match hop.recvwindow.take() {
                Some(true) => true,
                Some(false) => false,
                None => {
                    return Err(Error::CircProto(
                        "received a cell when circuit sendme window was empty".into(),
                    ))
                }
            }
        } else {
            false
        };
        // If we do need to send a circuit-level SENDME cell, do so:
        // it echoes the tag of the cell that triggered it.
        if send_circ_sendme {
            let sendme = Sendme::new_tag(tag_copy);
            let cell = RelayCell::new(0.into(), sendme.into());
            if let Some(circ) = self.circuit.upgrade() {
                let mut c = circ.c.lock().await;
                c.send_relay_cell(hopnum, false, cell).await?;
            }
            self.hops[Into::<usize>::into(hopnum)].recvwindow.put();
        }

        // Break the message apart into its streamID and message.
        let (streamid, msg) = msg.into_streamid_and_msg();

        // If this cell wants/refuses to have a Stream ID, does it
        // have/not have one?
        if !msg.cmd().accepts_streamid_val(streamid) {
            return Err(Error::CircProto(format!(
                "Invalid stream ID {} for relay command {}",
                streamid,
                msg.cmd()
            )));
        }

        // If this has a stream ID of 0, it's a meta cell, not meant
        // for a particular stream.
        if streamid.is_zero() {
            let circ = match self.circuit.upgrade() {
                Some(c) => c,
                None => return Err(Error::CircuitClosed),
            };
            let mut c = circ.c.lock().await;
            return c.handle_meta_cell(hopnum, msg).await;
        }

        // It's for a stream.
        self.handle_stream_cell(hopnum, streamid, msg).await
    }

    /// Deliver (or account for) a message on a single stream.
    async fn handle_stream_cell(
        &mut self,
        hopnum: HopNum,
        streamid: StreamId,
        msg: RelayMsg,
    ) -> Result<()> {
        let hop = self
            .hops
            .get_mut(Into::<usize>::into(hopnum))
            .ok_or_else(|| Error::CircProto("Cell from nonexistent hop!".into()))?;

        /// What the stream entry wants done, computed without
        /// holding a borrow across the sends below.
        enum Action {
            /// Deliver the message to the stream's sink.
            Deliver,
            /// Deliver, and send a stream-level SENDME afterwards.
            DeliverAndSendme,
            /// The message was fully handled in place.
            Done,
        }

        let action = match hop.map.get_mut(streamid) {
            Some(StreamEnt::Open {
                send_window,
                recv_window,
                received_connected,
                ..
            }) => match &msg {
                RelayMsg::Sendme(_) => {
                    // We need to handle sendmes here, not in the
                    // stream's recv() method, or else we'd never
                    // notice them if the stream isn't reading.
                    send_window.put(Some(())).await.ok_or_else(|| {
                        Error::CircProto("Unexpected stream sendme".into())
                    })?;
                    Action::Done
                }
                RelayMsg::Data(_) => match recv_window.take() {
                    Some(true) => Action::DeliverAndSendme,
                    Some(false) => Action::Deliver,
                    None => {
                        return Err(Error::CircProto(
                            "Stream data exceeded the deliver window".into(),
                        ))
                    }
                },
                RelayMsg::Connected(_) => {
                    if *received_connected {
                        return Err(Error::CircProto(
                            "Received two CONNECTED cells on a stream".into(),
                        ));
                    }
                    *received_connected = true;
                    Action::Deliver
                }
                RelayMsg::End(_) => Action::Deliver,
                _ => Action::Deliver,
            },
            Some(StreamEnt::EndSent(half)) => {
                // We sent an END, so the stream is half closed; count
                // the message against the half-stream's windows.
                if matches!(msg, RelayMsg::End(_)) {
                    hop.map.end_received(streamid)?;
                } else {
                    half.handle_msg(&msg).await?;
                }
                return Ok(());
            }
            Some(StreamEnt::EndReceived) => {
                return Err(Error::CircProto(
                    "Received cell on stream after END".into(),
                ));
            }
            None => {
                // No stream wants this message; it could belong to a
                // stream that we tore down a long time ago.  Drop it.
                trace!(
                    "{}: dropped cell for unknown stream {}",
                    self.unique_id,
                    streamid
                );
                return Ok(());
            }
        };

        // Remember whether this was an END: the map entry must
        // reflect it once the message is delivered.
        let was_end = matches!(msg, RelayMsg::End(_));

        match action {
            Action::Done => Ok(()),
            deliver => {
                let sendme_due = matches!(deliver, Action::DeliverAndSendme);
                // Deliver the message to the stream object.  If the
                // stream object is gone, the close-stream control
                // message is on its way; dropping is correct.
                if let Some(StreamEnt::Open { sink, .. }) = hop.map.get_mut(streamid) {
                    let _ = sink.send(msg).await;
                }
                if was_end {
                    hop.map.end_received(streamid)?;
                }
                if sendme_due {
                    // Time to credit the peer with a stream-level
                    // SENDME.
                    let sendme_cell =
                        RelayCell::new(streamid, Sendme::new_empty().into());
                    if let Some(circ) = self.circuit.upgrade() {
                        let mut c = circ.c.lock().await;
                        c.send_relay_cell(hopnum, false, sendme_cell).await?;
                    }
                    if let Some(hop) = self.hops.get_mut(Into::<usize>::into(hopnum)) {
                        if let Some(StreamEnt::Open { recv_window, .. }) =
                            hop.map.get_mut(streamid)
                        {
                            recv_window.put();
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

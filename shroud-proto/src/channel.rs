//! Talking directly (over a TLS connection) to another relay on the
//! overlay.
//!
//! A channel is the authenticated cell pipe under every circuit.  To
//! get one as the initiator, launch a TLS connection and call
//! [`start_client_handshake`]; the handshake yields a [`Channel`]
//! plus a [`reactor::Reactor`] that must be run for the channel to
//! make progress.  Relays accepting connections use
//! [`handshake::ResponderHandshake`] instead.
//!
//! Outgoing cells pass through a per-channel
//! [scheduler](crate::scheduler): control cells first, then circuit
//! cells ordered by recent activity, padding last, all bounded by the
//! socket's write budget.

mod circmap;
pub(crate) mod codec;
pub mod handshake;
pub(crate) mod padding;
pub mod reactor;
mod unique_id;

use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::scheduler::{memquota::MemAccountant, CellScheduler, KistParams, NoSockStats, SockStats};
use crate::{Error, Result};
use shroud_cell::chancell::{msg, msg::ChanMsg, ChanCell, CircId};
use shroud_linkspec::ChanTarget;
use shroud_llcrypto::pk::ed25519::Ed25519Identity;
use shroud_llcrypto::pk::rsa::RsaIdentity;

use asynchronous_codec as futures_codec;
use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncWrite};
use futures::lock::Mutex;
use futures::sink::{Sink, SinkExt};
use futures::stream::Stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

pub use crate::channel::unique_id::UniqId;
pub use handshake::{OutboundClientHandshake, ResponderHandshake, UnverifiedChannel, VerifiedChannel};

/// Type alias: the cell-framed view of an underlying TLS stream.
pub(crate) type CellFrame<T> = futures_codec::Framed<T, codec::ChannelCodec>;

/// Type alias for the write end of a channel, with the transport
/// erased.
pub(crate) type BoxedChannelSink =
    Box<dyn Sink<ChanCell, Error = shroud_cell::Error> + Send + Unpin + 'static>;
/// Type alias for the read end of a channel, with the transport
/// erased.
pub(crate) type BoxedChannelStream = Box<
    dyn Stream<Item = std::result::Result<ChanCell, shroud_cell::Error>> + Send + Unpin + 'static,
>;

/// The verified identity of the relay on the other end of a channel.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Validated Ed25519 identity for the peer.
    pub(crate) ed25519_id: Ed25519Identity,
    /// Validated RSA identity for the peer.
    pub(crate) rsa_id: RsaIdentity,
}

impl PeerIdentity {
    /// Return the peer's Ed25519 identity.
    pub fn ed25519_id(&self) -> &Ed25519Identity {
        &self.ed25519_id
    }
    /// Return the peer's legacy RSA identity.
    pub fn rsa_id(&self) -> &RsaIdentity {
        &self.rsa_id
    }
}

/// Key type used to account this channel's queues against the global
/// memory ceiling: the channel's unique ID plus the circuit ID.
pub(crate) type QueueKey = (usize, u32);

/// An open channel, ready to send and receive cells.
pub struct Channel {
    /// The negotiated link protocol.
    link_protocol: u16,
    /// Set when this channel has closed or broken.
    closed: AtomicBool,
    /// A process-unique identifier for this channel, for logging and
    /// registry purposes.
    unique_id: UniqId,
    /// The identity of the peer, if it proved one.
    ///
    /// Inbound channels from clients have no identity: clients never
    /// authenticate.
    peer: Option<PeerIdentity>,
    /// When this channel was created.
    opened_at: Instant,
    /// The mutable state of the channel.
    inner: Mutex<ChannelImpl>,
    /// The circuit map, shared with the reactor.
    circmap: Arc<Mutex<circmap::CircMap>>,
}

/// Mutable interior of a Channel.
struct ChannelImpl {
    /// Copy of the owning channel's unique ID, for memory-accounting
    /// keys.
    chan_id: UniqId,
    /// The sink that leads to the TLS connection.
    sink: BoxedChannelSink,
    /// The outbound cell scheduler for this channel.
    sched: CellScheduler,
    /// Socket statistics used to bound writes.
    sock_stats: Box<dyn SockStats + Send>,
    /// Optional process-wide memory accountant for queued cells.
    mem: Option<Arc<std::sync::Mutex<MemAccountant<QueueKey>>>>,
    /// Stream used to send control messages to the reactor.
    control: mpsc::Sender<reactor::CtrlResult>,
    /// Oneshot that shuts the reactor down.
    sendclosed: Option<oneshot::Sender<reactor::CtrlMsg>>,
    /// Context for allocating logging IDs for our circuits.
    circ_unique_ids: unique_id::CircUniqIdContext,
    /// The padding timer for this channel.
    padding: padding::PaddingTimer,
}

impl Channel {
    /// Construct a channel and its reactor from its parts.
    ///
    /// `incoming` is Some on relay-side channels: circuit-creation
    /// requests from the peer are delivered there.  On client
    /// channels any CREATE* cell is a protocol violation.
    pub(crate) fn new(
        link_protocol: u16,
        sink: BoxedChannelSink,
        stream: BoxedChannelStream,
        unique_id: UniqId,
        peer: Option<PeerIdentity>,
        incoming: Option<mpsc::Sender<crate::relay::IncomingCircuit>>,
    ) -> (Arc<Channel>, reactor::Reactor) {
        use circmap::{CircIdRange, CircMap};
        // Initiators allocate from the high half of the ID space;
        // responders from the low half.  (Clients could use the whole
        // space, but staying in one half is never wrong.)
        let idrange = if incoming.is_some() {
            CircIdRange::Low
        } else {
            CircIdRange::High
        };
        let circmap = Arc::new(Mutex::new(CircMap::new(idrange, link_protocol >= 4)));

        let (sendclosed, recvclosed) = oneshot::channel::<reactor::CtrlMsg>();
        let (sendctrl, recvctrl) = mpsc::channel::<reactor::CtrlResult>(64);

        let inner = ChannelImpl {
            chan_id: unique_id,
            sink,
            sched: CellScheduler::new(KistParams::default()),
            sock_stats: Box::new(NoSockStats),
            mem: None,
            control: sendctrl,
            sendclosed: Some(sendclosed),
            circ_unique_ids: unique_id::CircUniqIdContext::new(),
            padding: padding::PaddingTimer::new(padding::PaddingParams::default()),
        };

        let channel = Arc::new(Channel {
            link_protocol,
            closed: AtomicBool::new(false),
            unique_id,
            peer,
            opened_at: Instant::now(),
            inner: Mutex::new(inner),
            circmap: Arc::clone(&circmap),
        });

        let reactor = reactor::Reactor::new(&channel, circmap, recvctrl, recvclosed, stream, incoming);

        (channel, reactor)
    }

    /// Return the process-unique identifier for this channel.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return the negotiated link protocol for this channel.
    pub fn link_protocol(&self) -> u16 {
        self.link_protocol
    }

    /// Return the identity the peer proved during the handshake, if
    /// it proved one.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Return how long this channel has been open.
    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Return the number of live circuits on this channel.
    ///
    /// The idle-channel reaper closes channels that report zero here
    /// for too long.
    pub async fn n_circs(&self) -> usize {
        self.circmap.lock().await.n_open_circs()
    }

    /// Attach a process-wide memory accountant to this channel.
    ///
    /// Every queued cell is then charged against the shared ceiling.
    pub async fn set_mem_accountant(
        &self,
        mem: Arc<std::sync::Mutex<MemAccountant<QueueKey>>>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.mem = Some(mem);
    }

    /// Replace this channel's socket statistics provider.
    pub async fn set_sock_stats(&self, stats: Box<dyn SockStats + Send>) {
        let mut inner = self.inner.lock().await;
        inner.sock_stats = stats;
    }

    /// Replace this channel's scheduler parameters (the kernel
    /// write-queue depth target).
    pub async fn set_kist_params(&self, params: KistParams) {
        let mut inner = self.inner.lock().await;
        inner.sched.set_params(params);
    }

    /// Check whether a cell type is one we're allowed to send on an
    /// open channel.
    fn check_cell(&self, cell: &ChanCell) -> Result<()> {
        use msg::ChanMsg::*;
        let msg = cell.msg();
        match msg {
            Created(_) | Created2(_) | CreatedFast(_) => {
                // Only legal in direct response to a CREATE*, which
                // the relay machinery sends through send_response().
                Err(Error::ChanProto(format!(
                    "Can't send {} cell on open channel",
                    msg.cmd()
                )))
            }
            Certs(_) | Versions(_) | Authenticate(_) | Authorize(_) | AuthChallenge(_)
            | Netinfo(_) => Err(Error::ChanProto(format!(
                "Can't send {} cell after handshake is done",
                msg.cmd()
            ))),
            _ => Ok(()),
        }
    }

    /// Transmit a single cell on a channel.
    ///
    /// The cell is queued with the scheduler and as much queued
    /// traffic as the write budget allows is flushed immediately.
    pub async fn send_cell(&self, cell: ChanCell) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        self.check_cell(&cell)?;
        {
            use msg::ChanMsg::*;
            match cell.msg() {
                Relay(_) | Padding(_) | VPadding(_) => {} // too frequent to log.
                m => trace!("{}: Sending {} for {}", self.unique_id, m.cmd(), cell.circid()),
            }
        }

        let mut inner = self.inner.lock().await;
        inner.padding.note_traffic();
        inner.enqueue(cell);
        inner.flush_cells().await
    }

    /// Internal: transmit a CREATED* response during circuit setup on
    /// a responder-side channel.
    pub(crate) async fn send_response(&self, cell: ChanCell) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        let mut inner = self.inner.lock().await;
        inner.enqueue(cell);
        inner.flush_cells().await
    }

    /// Flush any queued cells that the write budget now allows.
    ///
    /// Called by the reactor when the socket drains.
    pub async fn flush_writable(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sched.tick();
        inner.flush_cells().await
    }

    /// Note the passage of `elapsed` time for the padding timer,
    /// queueing a PADDING cell if one is due.
    pub async fn note_elapsed(&self, elapsed: std::time::Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut rng = rand::thread_rng();
        if inner.padding.note_elapsed(elapsed, &mut rng) {
            let cell = ChanCell::new(0.into(), msg::Padding::new().into());
            inner.sched.push_padding(cell);
            inner.flush_cells().await?;
        }
        Ok(())
    }

    /// Check whether this channel's peer identity matches `target`;
    /// return an error if it doesn't.
    pub fn check_match<T: ChanTarget + ?Sized>(&self, target: &T) -> Result<()> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| Error::ChanProto("Peer never authenticated".into()))?;
        if &peer.ed25519_id != target.ed_identity() {
            return Err(Error::ChanProto("Peer ed25519 id not as expected".into()));
        }
        if &peer.rsa_id != target.rsa_identity() {
            return Err(Error::ChanProto("Peer RSA id not as expected".into()));
        }
        Ok(())
    }

    /// Return true if this channel is closing or closed.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark this channel as closed.  Called from the reactor on exit.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Shut down this channel and all of its circuits.
    ///
    /// This is an orderly local close: the reactor stops, and every
    /// circuit gets told that its channel is gone.
    pub async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if let Some(sender) = inner.sendclosed.take() {
            let _ = sender.send(reactor::CtrlMsg::Shutdown);
        }
    }

    /// Tell the reactor to close circuit `id` and send a DESTROY with
    /// the given reason.
    ///
    /// Used by the memory-pressure shedder and the operator surface.
    pub async fn close_circuit(&self, id: CircId, reason: msg::DestroyReason) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .control
            .send(Ok(reactor::CtrlMsg::CloseCircuit(id, reason)))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Return the total bytes of cells queued on this channel.
    pub async fn queued_bytes(&self) -> usize {
        self.inner.lock().await.sched.queued_bytes()
    }

    /// Open a new, unextended circuit on this channel.
    ///
    /// The circuit will not do anything until the returned
    /// [`crate::circuit::PendingClientCirc`] performs one of the
    /// CREATE handshakes, and a task runs the returned reactor.
    pub async fn new_circ<R: rand::Rng + rand::CryptoRng>(
        self: &Arc<Self>,
        rng: &mut R,
    ) -> Result<(
        crate::circuit::PendingClientCirc,
        crate::circuit::reactor::Reactor,
    )> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }

        // Make an mpsc channel for the circuit's inbound cells, and a
        // oneshot for its CREATED* response.
        let (circmsg_snd, circmsg_rcv) = mpsc::channel(128);
        let (created_snd, created_rcv) = oneshot::channel();

        let id = {
            let mut map = self.circmap.lock().await;
            map.add_opening_ent(rng, created_snd, circmsg_snd)?
        };

        let (circ_unique_id, destroy_handle) = {
            let mut inner = self.inner.lock().await;
            let circ_unique_id = inner.circ_unique_ids.next(self.unique_id);
            // When the circuit is dropped, this handle tells the
            // reactor to clean up and send a DESTROY.
            let (snd, rcv) = oneshot::channel();
            inner
                .control
                .send(Ok(reactor::CtrlMsg::Register(rcv)))
                .await
                .map_err(|_| Error::ChannelClosed)?;
            (circ_unique_id, CircDestroyHandle::new(id, snd))
        };

        trace!("{}: Allocated {} for {}", self.unique_id, id, circ_unique_id);

        Ok(crate::circuit::PendingClientCirc::new(
            id,
            Arc::clone(self),
            created_rcv,
            Some(destroy_handle),
            circmsg_rcv,
            circ_unique_id,
        ))
    }

    /// Allocate a raw circuit ID on this channel, for the "next"
    /// side of a forwarding circuit.
    ///
    /// Unlike [`Channel::new_circ`], this does not build a circuit
    /// object: the relay engine sends its own CREATE2 and handles the
    /// response itself.  Returns the allocated ID, the oneshot that
    /// will yield the CREATED* response, the stream of subsequent
    /// cells, and the handle whose drop triggers a DESTROY.
    pub(crate) async fn new_raw_circ<R: rand::Rng + rand::CryptoRng>(
        self: &Arc<Self>,
        rng: &mut R,
    ) -> Result<(
        CircId,
        oneshot::Receiver<CreateResponse>,
        mpsc::Receiver<ClientCircChanMsg>,
        CircDestroyHandle,
    )> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }
        let (circmsg_snd, circmsg_rcv) = mpsc::channel(128);
        let (created_snd, created_rcv) = oneshot::channel();

        let id = {
            let mut map = self.circmap.lock().await;
            map.add_opening_ent(rng, created_snd, circmsg_snd)?
        };

        let destroy_handle = {
            let mut inner = self.inner.lock().await;
            let (snd, rcv) = oneshot::channel();
            inner
                .control
                .send(Ok(reactor::CtrlMsg::Register(rcv)))
                .await
                .map_err(|_| Error::ChannelClosed)?;
            CircDestroyHandle::new(id, snd)
        };

        Ok((id, created_rcv, circmsg_rcv, destroy_handle))
    }

    /// Internal: remove a circuit entry and leave a destroy-sent
    /// placeholder behind.
    ///
    /// Returns true if the entry was live (so a DESTROY is owed to
    /// the peer), false if the circuit was already gone.
    pub(crate) async fn release_circ_id(&self, id: CircId) -> bool {
        let was_live = {
            let mut map = self.circmap.lock().await;
            // Allow the peer a full circuit window of straggler cells
            // before we call it a protocol violation.
            !matches!(
                map.destroy_sent(id, HalfCirc::new(3000)),
                Some(crate::channel::circmap::CircEnt::DestroySent(_)) | None
            )
        };
        let mut inner = self.inner.lock().await;
        inner.drop_circ_queue(id);
        was_live
    }
}

impl ChannelImpl {
    /// Queue one cell with the scheduler, accounting its memory.
    fn enqueue(&mut self, cell: ChanCell) {
        let circid = cell.circid();
        if circid.is_zero() {
            self.sched.push_control(cell);
        } else {
            let seq = self.sched.push_circ(circid, cell);
            if let Some(mem) = &self.mem {
                if let Ok(mut mem) = mem.lock() {
                    mem.note_queued(
                        (self.chan_id.as_usize(), circid.into()),
                        seq,
                        crate::scheduler::CELL_WIRE_LEN,
                    );
                }
            }
        }
    }

    /// Drop all queued cells for a circuit (it closed).
    fn drop_circ_queue(&mut self, circid: CircId) {
        self.sched.remove_circ(circid);
        if let Some(mem) = &self.mem {
            if let Ok(mut mem) = mem.lock() {
                mem.remove_queue(&(self.chan_id.as_usize(), circid.into()));
            }
        }
    }

    /// Write as many queued cells to the sink as the socket budget
    /// allows.
    async fn flush_cells(&mut self) -> Result<()> {
        let mut budget = self.sched.write_capacity(&*self.sock_stats);
        let mut wrote_any = false;
        while let Some(cell) = self.sched.pull(&mut budget) {
            let circid = cell.circid();
            self.sink.feed(cell).await.map_err(Error::CellErr)?;
            wrote_any = true;
            if !circid.is_zero() {
                if let Some(mem) = &self.mem {
                    if let Ok(mut mem) = mem.lock() {
                        let key = (self.chan_id.as_usize(), circid.into());
                        mem.note_sent(&key, crate::scheduler::CELL_WIRE_LEN);
                    }
                }
            }
        }
        if wrote_any {
            self.sink.flush().await.map_err(Error::CellErr)?;
        }
        Ok(())
    }
}

/// A handle that, when dropped, tells the channel reactor to send a
/// DESTROY cell and clean up a circuit.
pub(crate) struct CircDestroyHandle {
    /// The circuit ID to clean up.
    id: CircId,
    /// A oneshot sender wired to the channel reactor.
    sender: Option<oneshot::Sender<reactor::CtrlMsg>>,
}

impl CircDestroyHandle {
    /// Construct a new CircDestroyHandle.
    fn new(id: CircId, sender: oneshot::Sender<reactor::CtrlMsg>) -> Self {
        CircDestroyHandle {
            id,
            sender: Some(sender),
        }
    }

    /// Neutralize this handle: the circuit has already been cleaned
    /// up by some other path, so its drop should do nothing.
    pub(crate) fn disarm(&mut self) {
        self.sender = None;
    }
}

impl Drop for CircDestroyHandle {
    fn drop(&mut self) {
        if let Some(s) = self.sender.take() {
            let _ignore = s.send(reactor::CtrlMsg::CloseCircuit(
                self.id,
                msg::DestroyReason::NONE,
            ));
        }
    }
}

/// Launch a new client handshake over a TLS stream.
///
/// After calling this function, you'll need to call `connect()` on
/// the result to start the handshake.  If that succeeds, you'll have
/// authentication info from the relay: call `check()` on the result
/// to validate it against the expected peer.  Finally, to finish the
/// handshake, call `finish()` on the result of _that_.
pub fn start_client_handshake<T>(tls: T, target_addr: Option<std::net::SocketAddr>) -> OutboundClientHandshake<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    handshake::OutboundClientHandshake::new(tls, target_addr)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use shroud_cell::chancell::msg;

    /// Make a new fake channel for testing, along with the loose ends
    /// of the plumbing: a receiver for the cells the channel writes,
    /// and a sender for cells the reactor should see.
    pub(crate) fn fake_channel_with_reactor() -> (
        Arc<Channel>,
        reactor::Reactor,
        mpsc::Receiver<ChanCell>,
        mpsc::Sender<std::result::Result<ChanCell, shroud_cell::Error>>,
    ) {
        let (send1, recv1) = mpsc::channel(64);
        let (send2, recv2) = mpsc::channel(64);
        let unique_id = UniqId::new();
        let peer = PeerIdentity {
            ed25519_id: [0x1; 32].into(),
            rsa_id: [0x2; 20].into(),
        };
        let send1 = send1.sink_map_err(|_| {
            shroud_cell::Error::InternalError("cell queue closed".into())
        });
        let (chan, reactor) = Channel::new(
            4,
            Box::new(send1),
            Box::new(recv2),
            unique_id,
            Some(peer),
            None,
        );
        (chan, reactor, recv1, send2)
    }

    /// Make a fake channel, dropping the reactor-side plumbing.
    pub(crate) fn fake_channel() -> (Arc<Channel>, mpsc::Receiver<ChanCell>) {
        let (chan, _reactor, cells, _input) = fake_channel_with_reactor();
        (chan, cells)
    }

    #[futures_await_test::async_test]
    async fn send_and_check() {
        let (chan, mut cells) = fake_channel();

        let cell = ChanCell::new(7.into(), msg::Relay::new(&b"hello"[..]).into());
        chan.send_cell(cell).await.unwrap();

        use futures::stream::StreamExt;
        let got = cells.next().await.unwrap();
        assert_eq!(got.circid(), 7.into());
        assert!(matches!(got.msg(), ChanMsg::Relay(_)));

        // Cells that belong to the handshake are refused.
        let bad = ChanCell::new(0.into(), msg::Netinfo::for_client(None).into());
        assert!(matches!(
            chan.send_cell(bad).await,
            Err(Error::ChanProto(_))
        ));

        // A closed channel refuses everything.
        chan.terminate().await;
        let cell = ChanCell::new(7.into(), msg::Relay::new(&b"late"[..]).into());
        assert!(matches!(
            chan.send_cell(cell).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[futures_await_test::async_test]
    async fn identity_checking() {
        use shroud_linkspec::ChanTarget;
        let (chan, _cells) = fake_channel();

        struct Target {
            ed: Ed25519Identity,
            rsa: RsaIdentity,
        }
        impl ChanTarget for Target {
            fn addrs(&self) -> &[std::net::SocketAddr] {
                &[]
            }
            fn ed_identity(&self) -> &Ed25519Identity {
                &self.ed
            }
            fn rsa_identity(&self) -> &RsaIdentity {
                &self.rsa
            }
        }

        let good = Target {
            ed: [0x1; 32].into(),
            rsa: [0x2; 20].into(),
        };
        assert!(chan.check_match(&good).is_ok());

        let bad_ed = Target {
            ed: [0x9; 32].into(),
            rsa: [0x2; 20].into(),
        };
        assert!(chan.check_match(&bad_ed).is_err());

        let bad_rsa = Target {
            ed: [0x1; 32].into(),
            rsa: [0x9; 20].into(),
        };
        assert!(chan.check_match(&bad_rsa).is_err());
    }
}

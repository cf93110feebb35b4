//! Relay-side circuit handling: answering CREATE cells, forwarding
//! traffic between channels, and servicing streams as an exit.
//!
//! # Overview
//!
//! When a peer creates a circuit through us, the channel reactor
//! hands an [`IncomingCircuit`] to the [`RelayEngine`].  The engine
//! answers the handshake (running the expensive ntor arithmetic on
//! the [crypto pool](crate::CryptoPool)), and from then on drives one
//! forwarding-circuit state machine per circuit:
//!
//! * Cells arriving from the "previous" (client-ward) channel are
//!   decrypted by one layer.  If they become recognized, they are
//!   for us: circuit extension, stream requests, flow control.  If
//!   not, they are passed verbatim to the "next" channel.
//! * Cells arriving from the next channel get one layer of
//!   encryption added and travel toward the client.
//!
//! A relay holds exactly one layer of cryptographic state per
//! circuit: the decryption of an outbound cell *is* the removal of
//! our onion layer, so no extra work happens on the forward path.
//!
//! The exit role (BEGIN, RESOLVE, and the data pumps for open
//! streams) also lives here; the actual sockets and DNS requests go
//! through the traits in [`exit`].

pub mod exit;

use crate::channel::{Channel, CircDestroyHandle};
use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::sendme;
use crate::crypto::cell::{Onion1RelayCrypto, CryptInit, RelayCellBody, RelayCrypt};
use crate::crypto::handshake::ntor::{NtorHkdfKeyGenerator, NtorSecretKey, NtorServer};
use crate::crypto::handshake::{fast::CreateFastServer, ServerHandshake};
use crate::crypto::pool::{CryptoPool, CryptoToken};
use crate::{CoreConfig, Error, Result};

use shroud_cell::chancell::msg::{self as chanmsg, ChanMsg, DestroyReason};
use shroud_cell::chancell::{ChanCell, CircId};
use shroud_cell::relaycell::msg::{self as relaymsg, EndReason, RelayMsg};
use shroud_cell::relaycell::{RelayCell, StreamId};
use shroud_linkspec::LinkSpec;
use shroud_llcrypto::pk::curve25519::{PublicKey, StaticSecret};
use shroud_llcrypto::pk::rsa::RsaIdentity;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::select_biased;
use futures::stream::{FuturesUnordered, SelectAll, StreamExt};

use std::collections::HashMap;
use std::convert::TryInto;
use std::net::IpAddr;
use std::sync::Arc;

use rand::thread_rng;
use tracing::{debug, info, trace, warn};

use exit::{EdgeEvent, EdgeReader, ExitContext, PauseHandle};

/// The handshake material from a CREATE* cell.
pub(crate) enum CreateHandshake {
    /// A CREATE2 cell's contents.
    Create2(chanmsg::Create2),
    /// A CREATE_FAST cell's contents.
    CreateFast(chanmsg::CreateFast),
}

/// A request from a peer to create a circuit through this relay.
///
/// Produced by a relay-side channel reactor; consumed by the
/// [`RelayEngine`].
pub struct IncomingCircuit {
    /// The circuit ID the peer chose.
    pub(crate) circid: CircId,
    /// The handshake to answer.
    pub(crate) handshake: CreateHandshake,
    /// The channel the request came in on.
    pub(crate) channel: Arc<Channel>,
    /// Stream of this circuit's subsequent cells from that channel.
    pub(crate) cells: mpsc::Receiver<ClientCircChanMsg>,
}

/// The onion keys this relay can answer CREATE2 cells with.
pub struct OnionKeys {
    /// Our ntor keys.  More than one may be live during a key
    /// rotation.
    ntor: Vec<NtorSecretKey>,
}

impl OnionKeys {
    /// Construct an empty key set.
    pub fn new() -> Self {
        OnionKeys { ntor: Vec::new() }
    }

    /// Add an ntor onion key, given its 32-byte curve25519 secret and
    /// our RSA identity fingerprint.
    pub fn add_ntor(&mut self, secret: [u8; 32], rsa_id: RsaIdentity) {
        let sk = StaticSecret::from(secret);
        let pk = PublicKey::from(&sk);
        self.ntor.push(NtorSecretKey::new(sk, pk, rsa_id));
    }
}

impl Default for OnionKeys {
    fn default() -> Self {
        OnionKeys::new()
    }
}

/// Something that can produce a channel to the relay named by a set
/// of link specifiers: used to service EXTEND2 requests.
///
/// The channel manager implements this; tests substitute fakes.
#[async_trait]
pub trait NextHopConnector: Send + Sync {
    /// Return an open channel to the given target, creating one if
    /// needed.
    async fn channel_for(&self, specs: &[LinkSpec]) -> Result<Arc<Channel>>;
}

/// Output of an answered CREATE2 handshake, as computed on the crypto
/// pool.
type CreateOutput = Result<(NtorHkdfKeyGenerator, Vec<u8>)>;

/// A circuit whose handshake answer is being computed on the pool.
struct PendingCreate {
    /// The circuit ID the peer chose.
    circid: CircId,
    /// The channel it arrived on.
    channel: Arc<Channel>,
    /// The circuit's cell stream, parked until the answer is ready.
    cells: Option<mpsc::Receiver<ClientCircChanMsg>>,
}

/// The engine driving every forwarding circuit on this relay.
///
/// Run [`RelayEngine::run`] in its own task; it owns all the circuit
/// state machines and multiplexes them internally.
pub struct RelayEngine {
    /// Our onion keys.
    keys: Arc<OnionKeys>,
    /// Incoming circuit-creation requests from the channel layer.
    incoming: mpsc::Receiver<IncomingCircuit>,
    /// The worker pool answering ntor handshakes.
    pool: CryptoPool<CreateOutput>,
    /// Completion queue from the pool.
    completions: mpsc::UnboundedReceiver<(CryptoToken, CreateOutput)>,
    /// Handshakes in flight on the pool.
    pending: HashMap<CryptoToken, PendingCreate>,
    /// Collaborators for the exit role.
    exit: ExitContext,
    /// How to reach next hops for EXTEND2.
    next_hops: Arc<dyn NextHopConnector>,
    /// Configuration snapshot.
    config: CoreConfig,
    /// The running forwarding-circuit futures.
    circuits: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl RelayEngine {
    /// Construct a new engine.
    ///
    /// Returns the sender that relay-side channels deliver
    /// circuit-creation requests to, along with the engine itself.
    pub fn new(
        config: CoreConfig,
        keys: OnionKeys,
        exit: ExitContext,
        next_hops: Arc<dyn NextHopConnector>,
        n_crypto_workers: usize,
    ) -> (mpsc::Sender<IncomingCircuit>, Self) {
        let (snd, rcv) = mpsc::channel(64);
        let (done_snd, done_rcv) = mpsc::unbounded();
        let pool = CryptoPool::new(n_crypto_workers, done_snd);
        let engine = RelayEngine {
            keys: Arc::new(keys),
            incoming: rcv,
            pool,
            completions: done_rcv,
            pending: HashMap::new(),
            exit,
            next_hops,
            config,
            circuits: FuturesUnordered::new(),
        };
        (snd, engine)
    }

    /// Run the engine until every channel that could produce circuits
    /// is gone.
    pub async fn run(mut self) -> Result<()> {
        loop {
            select_biased! {
                req = self.incoming.next() => {
                    match req {
                        Some(req) => self.handle_incoming(req).await?,
                        None => break,
                    }
                }
                done = self.completions.next() => {
                    match done {
                        Some((token, output)) => self.finish_create(token, output).await?,
                        None => break,
                    }
                }
                () = self.circuits.select_next_some() => {
                    // One circuit finished; nothing further to do.
                }
            }
        }
        Ok(())
    }

    /// Handle one freshly-arrived CREATE* request.
    async fn handle_incoming(&mut self, req: IncomingCircuit) -> Result<()> {
        let IncomingCircuit {
            circid,
            handshake,
            channel,
            cells,
        } = req;
        match handshake {
            CreateHandshake::CreateFast(cf) => {
                // CREATE_FAST is cheap enough to answer inline.
                let mut rng = thread_rng();
                match CreateFastServer::server(&mut rng, &[()], cf.body()) {
                    Ok((keygen, reply)) => {
                        let crypt = Onion1RelayCrypto::construct(keygen)?;
                        let cell =
                            ChanCell::new(circid, chanmsg::CreatedFast::new(reply).into());
                        channel.send_response(cell).await?;
                        self.launch_circuit(circid, channel, cells, crypt);
                    }
                    Err(_) => {
                        refuse_circ(&channel, circid, DestroyReason::PROTOCOL).await;
                    }
                }
            }
            CreateHandshake::Create2(c2) => {
                if c2.handshake_type() != 0x0002 {
                    // Not an ntor handshake; we can't answer it.
                    refuse_circ(&channel, circid, DestroyReason::PROTOCOL).await;
                    return Ok(());
                }
                // Queue the ntor computation on the pool; the reply
                // comes back through the completion queue.
                let keys = Arc::clone(&self.keys);
                let body: Vec<u8> = c2.body().into();
                let token = match self.pool.submit(move || {
                    let mut rng = thread_rng();
                    NtorServer::server(&mut rng, &keys.ntor[..], &body[..])
                }) {
                    Ok(token) => token,
                    Err(_) => {
                        // The pool is saturated: shed the circuit.
                        refuse_circ(&channel, circid, DestroyReason::RESOURCELIMIT).await;
                        return Ok(());
                    }
                };
                self.pending.insert(
                    token,
                    PendingCreate {
                        circid,
                        channel,
                        cells: Some(cells),
                    },
                );
            }
        }
        Ok(())
    }

    /// Handle a finished handshake computation from the pool.
    async fn finish_create(&mut self, token: CryptoToken, output: CreateOutput) -> Result<()> {
        let mut pending = match self.pending.remove(&token) {
            Some(p) => p,
            // The circuit was destroyed while its handshake was being
            // computed; the result is discarded on delivery.
            None => return Ok(()),
        };
        if pending.channel.is_closing() {
            return Ok(());
        }
        match output {
            Ok((keygen, reply)) => {
                let crypt = Onion1RelayCrypto::construct(keygen)?;
                let cell = ChanCell::new(pending.circid, chanmsg::Created2::new(reply).into());
                pending.channel.send_response(cell).await?;
                let cells = pending
                    .cells
                    .take()
                    .expect("pending create with no cell stream");
                self.launch_circuit(pending.circid, pending.channel, cells, crypt);
            }
            Err(_) => {
                info!(
                    "{}: refusing CREATE2 on {}: handshake failed",
                    pending.channel.unique_id(),
                    pending.circid
                );
                refuse_circ(&pending.channel, pending.circid, DestroyReason::PROTOCOL).await;
            }
        }
        Ok(())
    }

    /// Start the state machine for an accepted circuit.
    fn launch_circuit(
        &mut self,
        circid: CircId,
        channel: Arc<Channel>,
        cells: mpsc::Receiver<ClientCircChanMsg>,
        crypt: Onion1RelayCrypto,
    ) {
        debug!("{}: accepted new circuit {}", channel.unique_id(), circid);
        let circ = RelayCircuit {
            prev_channel: channel,
            prev_id: circid,
            prev_cells: cells,
            crypt: Box::new(crypt),
            next: None,
            extending: false,
            relay_early_seen: 0,
            relay_early_budget: self.config.relay_early_budget(),
            max_streams: self.config.max_streams_per_circuit(),
            sendme_version: self.config.sendme_emit_version(),
            deliver_window: sendme::CircRecvWindow::new(1000),
            package_window: sendme::CircSendWindow::new(1000),
            streams: HashMap::new(),
            edge_events: SelectAll::new(),
            setups: FuturesUnordered::new(),
            exit: self.exit.clone(),
            next_hops: Arc::clone(&self.next_hops),
        };
        self.circuits.push(circ.run().boxed());
    }
}

/// Send a DESTROY refusing a circuit, and release its ID.
async fn refuse_circ(channel: &Arc<Channel>, circid: CircId, reason: DestroyReason) {
    let _ = channel.close_circuit(circid, reason).await;
}

/// The "next" (away from the client) side of a forwarding circuit.
struct NextSide {
    /// The channel toward the next relay.
    channel: Arc<Channel>,
    /// Our circuit ID on that channel.
    id: CircId,
    /// Cells this circuit receives from the next relay.
    cells: mpsc::Receiver<ClientCircChanMsg>,
    /// Cleanup handle for the next-side circuit ID.
    destroy: CircDestroyHandle,
}

/// Exit-side state for one open stream.
struct ExitStream {
    /// Write half of the edge connection.
    writer: Box<dyn futures::io::AsyncWrite + Send + Unpin>,
    /// Read-stop control for the read half.
    pause: PauseHandle,
    /// Window for data we send toward the client.
    send_window: sendme::StreamSendWindow,
    /// Window for data the client sends to us.
    recv_window: sendme::StreamRecvWindow,
    /// Data from the edge connection parked while a window was
    /// empty.
    parked: Option<Vec<u8>>,
    /// True once we have sent an END for this stream.
    end_sent: bool,
    /// True once the client has sent an END for this stream.
    end_received: bool,
}

/// The outcome of an asynchronous BEGIN or RESOLVE setup.
enum SetupOutcome {
    /// A BEGIN finished: either a connection, or the reason we
    /// couldn't make one.
    Begin {
        /// Stream the outcome belongs to.
        id: StreamId,
        /// The connection and the address we reached, or an END
        /// reason.
        result: std::result::Result<(exit::EdgeConn, IpAddr), EndReason>,
    },
    /// A RESOLVE finished.
    Resolved {
        /// Stream the outcome belongs to.
        id: StreamId,
        /// The answer to relay back.
        answer: relaymsg::Resolved,
    },
}

/// Why the circuit loop stopped.
enum CloseCause {
    /// The previous channel told us to destroy the circuit.
    DestroyFromPrev,
    /// The previous channel itself went away.
    PrevChannelGone,
    /// A local error; destroy with this reason in both directions.
    Local(DestroyReason),
}

/// State machine for one forwarding circuit.
struct RelayCircuit {
    /// Channel on the client side.
    prev_channel: Arc<Channel>,
    /// Our circuit ID on the client side.
    prev_id: CircId,
    /// Cells from the client side.
    prev_cells: mpsc::Receiver<ClientCircChanMsg>,
    /// Our single layer of relay crypto.
    crypt: Box<dyn RelayCrypt + Send>,
    /// The next-hop side, if this circuit has been extended.
    next: Option<NextSide>,
    /// True while an EXTEND2 is being serviced.
    extending: bool,
    /// How many RELAY_EARLY cells this circuit has carried.
    relay_early_seen: u16,
    /// How many RELAY_EARLY cells we allow before declaring a
    /// protocol violation.
    relay_early_budget: u16,
    /// Cap on concurrent streams for the exit role.
    max_streams: usize,
    /// Which SENDME version we emit; version 1 carries the digest
    /// echo.
    sendme_version: u8,
    /// Window for DATA the client sends toward us (exit role).
    deliver_window: sendme::CircRecvWindow,
    /// Window for DATA we send toward the client (exit role).
    package_window: sendme::CircSendWindow,
    /// Exit streams, by the client-chosen stream ID.
    streams: HashMap<StreamId, ExitStream>,
    /// Read events from every open edge connection.
    edge_events: SelectAll<EdgeReader>,
    /// BEGIN/RESOLVE operations in flight.
    setups: FuturesUnordered<BoxFuture<'static, SetupOutcome>>,
    /// Exit collaborators.
    exit: ExitContext,
    /// How to reach next hops.
    next_hops: Arc<dyn NextHopConnector>,
}

impl RelayCircuit {
    /// Drive this circuit until it closes.
    async fn run(mut self) {
        /// The next thing the circuit has to react to.
        enum Event {
            /// A cell (or closure) from the client-side channel.
            Prev(Option<ClientCircChanMsg>),
            /// A cell (or closure) from the next-hop channel.
            Next(Option<ClientCircChanMsg>),
            /// A finished BEGIN or RESOLVE.
            Setup(SetupOutcome),
            /// A read event from an edge connection.
            Edge(EdgeEvent),
        }

        let cause = loop {
            // The next-side future has to be rebuilt each iteration,
            // and dropped before we handle the event, or it would
            // keep `self.next` borrowed.
            let event = {
                let next_fut = match self.next.as_mut() {
                    Some(n) => futures::future::Either::Left(n.cells.next()),
                    None => futures::future::Either::Right(futures::future::pending()),
                };
                select_biased! {
                    item = self.prev_cells.next() => Event::Prev(item),
                    item = next_fut.fuse() => Event::Next(item),
                    setup = self.setups.select_next_some() => Event::Setup(setup),
                    ev = self.edge_events.select_next_some() => Event::Edge(ev),
                }
            };
            let cause = match event {
                Event::Prev(None) => Some(CloseCause::PrevChannelGone),
                Event::Prev(Some(cell)) => self.handle_prev_cell(cell).await,
                Event::Next(None) => {
                    // The next channel went away under us.
                    self.drop_next_side(None).await;
                    self.send_truncated(DestroyReason::CHANNEL_CLOSED).await;
                    None
                }
                Event::Next(Some(cell)) => self.handle_next_cell(cell).await,
                Event::Setup(setup) => self.handle_setup(setup).await,
                Event::Edge(ev) => self.handle_edge_event(ev).await,
            };
            if let Some(cause) = cause {
                break cause;
            }
        };
        self.teardown(cause).await;
    }

    /// Tear the circuit down, propagating DESTROY as required.
    async fn teardown(mut self, cause: CloseCause) {
        trace!(
            "{}: circuit {} closing",
            self.prev_channel.unique_id(),
            self.prev_id
        );
        // Stop every edge connection.
        for (_, stream) in self.streams.iter_mut() {
            stream.pause.shutdown();
            let _ = stream.writer.close().await;
        }
        let (to_prev, to_next) = match cause {
            CloseCause::DestroyFromPrev => (None, Some(DestroyReason::DESTROYED)),
            CloseCause::PrevChannelGone => (None, Some(DestroyReason::CHANNEL_CLOSED)),
            CloseCause::Local(r) => (Some(r), Some(r)),
        };
        if let Some(reason) = to_prev {
            let _ = self.prev_channel.close_circuit(self.prev_id, reason).await;
        }
        if let Some(mut next) = self.next.take() {
            if let Some(reason) = to_next {
                let _ = next.channel.close_circuit(next.id, reason).await;
                next.destroy.disarm();
            }
        }
    }

    /// Drop the next side without sending anything further on it.
    ///
    /// If `reason` is provided, a DESTROY with that reason is sent
    /// first.
    async fn drop_next_side(&mut self, reason: Option<DestroyReason>) {
        if let Some(mut next) = self.next.take() {
            if let Some(reason) = reason {
                let _ = next.channel.close_circuit(next.id, reason).await;
                next.destroy.disarm();
            } else {
                // The next channel is already gone; don't bother it.
                next.destroy.disarm();
            }
        }
        self.extending = false;
    }

    /// Handle one cell from the client side.  Returns Some(cause) if
    /// the circuit should close.
    async fn handle_prev_cell(&mut self, cell: ClientCircChanMsg) -> Option<CloseCause> {
        let (relay, early) = match cell {
            ClientCircChanMsg::Destroy(_) => {
                return Some(CloseCause::DestroyFromPrev);
            }
            ClientCircChanMsg::Relay(r) => (r, false),
            ClientCircChanMsg::RelayEarly(r) => (r, true),
        };

        if early {
            self.relay_early_seen = self.relay_early_seen.saturating_add(1);
            if self.relay_early_seen > self.relay_early_budget {
                info!(
                    "{}: too many RELAY_EARLY cells on {}",
                    self.prev_channel.unique_id(),
                    self.prev_id
                );
                return Some(CloseCause::Local(DestroyReason::PROTOCOL));
            }
        }

        let mut body: RelayCellBody = relay.into_relay_body().into();
        let tag = match self.crypt.decrypt_outbound(&mut body) {
            Some(tag) => {
                let mut tag_copy = [0_u8; 20];
                tag_copy.copy_from_slice(tag);
                Some(tag_copy)
            }
            None => None,
        };

        match tag {
            None => {
                // Not ours: pass it along to the next hop, still
                // marked early if it arrived early.
                match &self.next {
                    Some(next) => {
                        let msg = chanmsg::Relay::from_raw(body.into());
                        let msg = if early { msg.into_early() } else { ChanMsg::Relay(msg) };
                        match next.channel.send_cell(ChanCell::new(next.id, msg)).await {
                            Ok(()) => None,
                            Err(_) => {
                                self.drop_next_side(None).await;
                                self.send_truncated(DestroyReason::CHANNEL_CLOSED).await;
                                None
                            }
                        }
                    }
                    None => {
                        // An unrecognized cell with nowhere to go.
                        Some(CloseCause::Local(DestroyReason::PROTOCOL))
                    }
                }
            }
            Some(tag) => match self.handle_recognized(body, early, tag).await {
                Ok(()) => None,
                Err(e) => {
                    info!(
                        "{}: closing circuit {}: {}",
                        self.prev_channel.unique_id(),
                        self.prev_id,
                        e
                    );
                    Some(CloseCause::Local(destroy_reason_for(&e)))
                }
            },
        }
    }

    /// Handle one cell from the next-hop side.
    async fn handle_next_cell(&mut self, cell: ClientCircChanMsg) -> Option<CloseCause> {
        match cell {
            ClientCircChanMsg::Destroy(d) => {
                // The rest of the path is gone; tell the client with
                // TRUNCATED and stay alive.
                self.drop_next_side(None).await;
                self.send_truncated(d.reason()).await;
                None
            }
            ClientCircChanMsg::Relay(r) => {
                // Inbound traffic gets our onion layer added, then
                // moves toward the client.
                let mut body: RelayCellBody = r.into_relay_body().into();
                self.crypt.encrypt_inbound(&mut body);
                let msg = chanmsg::Relay::from_raw(body.into());
                let cell = ChanCell::new(self.prev_id, ChanMsg::Relay(msg));
                match self.prev_channel.send_cell(cell).await {
                    Ok(()) => None,
                    Err(_) => Some(CloseCause::PrevChannelGone),
                }
            }
            ClientCircChanMsg::RelayEarly(_) => {
                // RELAY_EARLY may only flow away from the client.
                Some(CloseCause::Local(DestroyReason::PROTOCOL))
            }
        }
    }

    /// Handle a cell that was recognized as being addressed to us.
    async fn handle_recognized(
        &mut self,
        body: RelayCellBody,
        early: bool,
        tag: [u8; 20],
    ) -> Result<()> {
        let cell = RelayCell::decode(body.into())?;

        // Flow control, exit role: DATA from the client counts
        // against the deliver window.
        if cell.counts_towards_circuit_windows() {
            match self.deliver_window.take() {
                Some(true) => {
                    // Credit the client: echo the digest tag of this
                    // cell in an authenticated SENDME.  (Version 0
                    // SENDMEs, with no echo, exist only for peers
                    // that predate authentication.)
                    let sendme = if self.sendme_version >= 1 {
                        relaymsg::Sendme::new_tag(tag)
                    } else {
                        relaymsg::Sendme::new_empty()
                    };
                    self.send_to_client(0.into(), sendme.into()).await?;
                    self.deliver_window.put();
                }
                Some(false) => (),
                None => {
                    return Err(Error::CircProto(
                        "received a cell when circuit sendme window was empty".into(),
                    ));
                }
            }
        }

        let (streamid, msg) = cell.into_streamid_and_msg();
        if !msg.cmd().accepts_streamid_val(streamid) {
            return Err(Error::CircProto(format!(
                "Invalid stream ID {} for relay command {}",
                streamid,
                msg.cmd()
            )));
        }

        if streamid.is_zero() {
            self.handle_meta(msg, early).await
        } else {
            self.handle_stream_msg(streamid, msg).await
        }
    }

    /// Handle a recognized cell with stream ID zero.
    async fn handle_meta(&mut self, msg: RelayMsg, early: bool) -> Result<()> {
        match msg {
            RelayMsg::Extend2(e2) => self.handle_extend(e2, early).await,
            RelayMsg::Truncate => {
                self.drop_next_side(Some(DestroyReason::REQUESTED)).await;
                self.send_truncated(DestroyReason::REQUESTED).await;
                Ok(())
            }
            RelayMsg::Sendme(s) => {
                // The client acknowledges traffic we sent it.
                let tag: Option<sendme::CircTag> = match s.into_tag() {
                    Some(v) => Some((&v[..]).try_into()?),
                    None => None,
                };
                match self.package_window.put(tag).await {
                    Some(_) => {
                        self.resume_parked().await?;
                        Ok(())
                    }
                    None => Err(Error::CircProto("bad auth tag on circuit sendme".into())),
                }
            }
            RelayMsg::Drop => Ok(()),
            m => Err(Error::CircProto(format!(
                "Unexpected {} cell on relay circuit",
                m.cmd()
            ))),
        }
    }

    /// Handle an EXTEND2 request: become a non-terminal relay.
    async fn handle_extend(&mut self, e2: relaymsg::Extend2, early: bool) -> Result<()> {
        if !early {
            return Err(Error::CircProto(
                "EXTEND2 message not in a RELAY_EARLY cell".into(),
            ));
        }
        // A legitimately-built general circuit has delivered at most
        // three RELAY_EARLY cells to any single relay by the time that
        // relay sees an EXTEND2; more than that means somebody is
        // trying to build an overlong path through us.
        if self.relay_early_seen > 3 {
            return Err(Error::CircProto(
                "EXTEND2 message after the first three hops".into(),
            ));
        }
        if self.next.is_some() || self.extending {
            return Err(Error::CircProto(
                "EXTEND2 message on an already-extended circuit".into(),
            ));
        }
        self.extending = true;

        let outcome = self.extend_to(&e2).await;
        self.extending = false;
        match outcome {
            Ok((next, reply)) => {
                self.next = Some(next);
                let extended = relaymsg::Extended2::new(reply);
                self.send_to_client(0.into(), extended.into()).await
            }
            Err(reason) => {
                // The extension failed; tell the client the path was
                // cut short, and let it decide what to do.
                self.send_truncated(reason).await;
                Ok(())
            }
        }
    }

    /// Inner part of EXTEND2 handling: reach the next relay and
    /// create the onward circuit.
    async fn extend_to(
        &mut self,
        e2: &relaymsg::Extend2,
    ) -> std::result::Result<(NextSide, Vec<u8>), DestroyReason> {
        let channel = self
            .next_hops
            .channel_for(e2.linkspecs())
            .await
            .map_err(|_| DestroyReason::CONNECTFAILED)?;

        let mut rng = thread_rng();
        let (id, created_rcv, cells, destroy) = channel
            .new_raw_circ(&mut rng)
            .await
            .map_err(|_| DestroyReason::RESOURCELIMIT)?;

        let create = chanmsg::Create2::new(e2.handshake_type(), e2.handshake());
        channel
            .send_cell(ChanCell::new(id, create.into()))
            .await
            .map_err(|_| DestroyReason::CHANNEL_CLOSED)?;

        match created_rcv.await {
            Ok(CreateResponse::Created2(c2)) => Ok((
                NextSide {
                    channel,
                    id,
                    cells,
                    destroy,
                },
                c2.into_body(),
            )),
            Ok(CreateResponse::Destroy(d)) => Err(d.reason()),
            Ok(CreateResponse::CreatedFast(_)) => Err(DestroyReason::PROTOCOL),
            Err(_) => Err(DestroyReason::CHANNEL_CLOSED),
        }
    }

    /// Handle a recognized cell for a particular stream.
    async fn handle_stream_msg(&mut self, id: StreamId, msg: RelayMsg) -> Result<()> {
        match msg {
            RelayMsg::Begin(begin) => self.handle_begin(id, begin).await,
            RelayMsg::BeginDir => {
                // We are not a directory cache.
                self.send_end(id, EndReason::NOTDIRECTORY).await
            }
            RelayMsg::Resolve(resolve) => self.handle_resolve(id, resolve).await,
            RelayMsg::Data(data) => self.handle_stream_data(id, data).await,
            RelayMsg::End(_) => self.handle_stream_end(id).await,
            RelayMsg::Sendme(_) => {
                let stream = self
                    .streams
                    .get_mut(&id)
                    .ok_or_else(|| Error::CircProto("Sendme for unknown stream".into()))?;
                stream
                    .send_window
                    .put(Some(()))
                    .await
                    .ok_or_else(|| Error::CircProto("Unexpected stream sendme".into()))?;
                self.resume_one(id).await?;
                Ok(())
            }
            m => Err(Error::CircProto(format!(
                "Unexpected {} cell for exit stream",
                m.cmd()
            ))),
        }
    }

    /// Service a BEGIN request by launching the resolve+connect
    /// pipeline.
    async fn handle_begin(&mut self, id: StreamId, begin: relaymsg::Begin) -> Result<()> {
        if self.streams.contains_key(&id) {
            return Err(Error::CircProto("Peer reused a live stream ID".into()));
        }
        if self.streams.len() >= self.max_streams {
            return self.send_end(id, EndReason::RESOURCELIMIT).await;
        }
        let (host, port) = exit::parse_begin_target(&begin)?;
        let ipv4_ok = begin.ipv4_okay();
        let ipv6_ok = begin.ipv6_okay();
        let resolver = Arc::clone(&self.exit.resolver);
        let policy = Arc::clone(&self.exit.policy);
        let connector = Arc::clone(&self.exit.connector);

        self.setups.push(
            async move {
                let result = begin_setup(
                    &*resolver, &*policy, &*connector, &host, port, ipv4_ok, ipv6_ok,
                )
                .await;
                SetupOutcome::Begin { id, result }
            }
            .boxed(),
        );
        Ok(())
    }

    /// Service a RESOLVE request.
    async fn handle_resolve(&mut self, id: StreamId, resolve: relaymsg::Resolve) -> Result<()> {
        let query = String::from_utf8(resolve.query().to_vec())
            .map_err(|_| Error::StreamProto("Non-utf8 RESOLVE query".into()))?;
        let resolver = Arc::clone(&self.exit.resolver);
        self.setups.push(
            async move {
                let answer = resolve_setup(&*resolver, &query).await;
                SetupOutcome::Resolved { id, answer }
            }
            .boxed(),
        );
        Ok(())
    }

    /// Handle DATA from the client for an exit stream.
    async fn handle_stream_data(&mut self, id: StreamId, data: relaymsg::Data) -> Result<()> {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            // Data for a stream that's gone: maybe our END crossed it
            // on the wire.  Drop it.
            None => return Ok(()),
        };
        // Window accounting happens even on a half-closed stream.
        let sendme_due = match stream.recv_window.take() {
            Some(b) => b,
            None => {
                return Err(Error::CircProto(
                    "Stream data exceeded the deliver window".into(),
                ));
            }
        };
        if !stream.end_sent {
            if let Err(e) = stream.writer.write_all(data.as_ref()).await {
                let reason = exit::io_error_to_end_reason(&e);
                self.stream_cleanup(id).await;
                return self.send_end(id, reason).await;
            }
            // A flush per DATA message is wasteful for bulk traffic,
            // but keeps interactive traffic moving.
            let _ = stream.writer.flush().await;
        }
        if sendme_due {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.recv_window.put();
            }
            let sendme = relaymsg::Sendme::new_empty();
            self.send_to_client(id, sendme.into()).await?;
        }
        Ok(())
    }

    /// Handle END from the client for an exit stream.
    async fn handle_stream_end(&mut self, id: StreamId) -> Result<()> {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return Ok(()), // never opened, or already gone
        };
        stream.end_received = true;
        stream.pause.shutdown();
        let _ = stream.writer.close().await;
        if stream.end_sent {
            self.streams.remove(&id);
        }
        Ok(())
    }

    /// Handle the completion of a BEGIN or RESOLVE setup.
    async fn handle_setup(&mut self, outcome: SetupOutcome) -> Option<CloseCause> {
        let result = match outcome {
            SetupOutcome::Begin { id, result } => match result {
                Ok((conn, addr)) => {
                    let (read_half, write_half) = conn.split();
                    let pause = PauseHandle::new();
                    self.edge_events
                        .push(EdgeReader::new(id, Box::new(read_half), pause.clone()));
                    self.streams.insert(
                        id,
                        ExitStream {
                            writer: Box::new(write_half),
                            pause,
                            send_window: sendme::SendWindow::new(500),
                            recv_window: sendme::RecvWindow::new(500),
                            parked: None,
                            end_sent: false,
                            end_received: false,
                        },
                    );
                    let connected = relaymsg::Connected::new_with_addr(addr, 0);
                    self.send_to_client(id, connected.into()).await
                }
                Err(reason) => self.send_end(id, reason).await,
            },
            SetupOutcome::Resolved { id, answer } => {
                self.send_to_client(id, answer.into()).await
            }
        };
        match result {
            Ok(()) => None,
            Err(_) => Some(CloseCause::PrevChannelGone),
        }
    }

    /// Handle a read event from an edge connection.
    async fn handle_edge_event(&mut self, ev: EdgeEvent) -> Option<CloseCause> {
        let result = match ev {
            EdgeEvent::Data(id, bytes) => self.edge_data(id, bytes).await,
            EdgeEvent::Eof(id) => {
                self.stream_local_close(id, EndReason::DONE).await
            }
            EdgeEvent::IoError(id, reason) => self.stream_local_close(id, reason).await,
        };
        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "{}: circuit {} failed while relaying edge data: {}",
                    self.prev_channel.unique_id(),
                    self.prev_id,
                    e
                );
                Some(CloseCause::Local(destroy_reason_for(&e)))
            }
        }
    }

    /// Ship bytes from the edge connection toward the client,
    /// respecting both package windows.
    async fn edge_data(&mut self, id: StreamId, bytes: Vec<u8>) -> Result<()> {
        let circ_avail = self.package_window.try_take_check()?;
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return Ok(()), // stream already torn down
        };
        let stream_avail = stream.send_window.try_take_check()?;
        if !circ_avail || !stream_avail {
            // One of the windows is empty: park the data and
            // read-stop the edge connection until a SENDME arrives.
            stream.pause.pause();
            stream.parked = Some(bytes);
            return Ok(());
        }
        self.ship_data_to_client(id, bytes).await
    }

    /// Actually package one DATA message toward the client, taking
    /// from both windows.
    async fn ship_data_to_client(&mut self, id: StreamId, bytes: Vec<u8>) -> Result<()> {
        let data = relaymsg::Data::new(&bytes[..]);
        let cell = RelayCell::new(id, data.into());
        let mut body: RelayCellBody = cell
            .encode(&mut thread_rng())?
            .into();
        let tag = {
            let t = self.crypt.originate(&mut body);
            let mut tag = [0_u8; 20];
            tag.copy_from_slice(t);
            tag
        };
        self.crypt.encrypt_inbound(&mut body);

        // Take from both windows; the checks above make these
        // infallible in the happy path.
        let tag: sendme::CircTag = tag.into();
        if self.package_window.try_take(&tag)?.is_none() {
            return Err(Error::InternalError("package window underflow".into()));
        }
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.send_window.try_take(&())?.is_none() {
                return Err(Error::InternalError("stream window underflow".into()));
            }
        }

        let msg = chanmsg::Relay::from_raw(body.into());
        self.prev_channel
            .send_cell(ChanCell::new(self.prev_id, ChanMsg::Relay(msg)))
            .await
    }

    /// Close the local side of a stream (EOF or error from the edge),
    /// telling the client why.
    async fn stream_local_close(&mut self, id: StreamId, reason: EndReason) -> Result<()> {
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.end_sent {
                return Ok(());
            }
            stream.end_sent = true;
            if stream.end_received {
                self.streams.remove(&id);
            }
        } else {
            return Ok(());
        }
        self.send_end(id, reason).await
    }

    /// Remove all trace of a stream.
    async fn stream_cleanup(&mut self, id: StreamId) {
        if let Some(mut stream) = self.streams.remove(&id) {
            stream.pause.shutdown();
            let _ = stream.writer.close().await;
        }
    }

    /// After a window refill, try to flush parked data and resume
    /// paused readers.
    async fn resume_parked(&mut self) -> Result<()> {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.parked.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.resume_one(id).await?;
        }
        Ok(())
    }

    /// Try to flush one stream's parked data and resume its reader.
    async fn resume_one(&mut self, id: StreamId) -> Result<()> {
        let circ_avail = self.package_window.try_take_check()?;
        let (bytes, can_send) = match self.streams.get_mut(&id) {
            Some(s) => {
                if s.parked.is_none() {
                    return Ok(());
                }
                let stream_avail = s.send_window.try_take_check()?;
                if circ_avail && stream_avail {
                    (s.parked.take(), true)
                } else {
                    (None, false)
                }
            }
            None => return Ok(()),
        };
        if can_send {
            if let Some(bytes) = bytes {
                self.ship_data_to_client(id, bytes).await?;
            }
            if let Some(s) = self.streams.get_mut(&id) {
                s.pause.resume();
            }
        }
        Ok(())
    }

    /// Send a message toward the client on this circuit, adding our
    /// onion layer.
    async fn send_to_client(&mut self, streamid: StreamId, msg: RelayMsg) -> Result<()> {
        let cell = RelayCell::new(streamid, msg);
        let mut body: RelayCellBody = cell
            .encode(&mut thread_rng())?
            .into();
        let _tag = self.crypt.originate(&mut body);
        self.crypt.encrypt_inbound(&mut body);
        let msg = chanmsg::Relay::from_raw(body.into());
        self.prev_channel
            .send_cell(ChanCell::new(self.prev_id, ChanMsg::Relay(msg)))
            .await
    }

    /// Send an END for a stream toward the client.
    async fn send_end(&mut self, id: StreamId, reason: EndReason) -> Result<()> {
        self.send_to_client(id, relaymsg::End::new_with_reason(reason).into())
            .await
    }

    /// Send a TRUNCATED message toward the client.
    async fn send_truncated(&mut self, reason: DestroyReason) {
        let _ = self
            .send_to_client(0.into(), relaymsg::Truncated::new(reason).into())
            .await;
    }
}

/// Map an internal error onto the DESTROY reason we report for it.
fn destroy_reason_for(e: &Error) -> DestroyReason {
    match e {
        Error::CircProto(_) | Error::ChanProto(_) | Error::StreamProto(_) => {
            DestroyReason::PROTOCOL
        }
        Error::BytesErr(_) | Error::CellErr(_) => DestroyReason::PROTOCOL,
        Error::ResourceLimit(_) | Error::IdRangeFull => DestroyReason::RESOURCELIMIT,
        Error::ChannelClosed => DestroyReason::CHANNEL_CLOSED,
        Error::Timeout(_) => DestroyReason::TIMEOUT,
        _ => DestroyReason::INTERNAL,
    }
}

/// The resolve-then-check-then-connect pipeline for one BEGIN.
async fn begin_setup(
    resolver: &dyn exit::Resolver,
    policy: &dyn exit::ExitPolicy,
    connector: &dyn exit::EdgeConnector,
    host: &str,
    port: u16,
    ipv4_ok: bool,
    ipv6_ok: bool,
) -> std::result::Result<(exit::EdgeConn, IpAddr), EndReason> {
    // Figure out the candidate addresses.
    let addrs: Vec<IpAddr> = if let Ok(addr) = host.parse::<IpAddr>() {
        vec![addr]
    } else {
        match resolver.resolve(host).await {
            Ok(a) => a,
            Err(_) => return Err(EndReason::RESOLVEFAILED),
        }
    };
    let candidates: Vec<IpAddr> = addrs
        .into_iter()
        .filter(|a| match a {
            IpAddr::V4(_) => ipv4_ok,
            IpAddr::V6(_) => ipv6_ok,
        })
        .collect();
    if candidates.is_empty() {
        return Err(EndReason::RESOLVEFAILED);
    }

    // The exit policy gets the first say on every address.
    let mut allowed = candidates
        .iter()
        .filter(|a| policy.allow(a, port))
        .peekable();
    if allowed.peek().is_none() {
        return Err(EndReason::EXITPOLICY);
    }

    let mut last_err = EndReason::CONNECTREFUSED;
    for addr in allowed {
        match connector.connect(std::net::SocketAddr::new(*addr, port)).await {
            Ok(conn) => return Ok((conn, *addr)),
            Err(e) => {
                last_err = exit::io_error_to_end_reason(&e);
            }
        }
    }
    Err(last_err)
}

/// Answer a RESOLVE query.
async fn resolve_setup(resolver: &dyn exit::Resolver, query: &str) -> relaymsg::Resolved {
    /// Time-to-live we report for successful answers.
    const ANSWER_TTL: u32 = 300;

    if let Some(addr) = reverse_query_addr(query) {
        match resolver.reverse(&addr).await {
            Ok(names) => {
                let mut answer = relaymsg::Resolved::new_empty();
                for name in names {
                    answer.add_answer(
                        relaymsg::ResolvedVal::Hostname(name.into_bytes()),
                        ANSWER_TTL,
                    );
                }
                answer
            }
            Err(_) => relaymsg::Resolved::new_err(true, ANSWER_TTL),
        }
    } else {
        match resolver.resolve(query).await {
            Ok(addrs) => {
                let mut answer = relaymsg::Resolved::new_empty();
                for addr in addrs {
                    answer.add_answer(relaymsg::ResolvedVal::Ip(addr), ANSWER_TTL);
                }
                answer
            }
            Err(_) => relaymsg::Resolved::new_err(true, ANSWER_TTL),
        }
    }
}

/// If `query` is a reverse-lookup name like `4.3.2.1.in-addr.arpa`,
/// return the address it names.
fn reverse_query_addr(query: &str) -> Option<IpAddr> {
    let rest = query.strip_suffix(".in-addr.arpa")?;
    let mut octets: Vec<u8> = Vec::with_capacity(4);
    for part in rest.split('.') {
        octets.push(part.parse().ok()?);
    }
    if octets.len() != 4 {
        return None;
    }
    // The name lists the octets in reverse order.
    Some(IpAddr::V4(
        [octets[3], octets[2], octets[1], octets[0]].into(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reverse_names() {
        assert_eq!(
            reverse_query_addr("7.100.51.198.in-addr.arpa"),
            Some("198.51.100.7".parse().unwrap())
        );
        assert_eq!(reverse_query_addr("www.example.com"), None);
        assert_eq!(reverse_query_addr("1.2.3.in-addr.arpa"), None);
    }

    #[test]
    fn destroy_reasons() {
        assert_eq!(
            destroy_reason_for(&Error::CircProto("x".into())),
            DestroyReason::PROTOCOL
        );
        assert_eq!(
            destroy_reason_for(&Error::ResourceLimit("y")),
            DestroyReason::RESOURCELIMIT
        );
        assert_eq!(
            destroy_reason_for(&Error::BadHandshake),
            DestroyReason::INTERNAL
        );
    }
}

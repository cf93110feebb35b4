//! Manage a set of channels on the shroud overlay.
//!
//! A channel is a connection to another relay, direct via TLS.  Since
//! one channel can carry many circuits, it's important to reuse
//! channels when possible; the [ChanMgr] type implemented here does
//! that, and also owns the policies that operate on channels in bulk:
//! reaping idle channels, shedding circuits under memory pressure,
//! and answering the operator's "what channels exist" question.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::await_holding_lock)]

use shroud_cell::chancell::msg::DestroyReason;
use shroud_cell::chancell::CircId;
use shroud_linkspec::{ChanTarget, LinkSpec};
use shroud_llcrypto::pk::ed25519::Ed25519Identity;
use shroud_llcrypto::pk::rsa::RsaIdentity;
use shroud_proto::channel::Channel;

use futures::lock::Mutex;
use futures::task::{Spawn, SpawnExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info};

mod err;
pub mod transport;

pub use err::Error;
pub use transport::{CertifiedConn, Transport};

/// A Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A Type that remembers a set of live channels, and launches new
/// ones on request.
///
/// Use [ChanMgr::get_or_launch] to get a channel to a relay, reusing
/// an existing one when it can.
pub struct ChanMgr<TR> {
    /// Map from Ed25519 identity to channel state.
    ///
    /// Only canonical, initiator-side channels live here; inbound
    /// channels belong to the relay engine and are tracked only in
    /// `by_unique_id`.
    channels: Mutex<HashMap<Ed25519Identity, ChannelState>>,

    /// Every live channel we know about, by its process-unique ID.
    ///
    /// Used by the operator surface and the memory shedder.
    by_unique_id: Mutex<HashMap<usize, Weak<Channel>>>,

    /// Object used to launch channel reactors.
    spawn: Box<dyn Spawn + Send + Sync>,

    /// Object used to create TLS connections to relays.
    transport: TR,

    /// Shared queued-cell memory accounting, if a ceiling was
    /// configured.
    mem: Option<Arc<std::sync::Mutex<MemAccountantHandle>>>,
}

/// Alias for the accountant the proto layer exposes to us.
type MemAccountantHandle =
    shroud_proto::scheduler::memquota::MemAccountant<(usize, u32)>;

/// Possible states for a managed channel.
enum ChannelState {
    /// The channel is open and authenticated: we can give it out as
    /// needed.
    Open(Arc<Channel>),
    /// Some task is building the channel, and will notify all
    /// listeners on this event on success or failure.
    Building(Arc<event_listener::Event>),
}

/// Summary of one channel, as reported to the operator surface.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Process-unique identifier of the channel.
    pub unique_id: usize,
    /// Identity of the peer, if it authenticated.
    pub peer_ed25519: Option<Ed25519Identity>,
    /// How long the channel has been open.
    pub age: Duration,
    /// Number of live circuits on the channel.
    pub n_circs: usize,
}

impl<TR> ChanMgr<TR>
where
    TR: Transport + Send + Sync,
{
    /// Construct a new channel manager.  It will use `transport` to
    /// construct TLS streams, and `spawn` to launch reactor tasks.
    pub fn new<S>(transport: TR, spawn: S) -> Self
    where
        S: Spawn + Send + Sync + 'static,
    {
        ChanMgr {
            channels: Mutex::new(HashMap::new()),
            by_unique_id: Mutex::new(HashMap::new()),
            spawn: Box::new(spawn),
            transport,
            mem: None,
        }
    }

    /// Configure a process-wide ceiling for queued-cell memory.
    ///
    /// Every channel launched afterwards charges its queues against
    /// this ceiling; when the total crosses it, the circuit holding
    /// the oldest queued cell is closed with RESOURCELIMIT.
    pub fn set_queue_ceiling(&mut self, ceiling_bytes: usize) {
        self.mem = Some(Arc::new(std::sync::Mutex::new(MemAccountantHandle::new(
            ceiling_bytes,
        ))));
    }

    /// Helper: Return the channel if it matches the target; otherwise
    /// return an error.
    ///
    /// We need this check since it's possible in principle for a
    /// channel to match the Ed25519 key of the target but not the RSA
    /// key.
    fn check_chan_match<T: ChanTarget + ?Sized>(
        &self,
        target: &T,
        ch: Arc<Channel>,
    ) -> Result<Arc<Channel>> {
        ch.check_match(target).map_err(Error::Proto)?;
        Ok(ch)
    }

    /// Try to get a suitable channel to the provided `target`,
    /// launching one if one does not exist.
    ///
    /// If there is already a channel launch attempt in progress, this
    /// function will wait until that launch is complete, and succeed
    /// or fail depending on its outcome.
    pub async fn get_or_launch<T: ChanTarget + Sync + ?Sized>(
        &self,
        target: &T,
    ) -> Result<Arc<Channel>> {
        let ed_identity = target.ed_identity();
        use ChannelState::*;

        // Look up the current cache entry.
        let (should_launch, event) = {
            let mut channels = self.channels.lock().await;
            let state = channels.get(ed_identity);

            match state {
                Some(Open(ch)) => {
                    if ch.is_closing() {
                        let e = Arc::new(event_listener::Event::new());
                        let state = Building(Arc::clone(&e));
                        channels.insert(*ed_identity, state);
                        (true, e)
                    } else {
                        return self.check_chan_match(target, Arc::clone(ch));
                    }
                }
                Some(Building(e)) => (false, Arc::clone(e)),
                None => {
                    let e = Arc::new(event_listener::Event::new());
                    let state = Building(Arc::clone(&e));
                    channels.insert(*ed_identity, state);
                    (true, e)
                }
            }
        };

        if should_launch {
            let result = self.build_channel(target).await;
            {
                let mut channels = self.channels.lock().await;
                match &result {
                    Ok(ch) => {
                        channels.insert(*ed_identity, Open(Arc::clone(ch)));
                    }
                    Err(_) => {
                        channels.remove(ed_identity);
                    }
                }
            }
            event.notify(usize::MAX);
            result
        } else {
            event.listen().await;
            let chan = self
                .get_nowait_by_ed_id(ed_identity)
                .await
                .ok_or(Error::PendingFailed)?;
            self.check_chan_match(target, chan)
        }
    }

    /// Helper: construct a new channel for a target, handshaking and
    /// spawning its reactor.
    async fn build_channel<T: ChanTarget + Sync + ?Sized>(
        &self,
        target: &T,
    ) -> Result<Arc<Channel>> {
        use shroud_proto::channel::start_client_handshake;

        let (addr, tls) = self.transport.connect(target).await?;
        let peer_cert = tls.peer_certificate()?.ok_or(Error::MissingCert)?;

        debug!("negotiating link handshake with {}", addr);
        let hs = start_client_handshake(tls, Some(addr));
        let unverified = hs.connect().await?;
        let verified = unverified.check(target, &peer_cert, None)?;
        let (chan, reactor) = verified.finish().await?;

        if let Some(mem) = &self.mem {
            chan.set_mem_accountant(Arc::clone(mem)).await;
        }
        {
            let mut by_id = self.by_unique_id.lock().await;
            by_id.insert(chan.unique_id().as_usize(), Arc::downgrade(&chan));
        }

        self.spawn
            .spawn(async {
                let _ = reactor.run().await;
            })
            .map_err(|e| Error::Internal(format!("spawn failed: {}", e)))?;
        Ok(chan)
    }

    /// Helper: return the open channel for `ed_id`, if there is one.
    async fn get_nowait_by_ed_id(&self, ed_id: &Ed25519Identity) -> Option<Arc<Channel>> {
        use ChannelState::*;
        let channels = self.channels.lock().await;
        match channels.get(ed_id) {
            Some(Open(ch)) if !ch.is_closing() => Some(Arc::clone(ch)),
            _ => None,
        }
    }

    /// Register a channel that was built elsewhere (an inbound,
    /// relay-side channel), so the operator surface and the memory
    /// shedder can see it.
    pub async fn register_inbound(&self, chan: &Arc<Channel>) {
        if let Some(mem) = &self.mem {
            chan.set_mem_accountant(Arc::clone(mem)).await;
        }
        let mut by_id = self.by_unique_id.lock().await;
        by_id.insert(chan.unique_id().as_usize(), Arc::downgrade(chan));
    }

    /// Close every channel that has had no circuits for longer than
    /// `idle_timeout`.
    ///
    /// The caller should invoke this periodically; the manager has no
    /// timers of its own.  Returns how many channels were closed.
    pub async fn expire_idle_channels(&self, idle_timeout: Duration) -> usize {
        let mut victims = Vec::new();
        {
            let channels = self.channels.lock().await;
            for state in channels.values() {
                if let ChannelState::Open(ch) = state {
                    if !ch.is_closing() && ch.age() > idle_timeout && ch.n_circs().await == 0 {
                        victims.push(Arc::clone(ch));
                    }
                }
            }
        }
        let n = victims.len();
        for ch in victims {
            info!("{}: closing idle channel", ch.unique_id());
            ch.terminate().await;
        }
        self.sweep().await;
        n
    }

    /// Drop map entries for channels that are closed or gone.
    async fn sweep(&self) {
        {
            let mut channels = self.channels.lock().await;
            channels.retain(|_, state| match state {
                ChannelState::Open(ch) => !ch.is_closing(),
                ChannelState::Building(_) => true,
            });
        }
        let mut by_id = self.by_unique_id.lock().await;
        by_id.retain(|_, weak| weak.upgrade().map_or(false, |ch| !ch.is_closing()));
    }

    /// If queued-cell memory is over its ceiling, close the circuit
    /// holding the oldest queued cell.
    ///
    /// Call after periods of heavy queueing; returns true if a
    /// circuit was shed.
    pub async fn shed_memory_pressure(&self) -> Result<bool> {
        let victim = {
            let mem = match &self.mem {
                Some(m) => m,
                None => return Ok(false),
            };
            let mem = mem
                .lock()
                .map_err(|_| Error::Internal("memory accountant poisoned".into()))?;
            if !mem.over_ceiling() {
                return Ok(false);
            }
            match mem.victim() {
                Some(v) => v,
                None => return Ok(false),
            }
        };
        let (chan_id, circ_id) = victim;
        let chan = {
            let by_id = self.by_unique_id.lock().await;
            by_id.get(&chan_id).and_then(Weak::upgrade)
        };
        if let Some(chan) = chan {
            info!(
                "{}: shedding circuit {} for memory pressure",
                chan.unique_id(),
                circ_id
            );
            chan.close_circuit(CircId::from(circ_id), DestroyReason::RESOURCELIMIT)
                .await
                .map_err(Error::Proto)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Operator surface: describe every live channel.
    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let by_id = self.by_unique_id.lock().await;
        let mut out = Vec::new();
        for (id, weak) in by_id.iter() {
            if let Some(ch) = weak.upgrade() {
                if ch.is_closing() {
                    continue;
                }
                out.push(ChannelInfo {
                    unique_id: *id,
                    peer_ed25519: ch.peer_identity().map(|p| *p.ed25519_id()),
                    age: ch.age(),
                    n_circs: ch.n_circs().await,
                });
            }
        }
        out
    }
}

/// Summarized identity information about a target, so that we can
/// build channels toward link specifiers.
///
/// (This type exists because a trait method can't be generic over
/// ChanTarget and still be object-safe.)
pub struct TargetInfo {
    /// Addresses of the target.
    addrs: Vec<SocketAddr>,
    /// Ed25519 identity of the target.
    ed_identity: Ed25519Identity,
    /// RSA identity of the target.
    rsa_identity: RsaIdentity,
}

impl ChanTarget for TargetInfo {
    fn addrs(&self) -> &[SocketAddr] {
        &self.addrs[..]
    }
    fn ed_identity(&self) -> &Ed25519Identity {
        &self.ed_identity
    }
    fn rsa_identity(&self) -> &RsaIdentity {
        &self.rsa_identity
    }
}

impl TargetInfo {
    /// Construct a TargetInfo from a set of link specifiers, if they
    /// name a relay completely enough to connect to it.
    pub fn from_linkspecs(specs: &[LinkSpec]) -> Result<Self> {
        let mut addrs = Vec::new();
        let mut ed_identity = None;
        let mut rsa_identity = None;
        for spec in specs {
            match spec {
                LinkSpec::OrPort(ip, port) => addrs.push(SocketAddr::new(*ip, *port)),
                LinkSpec::Ed25519Id(ed) => ed_identity = Some(*ed),
                LinkSpec::RsaId(rsa) => rsa_identity = Some(*rsa),
                LinkSpec::Unrecognized(_, _) => (),
            }
        }
        match (addrs.is_empty(), ed_identity, rsa_identity) {
            (false, Some(ed_identity), Some(rsa_identity)) => Ok(TargetInfo {
                addrs,
                ed_identity,
                rsa_identity,
            }),
            _ => Err(Error::UnusableTarget),
        }
    }
}

#[async_trait::async_trait]
impl<TR> shroud_proto::relay::NextHopConnector for ChanMgr<TR>
where
    TR: Transport + Send + Sync,
{
    async fn channel_for(
        &self,
        specs: &[LinkSpec],
    ) -> shroud_proto::Result<Arc<Channel>> {
        let target = TargetInfo::from_linkspecs(specs)
            .map_err(|_| shroud_proto::Error::CircExtend("Unusable link specifiers"))?;
        self.get_or_launch(&target)
            .await
            .map_err(|e| shroud_proto::Error::InternalError(format!("channel launch failed: {}", e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_from_linkspecs() {
        let specs = vec![
            LinkSpec::OrPort("203.0.113.5".parse().unwrap(), 9001),
            LinkSpec::Ed25519Id([7; 32].into()),
            LinkSpec::RsaId([8; 20].into()),
        ];
        let t = TargetInfo::from_linkspecs(&specs).unwrap();
        assert_eq!(t.addrs().len(), 1);
        assert_eq!(t.ed_identity(), &Ed25519Identity::from([7; 32]));

        // Missing identity: unusable.
        let specs = vec![LinkSpec::OrPort("203.0.113.5".parse().unwrap(), 9001)];
        assert!(matches!(
            TargetInfo::from_linkspecs(&specs),
            Err(Error::UnusableTarget)
        ));
    }
}

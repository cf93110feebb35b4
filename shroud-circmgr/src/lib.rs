//! Track the circuits built by this node, learn how long circuit
//! construction should take, and expose the operator's view of them.
//!
//! The heavy lifting for circuits lives in `shroud-proto`; this crate
//! owns the process-wide registry that maps small stable handles to
//! live circuits.  Handles are generational slot-map keys, so a
//! handle to a closed circuit simply stops resolving: there is
//! nothing to dangle.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::await_holding_lock)]

pub mod timeouts;

use shroud_proto::circuit::ClientCirc;

use futures::lock::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

pub use timeouts::{BuildTimeEstimator, InMemoryTimeoutState, TimeoutStateHandle};

new_key_type! {
    /// A process-wide handle for one origin circuit.
    ///
    /// Handles are (index, generation) pairs: after a circuit is
    /// gone, its handle never resolves again, even if the slot is
    /// reused.
    pub struct CircHandle;
}

/// An error from the circuit manager.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The handle doesn't name a live circuit.
    #[error("no such circuit")]
    NoSuchCircuit,
    /// A problem storing or loading persisted state.
    #[error("timeout state error: {0}")]
    State(#[from] timeouts::TimeoutStateError),
}

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Summary of one circuit, as reported to the operator surface.
#[derive(Debug, Clone)]
pub struct CircuitInfo {
    /// The circuit's registry handle.
    pub handle: CircHandle,
    /// The circuit's logging identifier, as a string.
    pub unique_id: String,
    /// Whether the circuit has been closed.
    pub closed: bool,
}

/// The process-wide circuit registry and timeout learner.
pub struct CircMgr {
    /// Every live origin circuit, by handle.
    ///
    /// Weak references: the registry never keeps a circuit alive on
    /// its own.
    circuits: Mutex<SlotMap<CircHandle, Weak<ClientCirc>>>,
    /// The build-time estimator.
    timeouts: std::sync::Mutex<BuildTimeEstimator>,
    /// Persistence for the estimator, if configured.
    storage: Option<Box<dyn TimeoutStateHandle>>,
    /// Monotonically-increasing count of internal errors, surfaced to
    /// the operator instead of crashing.
    bug_count: std::sync::atomic::AtomicU64,
}

impl CircMgr {
    /// Create a new circuit manager.
    ///
    /// `initial_timeout` seeds the build-time estimator until it has
    /// learned from enough real circuits.
    pub fn new(initial_timeout: Duration) -> Self {
        CircMgr {
            circuits: Mutex::new(SlotMap::with_key()),
            timeouts: std::sync::Mutex::new(BuildTimeEstimator::new(initial_timeout)),
            storage: None,
            bug_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Attach persistent storage for the build-time distribution, and
    /// load any state it holds.
    pub fn with_storage(mut self, storage: Box<dyn TimeoutStateHandle>) -> Result<Self> {
        if let Some(blob) = storage.load()? {
            let mut est = self
                .timeouts
                .lock()
                .expect("timeout estimator lock poisoned");
            est.load(&blob)?;
            debug!("loaded build-time distribution: {} samples", est.n_samples());
        }
        self.storage = Some(storage);
        Ok(self)
    }

    /// Register a newly-built circuit; returns its handle.
    pub async fn register_circuit(&self, circ: &Arc<ClientCirc>) -> CircHandle {
        let mut map = self.circuits.lock().await;
        map.insert(Arc::downgrade(circ))
    }

    /// Look up a circuit by its handle.
    ///
    /// Returns None if the circuit is gone or was never registered.
    pub async fn global_find(&self, handle: CircHandle) -> Option<Arc<ClientCirc>> {
        let map = self.circuits.lock().await;
        map.get(handle).and_then(Weak::upgrade)
    }

    /// Operator surface: describe every registered circuit.
    pub async fn list_circuits(&self) -> Vec<CircuitInfo> {
        let map = self.circuits.lock().await;
        map.iter()
            .filter_map(|(handle, weak)| {
                weak.upgrade().map(|circ| CircuitInfo {
                    handle,
                    unique_id: circ.unique_id().to_string(),
                    closed: circ.is_closing(),
                })
            })
            .collect()
    }

    /// Operator surface: close one circuit by handle.
    pub async fn close_circuit(&self, handle: CircHandle) -> Result<()> {
        let circ = self
            .global_find(handle)
            .await
            .ok_or(Error::NoSuchCircuit)?;
        circ.terminate().await;
        Ok(())
    }

    /// Drop registry entries for circuits that no longer exist.
    pub async fn sweep(&self) {
        let mut map = self.circuits.lock().await;
        map.retain(|_, weak| weak.upgrade().is_some());
    }

    /// Record how long a circuit took to build.
    ///
    /// Call this even for circuits that were abandoned for passing
    /// the timeout, once their construction actually finishes: the
    /// estimator needs the true distribution.
    pub fn note_build_time(&self, how_long: Duration) {
        if let Ok(mut est) = self.timeouts.lock() {
            est.add_sample(how_long);
        } else {
            self.note_bug();
        }
    }

    /// Return the current circuit build timeout.
    pub fn build_timeout(&self) -> Duration {
        match self.timeouts.lock() {
            Ok(est) => est.timeout(),
            Err(_) => {
                self.note_bug();
                Duration::from_secs(60)
            }
        }
    }

    /// Write the current build-time distribution to storage, if
    /// storage is configured.
    pub fn flush_state(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            let blob = {
                let est = self
                    .timeouts
                    .lock()
                    .expect("timeout estimator lock poisoned");
                est.save()?
            };
            storage.store(&blob)?;
        }
        Ok(())
    }

    /// Count an internal error.
    fn note_bug(&self) {
        self.bug_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Operator surface: how many internal errors have been counted
    /// since startup.
    pub fn bug_count(&self) -> u64 {
        self.bug_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_learning_via_mgr() {
        let mgr = CircMgr::new(Duration::from_secs(60));
        assert_eq!(mgr.build_timeout(), Duration::from_secs(60));
        for _ in 0..200 {
            mgr.note_build_time(Duration::from_millis(400));
        }
        let t = mgr.build_timeout().as_millis();
        assert!((400..=410).contains(&t));
        assert_eq!(mgr.bug_count(), 0);
    }

    #[test]
    fn state_flush_and_reload() {
        let storage = Box::new(InMemoryTimeoutState::default());
        // Scope to drop the first manager before we reuse the
        // storage.
        let blob = {
            let mgr = CircMgr::new(Duration::from_secs(60))
                .with_storage(storage)
                .unwrap();
            for _ in 0..150 {
                mgr.note_build_time(Duration::from_millis(250));
            }
            mgr.flush_state().unwrap();
            match &mgr.storage {
                Some(st) => st.load().unwrap().unwrap(),
                None => panic!(),
            }
        };

        let storage2 = InMemoryTimeoutState::default();
        storage2.store(&blob).unwrap();
        let mgr2 = CircMgr::new(Duration::from_secs(60))
            .with_storage(Box::new(storage2))
            .unwrap();
        let t = mgr2.build_timeout().as_millis();
        assert!((250..=260).contains(&t));
    }
}

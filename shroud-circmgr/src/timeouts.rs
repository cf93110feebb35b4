//! Learning how long circuit construction should be allowed to take.
//!
//! We keep a histogram of observed circuit build times and declare a
//! timeout at a fixed quantile of the distribution.  Circuits that
//! pass the timeout get abandoned, but their eventual completion
//! times are still fed back into the histogram: otherwise a brief
//! network slowdown could ratchet the timeout down and never recover.
//!
//! The distribution is the only state the core persists: it survives
//! restart as an opaque blob through a [`TimeoutStateHandle`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Width of one histogram bin.
const BIN_WIDTH_MS: u64 = 10;

/// How many samples we need before trusting the learned value.
const MIN_SAMPLES: u64 = 100;

/// The quantile of the build-time distribution at which we place the
/// timeout.
const TIMEOUT_QUANTILE: f64 = 0.80;

/// Cap on stored samples; when we pass it, every bin count is halved
/// so that the distribution keeps tracking current conditions.
const MAX_SAMPLES: u64 = 20_000;

/// An estimator for circuit build timeouts.
pub struct BuildTimeEstimator {
    /// Histogram of build times: bin index to count.
    bins: BTreeMap<u32, u32>,
    /// Total number of samples in `bins`.
    total: u64,
    /// The value to use before we've learned anything.
    initial: Duration,
}

/// Serialized form of the estimator state.
///
/// This is the blob that goes through a [`TimeoutStateHandle`]; the
/// storage layer treats it as opaque.
#[derive(Serialize, Deserialize)]
struct TimeoutState {
    /// Bin width used when the state was written.
    bin_width_ms: u64,
    /// (bin index, count) pairs.
    bins: Vec<(u32, u32)>,
    /// Total sample count.
    total: u64,
}

impl BuildTimeEstimator {
    /// Create a new estimator with no samples, using `initial` as the
    /// timeout until enough samples arrive.
    pub fn new(initial: Duration) -> Self {
        BuildTimeEstimator {
            bins: BTreeMap::new(),
            total: 0,
            initial,
        }
    }

    /// Record one successful circuit build time.
    ///
    /// Call this for every completed build, even one that had already
    /// passed the timeout: the abandoned circuit's true build time is
    /// what keeps the estimate honest.
    pub fn add_sample(&mut self, how_long: Duration) {
        let ms = how_long.as_millis() as u64;
        let bin = (ms / BIN_WIDTH_MS) as u32;
        *self.bins.entry(bin).or_insert(0) += 1;
        self.total += 1;
        if self.total >= MAX_SAMPLES {
            self.decimate();
        }
    }

    /// Halve every bin, so old observations stop dominating.
    fn decimate(&mut self) {
        let mut total = 0_u64;
        self.bins = self
            .bins
            .iter()
            .filter_map(|(bin, count)| {
                let count = count / 2;
                if count == 0 {
                    None
                } else {
                    total += u64::from(count);
                    Some((*bin, count))
                }
            })
            .collect();
        self.total = total;
    }

    /// Return the number of recorded samples.
    pub fn n_samples(&self) -> u64 {
        self.total
    }

    /// Return the current build timeout.
    pub fn timeout(&self) -> Duration {
        if self.total < MIN_SAMPLES {
            return self.initial;
        }
        let threshold = (self.total as f64 * TIMEOUT_QUANTILE).ceil() as u64;
        let mut seen = 0_u64;
        for (bin, count) in self.bins.iter() {
            seen += u64::from(*count);
            if seen >= threshold {
                // Use the middle of the bin as its representative
                // value.
                let ms = u64::from(*bin) * BIN_WIDTH_MS + BIN_WIDTH_MS / 2;
                return Duration::from_millis(ms);
            }
        }
        // Unreachable while total > 0, but the initial value is a
        // safe answer.
        self.initial
    }

    /// Serialize this estimator's state to an opaque blob.
    pub fn save(&self) -> Result<Vec<u8>, TimeoutStateError> {
        let state = TimeoutState {
            bin_width_ms: BIN_WIDTH_MS,
            bins: self.bins.iter().map(|(b, c)| (*b, *c)).collect(),
            total: self.total,
        };
        serde_json::to_vec(&state).map_err(|e| TimeoutStateError::Encoding(e.to_string()))
    }

    /// Reload estimator state from a blob written by [`save`](Self::save).
    ///
    /// State written with a different bin width is discarded: the
    /// bins wouldn't line up.
    pub fn load(&mut self, blob: &[u8]) -> Result<(), TimeoutStateError> {
        let state: TimeoutState =
            serde_json::from_slice(blob).map_err(|e| TimeoutStateError::Encoding(e.to_string()))?;
        if state.bin_width_ms != BIN_WIDTH_MS {
            return Ok(());
        }
        self.bins = state.bins.into_iter().collect();
        self.total = state.total;
        Ok(())
    }
}

/// An error from encoding or decoding timeout state.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TimeoutStateError {
    /// The blob could not be encoded or decoded.
    #[error("bad timeout state encoding: {0}")]
    Encoding(String),
    /// The storage layer failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Storage for the build-time distribution.
///
/// The caller owns the actual persistence (a state file, a database,
/// whatever); the circuit manager only needs load and store of one
/// opaque blob.
pub trait TimeoutStateHandle: Send + Sync {
    /// Load the previously stored blob, if there is one.
    fn load(&self) -> Result<Option<Vec<u8>>, TimeoutStateError>;
    /// Store a new blob, replacing any previous one.
    fn store(&self, blob: &[u8]) -> Result<(), TimeoutStateError>;
}

/// A [`TimeoutStateHandle`] that keeps the blob in memory.
///
/// Suitable for tests and for callers that don't want persistence.
#[derive(Default)]
pub struct InMemoryTimeoutState {
    /// The stored blob.
    blob: std::sync::Mutex<Option<Vec<u8>>>,
}

impl TimeoutStateHandle for InMemoryTimeoutState {
    fn load(&self) -> Result<Option<Vec<u8>>, TimeoutStateError> {
        Ok(self
            .blob
            .lock()
            .map_err(|_| TimeoutStateError::Storage("poisoned".into()))?
            .clone())
    }
    fn store(&self, blob: &[u8]) -> Result<(), TimeoutStateError> {
        *self
            .blob
            .lock()
            .map_err(|_| TimeoutStateError::Storage("poisoned".into()))? = Some(blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uses_initial_until_trained() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        assert_eq!(est.timeout(), Duration::from_secs(60));
        for _ in 0..(MIN_SAMPLES - 1) {
            est.add_sample(Duration::from_millis(300));
        }
        assert_eq!(est.timeout(), Duration::from_secs(60));
        est.add_sample(Duration::from_millis(300));
        assert_ne!(est.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn learns_the_quantile() {
        use rand::Rng;
        // Feed the estimator 1000 samples uniform in [200, 1800] ms;
        // the learned timeout must be within 5% of the distribution's
        // 80th percentile (1480 ms).
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            est.add_sample(Duration::from_millis(rng.gen_range(200..=1800)));
        }
        let got = est.timeout().as_millis() as f64;
        let want = 1480.0;
        assert!(
            (got - want).abs() / want < 0.05,
            "timeout {} too far from {}",
            got,
            want
        );
    }

    #[test]
    fn state_round_trips() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        for i in 0..200 {
            est.add_sample(Duration::from_millis(100 + i));
        }
        let before = est.timeout();
        let blob = est.save().unwrap();

        let mut est2 = BuildTimeEstimator::new(Duration::from_secs(60));
        est2.load(&blob).unwrap();
        assert_eq!(est2.n_samples(), 200);
        assert_eq!(est2.timeout(), before);
    }

    #[test]
    fn decimation_bounds_history() {
        let mut est = BuildTimeEstimator::new(Duration::from_secs(60));
        for _ in 0..(MAX_SAMPLES + 10) {
            est.add_sample(Duration::from_millis(500));
        }
        assert!(est.n_samples() < MAX_SAMPLES);
        // The estimate survives decimation.
        let ms = est.timeout().as_millis();
        assert!((500..=510).contains(&ms));
    }
}

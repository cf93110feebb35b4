//! Channel-padding decisions.
//!
//! A channel may insert PADDING cells on its own schedule to make
//! idle links harder to distinguish from active ones.  The timing
//! logic lives here as a plain state machine: the caller tells it
//! about traffic and about the passage of time, and it says when a
//! padding cell is due.  Nothing here does I/O or owns a timer.
//!
//! Padding never blocks real cells (the scheduler gives it the lowest
//! priority) and never counts against any flow-control window.

use rand::Rng;
use std::time::Duration;

/// Parameters for the padding timer, negotiated with
/// PADDING_NEGOTIATE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PaddingParams {
    /// Whether padding is enabled at all.
    enabled: bool,
    /// Lower bound on the inter-cell timeout.
    low: Duration,
    /// Upper bound on the inter-cell timeout.
    high: Duration,
}

impl Default for PaddingParams {
    fn default() -> Self {
        PaddingParams {
            enabled: true,
            low: Duration::from_millis(1500),
            high: Duration::from_millis(9500),
        }
    }
}

impl PaddingParams {
    /// Build parameters from a PADDING_NEGOTIATE request.
    pub(crate) fn from_negotiation(start: bool, low_ms: u16, high_ms: u16) -> Self {
        PaddingParams {
            enabled: start,
            low: Duration::from_millis(low_ms.into()),
            high: Duration::from_millis(u64::from(high_ms).max(low_ms.into())),
        }
    }
}

/// State machine deciding when to send channel padding.
pub(crate) struct PaddingTimer {
    /// Current parameters.
    params: PaddingParams,
    /// Time since the last cell in either direction, as accumulated
    /// by `note_elapsed`.
    idle: Duration,
    /// The randomly-drawn timeout we are currently counting toward.
    deadline: Option<Duration>,
}

impl PaddingTimer {
    /// Create a new padding timer with the given parameters.
    pub(crate) fn new(params: PaddingParams) -> Self {
        PaddingTimer {
            params,
            idle: Duration::from_secs(0),
            deadline: None,
        }
    }

    /// Replace the parameters (from a PADDING_NEGOTIATE message).
    pub(crate) fn reconfigure(&mut self, params: PaddingParams) {
        self.params = params;
        self.deadline = None;
    }

    /// Note that a real cell was sent or received: real traffic
    /// resets the clock.
    pub(crate) fn note_traffic(&mut self) {
        self.idle = Duration::from_secs(0);
        self.deadline = None;
    }

    /// Note that `elapsed` time has passed.  Returns true if a
    /// padding cell is now due.
    ///
    /// When padding comes due, the caller queues one PADDING cell (at
    /// padding priority) and the timer re-arms with a fresh random
    /// deadline.
    pub(crate) fn note_elapsed<R: Rng>(&mut self, elapsed: Duration, rng: &mut R) -> bool {
        if !self.params.enabled {
            return false;
        }
        self.idle += elapsed;
        let deadline = *self.deadline.get_or_insert_with(|| {
            let low = self.params.low.as_millis() as u64;
            let high = self.params.high.as_millis() as u64;
            Duration::from_millis(rng.gen_range(low..=high))
        });
        if self.idle >= deadline {
            self.idle = Duration::from_secs(0);
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_within_bounds() {
        let mut rng = rand::thread_rng();
        let params = PaddingParams::from_negotiation(true, 100, 200);
        let mut timer = PaddingTimer::new(params);

        // Stepping 10ms at a time, padding must come due somewhere
        // between 100 and 210 ms of idleness.
        let mut total = 0;
        loop {
            total += 10;
            if timer.note_elapsed(Duration::from_millis(10), &mut rng) {
                break;
            }
            assert!(total < 250, "padding never fired");
        }
        assert!(total >= 100);
    }

    #[test]
    fn traffic_resets() {
        let mut rng = rand::thread_rng();
        let params = PaddingParams::from_negotiation(true, 100, 100);
        let mut timer = PaddingTimer::new(params);

        assert!(!timer.note_elapsed(Duration::from_millis(90), &mut rng));
        timer.note_traffic();
        // The 90ms of idleness before the traffic no longer count.
        assert!(!timer.note_elapsed(Duration::from_millis(90), &mut rng));
        assert!(timer.note_elapsed(Duration::from_millis(20), &mut rng));
    }

    #[test]
    fn disabled_never_fires() {
        let mut rng = rand::thread_rng();
        let params = PaddingParams::from_negotiation(false, 0, 0);
        let mut timer = PaddingTimer::new(params);
        assert!(!timer.note_elapsed(Duration::from_secs(1000), &mut rng));
    }
}

//! Logging-only identifiers for circuits.

use std::fmt::{Display, Formatter};

/// Identifier for a circuit, for logging and the operator surface.
///
/// We don't use the wire circuit ID for this: those are large random
/// numbers that get reused over time, so they make rotten log keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UniqId {
    /// Channel that this circuit is on.
    chan: usize,
    /// ID for the circuit on the channel.
    circ: usize,
}

impl UniqId {
    /// Construct a new circuit UniqId from its parts.
    pub(crate) fn new(chan: usize, circ: usize) -> Self {
        UniqId { chan, circ }
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circ {}.{}", self.chan, self.circ)
    }
}

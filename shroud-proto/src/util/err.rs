//! Define the error type for the shroud-proto crate.

use shroud_cell::relaycell::msg::EndReason;
use std::sync::Arc;
use thiserror::Error;

/// An error type for the shroud-proto crate.
///
/// The variants here fall into the taxonomy that the rest of the
/// system relies on: transport errors close channels, protocol errors
/// close circuits (or the channel, if they happen before the
/// handshake is done), policy errors close only a stream, resource
/// errors shed load, and timeouts close the object that timed out.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while encoding or decoding a cell.
    #[error("cell encoding error: {0}")]
    CellErr(#[from] shroud_cell::Error),
    /// An error from the byte-parsing layer.
    #[error("parsing error: {0}")]
    BytesErr(#[from] shroud_bytes::Error),
    /// An error from the io system: the transport under a channel is
    /// broken.
    #[error("io error: {0}")]
    IoErr(#[source] Arc<std::io::Error>),
    /// Protocol violation at the channel level.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// Protocol violation at the circuit level.
    #[error("circuit protocol violation: {0}")]
    CircProto(String),
    /// Protocol violation at the stream level.
    #[error("stream protocol violation: {0}")]
    StreamProto(String),
    /// Circuit destroyed or closed while an operation was in
    /// progress.
    #[error("circuit destroyed: {0}")]
    CircDestroy(&'static str),
    /// The channel was closed (or closing) when we tried to use it.
    #[error("channel closed")]
    ChannelClosed,
    /// The circuit was closed when we tried to use it.
    #[error("circuit closed")]
    CircuitClosed,
    /// Tried to extend a circuit in a way the relay refused.
    #[error("circuit extension refused: {0}")]
    CircExtend(&'static str),
    /// A remote stream was closed with the given END reason.
    #[error("stream closed by peer: {}", .0.human_str())]
    EndReceived(EndReason),
    /// An onion handshake failed its MAC check or was otherwise
    /// unusable.
    #[error("handshake failed")]
    BadHandshake,
    /// A received relay cell did not authenticate at any hop.
    #[error("relay cell was not recognized at any hop")]
    BadCellAuth,
    /// Asked to send to a hop that doesn't exist on the circuit.
    #[error("no such hop on circuit")]
    NoSuchHop,
    /// We have no private key that matches the requested handshake.
    #[error("no key matched the incoming handshake")]
    MissingKey,
    /// Tried to extract too much key material from a KDF.
    #[error("invalid KDF output length")]
    InvalidOutputLength,
    /// An identifier space (circuit IDs on a channel, or stream IDs
    /// on a circuit) is saturated.
    ///
    /// This is a transient resource error: trying again on another
    /// channel or circuit may succeed.
    #[error("identifier space exhausted")]
    IdRangeFull,
    /// A resource limit (queue memory, stream count, and so on) was
    /// hit.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(&'static str),
    /// A request was denied by the local exit policy.
    #[error("request refused by exit policy")]
    PolicyRefused,
    /// An operation took too long and was abandoned.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),
    /// Bad configuration value.
    #[error("bad configuration: {0}")]
    BadConfig(String),
    /// There was a programming error somewhere in our code, or in a
    /// crate we use.  Counted, reported, and survived; never a panic.
    #[error("internal programming error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IoErr(Arc::new(e))
    }
}

/// Extension trait to give EndReason a human-readable description.
trait HumanStr {
    /// Return a string saying what this reason means.
    fn human_str(&self) -> &'static str;
}

impl HumanStr for EndReason {
    fn human_str(&self) -> &'static str {
        match *self {
            EndReason::MISC => "unspecified reason",
            EndReason::RESOLVEFAILED => "couldn't look up hostname",
            EndReason::CONNECTREFUSED => "remote host refused connection",
            EndReason::EXITPOLICY => "exit policy refused request",
            EndReason::DESTROY => "circuit destroyed",
            EndReason::DONE => "closed normally",
            EndReason::TIMEOUT => "timed out",
            EndReason::NOROUTE => "no route to host",
            EndReason::HIBERNATING => "relay hibernating",
            EndReason::INTERNAL => "internal error at relay",
            EndReason::RESOURCELIMIT => "relay out of resources",
            EndReason::CONNRESET => "connection reset",
            EndReason::PROTOCOL => "protocol violation",
            EndReason::NOTDIRECTORY => "not a directory cache",
            _ => "unrecognized reason",
        }
    }
}

/// An error transformed to indicate what a reactor should do about
/// it: report it outward, or just shut down quietly.
#[derive(Debug)]
pub(crate) enum ReactorError {
    /// The reactor should shut down with an abnormal exit condition.
    Err(Error),
    /// The reactor should shut down without an error, since all is
    /// well.
    Shutdown,
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}

#[cfg(test)]
impl ReactorError {
    /// Tests only: assert that this is an Error, and return it.
    pub(crate) fn unwrap_err(self) -> Error {
        match self {
            ReactorError::Shutdown => panic!(),
            ReactorError::Err(e) => e,
        }
    }
}

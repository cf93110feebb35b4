//! Declare error types for the shroud-chanmgr crate.

use thiserror::Error;

/// An error returned by the channel manager.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A protocol error while opening or using a channel.
    #[error("protocol error: {0}")]
    Proto(#[from] shroud_proto::Error),
    /// We couldn't connect to the relay at the transport level.
    #[error("connection failed: {0}")]
    Io(#[source] std::sync::Arc<std::io::Error>),
    /// The transport gave us a connection with no certificate.
    #[error("peer presented no TLS certificate")]
    MissingCert,
    /// A pending channel attempt failed, so we failed too.
    #[error("pending channel attempt failed")]
    PendingFailed,
    /// The target has no address we can use.
    #[error("target has no usable address")]
    UnusableTarget,
    /// An internal programming error.
    #[error("internal programming error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(std::sync::Arc::new(e))
    }
}

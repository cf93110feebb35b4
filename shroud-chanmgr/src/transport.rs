//! Types for launching TLS connections to relays.

use crate::Result;

use shroud_linkspec::ChanTarget;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

/// A connection that can report the TLS certificate its peer
/// presented.
///
/// The link handshake binds that certificate to the peer's long-term
/// identity, so every transport must be able to produce it.
pub trait CertifiedConn {
    /// Try to return the certificate the peer presented during the
    /// TLS handshake, in DER format.
    fn peer_certificate(&self) -> std::io::Result<Option<Vec<u8>>>;
}

/// A Transport knows how to build a TLS connection to a relay.
///
/// We don't expect any particular hostname or certificate chain in
/// the TLS layer itself; the peer certificate gets authenticated
/// inside the link handshake instead.
#[async_trait]
pub trait Transport {
    /// The type this transport returns.  This should be an
    /// asynchronous TLS connection.
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + CertifiedConn + 'static;

    /// Try to connect to a given relay.
    async fn connect<T: ChanTarget + Sync + ?Sized>(
        &self,
        target: &T,
    ) -> Result<(std::net::SocketAddr, Self::Connection)>;
}

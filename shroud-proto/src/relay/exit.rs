//! Exit-side machinery: bridging streams to local TCP connections and
//! DNS lookups.
//!
//! The relay core never opens sockets or queries DNS itself;
//! everything goes through the traits here, so the embedding
//! application decides how names are resolved and connections are
//! made (and tests substitute scripted fakes).

use crate::{Error, Result};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::Stream;
use futures::task::{Context, Poll, Waker};

use shroud_cell::relaycell::msg::EndReason;
use shroud_cell::relaycell::StreamId;

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// The type of an established edge connection: any bidirectional
/// byte stream.
pub type EdgeConn = Box<dyn EdgeIo + Send + Unpin + 'static>;

/// Convenience alias trait for the I/O bounds an edge connection
/// must satisfy.
pub trait EdgeIo: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> EdgeIo for T {}

/// A resolver the exit uses to turn names into addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a hostname to zero or more addresses.
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
    /// Reverse-resolve an address to zero or more hostnames.
    async fn reverse(&self, addr: &IpAddr) -> Result<Vec<String>>;
}

/// The local policy deciding which targets this exit will connect
/// to.
pub trait ExitPolicy: Send + Sync {
    /// Return true if this exit may connect to `addr`:`port`.
    fn allow(&self, addr: &IpAddr, port: u16) -> bool;
}

/// An exit policy that refuses everything.  The default for relays
/// that aren't exits.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RefuseAll;
impl ExitPolicy for RefuseAll {
    fn allow(&self, _addr: &IpAddr, _port: u16) -> bool {
        false
    }
}

/// Something that can open outbound TCP connections for exit
/// streams.
#[async_trait]
pub trait EdgeConnector: Send + Sync {
    /// Open a connection to `addr`.
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<EdgeConn>;
}

/// The bundle of collaborators the exit engine needs.
#[derive(Clone)]
pub struct ExitContext {
    /// How to look up names.
    pub resolver: Arc<dyn Resolver>,
    /// Which targets we may connect to.
    pub policy: Arc<dyn ExitPolicy>,
    /// How to open connections.
    pub connector: Arc<dyn EdgeConnector>,
}

/// Map an I/O error from an edge connection onto the END reason we
/// report for it.
pub(crate) fn io_error_to_end_reason(e: &std::io::Error) -> EndReason {
    use std::io::ErrorKind as EK;
    match e.kind() {
        EK::ConnectionRefused => EndReason::CONNECTREFUSED,
        EK::ConnectionReset | EK::ConnectionAborted | EK::BrokenPipe => EndReason::CONNRESET,
        EK::TimedOut => EndReason::TIMEOUT,
        EK::AddrNotAvailable | EK::NotFound => EndReason::NOROUTE,
        _ => EndReason::MISC,
    }
}

/// An event produced by the read side of an exit stream.
pub(crate) enum EdgeEvent {
    /// Bytes arrived from the edge connection, bound for the client.
    Data(StreamId, Vec<u8>),
    /// The edge connection finished cleanly.
    Eof(StreamId),
    /// The edge connection failed.
    IoError(StreamId, EndReason),
}

/// Shared pause state between an [`EdgeReader`] and its
/// [`PauseHandle`].
#[derive(Default)]
struct PauseState {
    /// True while reading is stopped.
    paused: bool,
    /// True once the reader should end outright.
    closed: bool,
    /// Waker to fire when reading resumes.
    waker: Option<Waker>,
}

/// A handle used to read-stop and resume one exit stream's reader.
///
/// When the stream or circuit package window empties, we stop reading
/// from the edge socket; TCP back-pressure then throttles the remote
/// sender, which is exactly the behavior the flow-control design
/// wants.
#[derive(Clone)]
pub(crate) struct PauseHandle {
    /// The shared pause flag.
    state: Arc<Mutex<PauseState>>,
}

impl PauseHandle {
    /// Create a new, unpaused handle.
    pub(crate) fn new() -> Self {
        PauseHandle {
            state: Arc::new(Mutex::new(PauseState::default())),
        }
    }

    /// Stop the associated reader until `resume` is called.
    pub(crate) fn pause(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.paused = true;
        }
    }

    /// Let the associated reader continue.
    pub(crate) fn resume(&self) {
        let waker = {
            match self.state.lock() {
                Ok(mut st) => {
                    st.paused = false;
                    st.waker.take()
                }
                Err(_) => None,
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Shut the associated reader down entirely: its stream will end
    /// at the next poll.
    pub(crate) fn shutdown(&self) {
        let waker = {
            match self.state.lock() {
                Ok(mut st) => {
                    st.closed = true;
                    st.waker.take()
                }
                Err(_) => None,
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Check the flags from the reader side.  Returns Some(true) if
    /// paused (wakeup registered), Some(false) if closed, None to
    /// proceed.
    fn check(&self, cx: &mut Context<'_>) -> Option<bool> {
        match self.state.lock() {
            Ok(mut st) => {
                if st.closed {
                    Some(false)
                } else if st.paused {
                    st.waker = Some(cx.waker().clone());
                    Some(true)
                } else {
                    None
                }
            }
            Err(_) => None,
        }
    }
}

/// Largest number of bytes we pull from an edge socket at once: the
/// payload of one DATA message.
const EDGE_READ_CHUNK: usize = shroud_cell::relaycell::MAX_RELAY_DATA_LEN;

/// A Stream of [`EdgeEvent`]s from the read half of one exit
/// connection.
///
/// Ends (yields None) after Eof or IoError.
pub(crate) struct EdgeReader {
    /// The stream ID the events belong to.
    id: StreamId,
    /// The read half of the connection.
    conn: Box<dyn AsyncRead + Send + Unpin + 'static>,
    /// Cooperative read-stop flag.
    pause: PauseHandle,
    /// Set once we have yielded a terminal event.
    done: bool,
}

impl EdgeReader {
    /// Construct a new EdgeReader.
    pub(crate) fn new(
        id: StreamId,
        conn: Box<dyn AsyncRead + Send + Unpin + 'static>,
        pause: PauseHandle,
    ) -> Self {
        EdgeReader {
            id,
            conn,
            pause,
            done: false,
        }
    }
}

impl Stream for EdgeReader {
    type Item = EdgeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<EdgeEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.pause.check(cx) {
            Some(true) => return Poll::Pending,
            Some(false) => {
                this.done = true;
                return Poll::Ready(None);
            }
            None => (),
        }
        let mut buf = [0_u8; EDGE_READ_CHUNK];
        match Pin::new(&mut this.conn).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(0)) => {
                this.done = true;
                Poll::Ready(Some(EdgeEvent::Eof(this.id)))
            }
            Poll::Ready(Ok(n)) => Poll::Ready(Some(EdgeEvent::Data(this.id, buf[..n].to_vec()))),
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(EdgeEvent::IoError(this.id, io_error_to_end_reason(&e))))
            }
        }
    }
}

/// Parse the target of a BEGIN message into a host part and a port.
pub(crate) fn parse_begin_target(begin: &shroud_cell::relaycell::msg::Begin) -> Result<(String, u16)> {
    let addr = std::str::from_utf8(begin.addr())
        .map_err(|_| Error::StreamProto("Non-utf8 target in BEGIN".into()))?;
    Ok((addr.to_ascii_lowercase(), begin.port()))
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::block_on;
    use futures::stream::StreamExt;

    #[test]
    fn end_reason_mapping() {
        use std::io::{Error as IoError, ErrorKind as EK};
        assert_eq!(
            io_error_to_end_reason(&IoError::from(EK::ConnectionRefused)),
            EndReason::CONNECTREFUSED
        );
        assert_eq!(
            io_error_to_end_reason(&IoError::from(EK::TimedOut)),
            EndReason::TIMEOUT
        );
        assert_eq!(
            io_error_to_end_reason(&IoError::from(EK::Other)),
            EndReason::MISC
        );
    }

    #[test]
    fn edge_reader_reads_then_eof() {
        block_on(async {
            let data = b"nevermore".to_vec();
            let reader = EdgeReader::new(
                5.into(),
                Box::new(futures::io::Cursor::new(data)),
                PauseHandle::new(),
            );
            let events: Vec<_> = reader.collect().await;
            assert_eq!(events.len(), 2);
            match &events[0] {
                EdgeEvent::Data(id, bytes) => {
                    assert_eq!(*id, StreamId::from(5));
                    assert_eq!(&bytes[..], b"nevermore");
                }
                _ => panic!(),
            }
            assert!(matches!(events[1], EdgeEvent::Eof(_)));
        });
    }

    #[test]
    fn paused_reader_waits() {
        use futures::future::FutureExt;
        block_on(async {
            let data = b"delayed".to_vec();
            let pause = PauseHandle::new();
            pause.pause();
            let mut reader = EdgeReader::new(
                1.into(),
                Box::new(futures::io::Cursor::new(data)),
                pause.clone(),
            );
            // While paused, nothing is ready.
            assert!(reader.next().now_or_never().is_none());
            // After resuming, the data flows.
            pause.resume();
            match reader.next().await {
                Some(EdgeEvent::Data(_, bytes)) => assert_eq!(&bytes[..], b"delayed"),
                _ => panic!(),
            }
        });
    }
}

//! Wrap shroud_cell's cell codec for use with the asynchronous-codec
//! crate.

use asynchronous_codec as futures_codec;
use shroud_cell::chancell::{codec, ChanCell};

use bytes::BytesMut;

/// Asynchronous wrapper around the cell codec in shroud-cell.
///
/// This type lets us wrap a TLS channel (or some other secure
/// AsyncRead+AsyncWrite type) as a Sink and a Stream of ChanCell, so
/// we can forget about byte-oriented communication.
pub(crate) struct ChannelCodec(codec::ChannelCodec);

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version.
    pub(crate) fn new(link_version: u16) -> Self {
        ChannelCodec(codec::ChannelCodec::new(link_version))
    }
}

impl futures_codec::Encoder for ChannelCodec {
    type Item = ChanCell;
    type Error = shroud_cell::Error;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_cell(item, dst)
    }
}

impl futures_codec::Decoder for ChannelCodec {
    type Item = ChanCell;
    type Error = shroud_cell::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_cell(src)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use futures::io::{AsyncRead, AsyncWrite};
    use futures::task::{Context, Poll};
    use std::io::Result as IoResult;
    use std::pin::Pin;

    use bytes::BytesMut;

    /// An in-memory reader/writer to use in tests in place of a TLS
    /// stream: reads yield the canned input, writes collect into a
    /// buffer.
    pub(crate) struct MsgBuf {
        /// Data we have "received" and not yet read.
        inp: BytesMut,
        /// Data we have "sent".
        out: BytesMut,
    }

    impl AsyncRead for MsgBuf {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<IoResult<usize>> {
            let n_to_copy = std::cmp::min(buf.len(), self.inp.len());
            if n_to_copy > 0 {
                let b = self.inp.split_to(n_to_copy);
                buf[..n_to_copy].copy_from_slice(&b[..]);
            }
            Poll::Ready(Ok(n_to_copy))
        }
    }

    impl AsyncWrite for MsgBuf {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<IoResult<usize>> {
            self.out.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl MsgBuf {
        /// Construct a new MsgBuf whose reads will yield `output`.
        pub(crate) fn new<T: Into<Vec<u8>>>(output: T) -> Self {
            let mut inp = BytesMut::new();
            inp.extend_from_slice(&output.into()[..]);
            MsgBuf {
                inp,
                out: BytesMut::new(),
            }
        }

        /// Return everything written so far.
        #[allow(dead_code)]
        pub(crate) fn written(&self) -> &[u8] {
            &self.out[..]
        }
    }
}

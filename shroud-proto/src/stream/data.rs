//! A byte-oriented view of a stream, for use with BEGIN and BEGIN_DIR
//! requests.

use super::RawCellStream;
use crate::{Error, Result};
use shroud_cell::relaycell::msg::{Data, EndReason, RelayMsg};

/// A DataStream is a wrapper around a [RawCellStream] for byte-based
/// IO.
///
/// Writes are chunked into DATA messages; reads reassemble them.
/// Back-pressure comes for free: sending blocks whenever the stream
/// or circuit package window is exhausted, and resumes when SENDMEs
/// arrive.
pub struct DataStream {
    /// The underlying message-oriented stream.
    s: RawCellStream,
    /// Bytes that we have received in a DATA message but that the
    /// caller has not yet read.
    pending: Option<Vec<u8>>,
    /// The END message (or error) that terminated this stream, once
    /// one has arrived.
    received_end: Option<Result<RelayMsg>>,
}

impl DataStream {
    /// Internal: wrap a RawCellStream as a DataStream.
    pub(crate) fn new(s: RawCellStream) -> Self {
        DataStream {
            s,
            pending: None,
            received_end: None,
        }
    }

    /// Write all the bytes in `b` onto the stream, using as few DATA
    /// messages as possible.
    pub async fn write_bytes(&mut self, b: &[u8]) -> Result<()> {
        for chunk in b.chunks(Data::MAXLEN) {
            let cell = Data::new(chunk);
            self.s.send(cell.into()).await?;
        }
        Ok(())
    }

    /// Try to read some bytes from the stream into `buf`; return how
    /// many we read.
    ///
    /// A return value of 0 means the stream is closed: either the
    /// peer ended it, or the circuit is gone.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        /// Copy as much of `v` into `buf` as fits, returning the
        /// count copied and any leftover bytes.
        fn split_and_write(buf: &mut [u8], mut v: Vec<u8>) -> (usize, Option<Vec<u8>>) {
            if v.len() > buf.len() {
                let remainder = v.split_off(buf.len());
                buf.copy_from_slice(&v[..]);
                (v.len(), Some(remainder))
            } else {
                buf[..v.len()].copy_from_slice(&v[..]);
                (v.len(), None)
            }
        }

        if let Some(pending) = self.pending.take() {
            let (n, new_pending) = split_and_write(buf, pending);
            self.pending = new_pending;
            return Ok(n);
        }

        if let Some(end) = &self.received_end {
            // The stream already ended; say so again.
            return match end {
                Ok(RelayMsg::End(e)) if e.reason() == EndReason::DONE => Ok(0),
                Ok(RelayMsg::End(e)) => Err(Error::EndReceived(e.reason())),
                _ => Ok(0),
            };
        }

        // We don't loop here; if we did, we might block while we had
        // some data to return.
        let cell = self.s.recv().await;

        match cell {
            Ok(RelayMsg::Data(d)) => {
                let (n, pending) = split_and_write(buf, d.into());
                self.pending = pending;
                Ok(n)
            }
            Ok(RelayMsg::End(e)) => {
                let reason = e.reason();
                self.received_end = Some(Ok(RelayMsg::End(e)));
                if reason == EndReason::DONE {
                    Ok(0)
                } else {
                    Err(Error::EndReceived(reason))
                }
            }
            Err(e) => {
                self.received_end = Some(Err(e));
                Ok(0)
            }
            Ok(other) => {
                // This message type shouldn't have gotten through the
                // reactor's checks; kill the circuit.
                self.s.protocol_error().await;
                Err(Error::StreamProto(format!(
                    "Unexpected {} cell on a data stream",
                    other.cmd()
                )))
            }
        }
    }

    /// Inform the peer that we are done writing, with the DONE
    /// reason.
    pub async fn close(&mut self) -> Result<()> {
        self.s.send_end(EndReason::DONE).await
    }
}

//! Type and code for handling a "half-closed" stream.
//!
//! A half-closed stream is one that we've sent an END on, but where
//! we might still receive some cells.

use crate::circuit::sendme::{StreamRecvWindow, StreamSendWindow};
use crate::{Error, Result};
use shroud_cell::relaycell::msg::RelayMsg;

/// Type to track the state of half-closed streams.
///
/// We need to track these streams instead of forgetting about them
/// entirely, since otherwise we'd be vulnerable to a class of
/// "exhaustion by mark" attacks where a peer probes whether a stream
/// ever existed by sending traffic to its ID and watching whether the
/// circuit survives.
pub(crate) struct HalfStream {
    /// Send window for this stream.  Used to detect whether we get
    /// too many SENDME cells.
    sendw: StreamSendWindow,
    /// Receive window for this stream.  Used to detect whether we get
    /// too many data cells.
    recvw: StreamRecvWindow,
    /// If true, accept a connected cell on this stream.
    connected_ok: bool,
}

impl HalfStream {
    /// Create a new half-closed stream.
    pub(crate) fn new(
        sendw: StreamSendWindow,
        recvw: StreamRecvWindow,
        connected_ok: bool,
    ) -> Self {
        HalfStream {
            sendw,
            recvw,
            connected_ok,
        }
    }

    /// Process an incoming message and adjust this HalfStream
    /// accordingly.  Give an error if the protocol has been violated.
    ///
    /// The caller must handle END cells; it is an internal error to
    /// pass an END cell to this method.
    pub(crate) async fn handle_msg(&mut self, msg: &RelayMsg) -> Result<()> {
        match msg {
            RelayMsg::Sendme(_) => {
                self.sendw.put(Some(())).await.ok_or_else(|| {
                    Error::CircProto("Too many sendmes on a closed stream!".into())
                })?;
                Ok(())
            }
            RelayMsg::Data(_) => {
                if self.recvw.take().is_none() {
                    Err(Error::CircProto(
                        "Impossibly many cells sent to a closed stream!".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            RelayMsg::Connected(_) => {
                if self.connected_ok {
                    self.connected_ok = false;
                    Ok(())
                } else {
                    Err(Error::CircProto(
                        "Bad CONNECTED cell on a closed stream!".into(),
                    ))
                }
            }
            RelayMsg::End(_) => Err(Error::InternalError(
                "END cell in HalfStream::handle_msg().".into(),
            )),
            _ => Err(Error::CircProto(format!(
                "Bad {} cell on a closed stream!",
                msg.cmd()
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::circuit::sendme::{SendWindow, RecvWindow};
    use futures::executor::block_on;
    use shroud_cell::relaycell::msg::{Data, Sendme};

    fn hs(connected_ok: bool) -> HalfStream {
        HalfStream::new(SendWindow::new(500), RecvWindow::new(500), connected_ok)
    }

    #[test]
    fn halfstream_data_bounded() {
        block_on(async {
            let mut h = hs(false);
            let data = Data::new(b"blob").into();
            // 500 data cells are fine; the 501st is a violation.
            for _ in 0..500 {
                h.handle_msg(&data).await.unwrap();
            }
            let e = h.handle_msg(&data).await.unwrap_err();
            assert!(matches!(e, Error::CircProto(_)));
        });
    }

    #[test]
    fn halfstream_connected_only_once() {
        block_on(async {
            let mut h = hs(true);
            let connected = shroud_cell::relaycell::msg::Connected::new_empty().into();
            h.handle_msg(&connected).await.unwrap();
            let e = h.handle_msg(&connected).await.unwrap_err();
            assert!(matches!(e, Error::CircProto(_)));
        });
    }

    #[test]
    fn halfstream_sendme_requires_data() {
        block_on(async {
            let mut h = hs(false);
            // We never sent data, so a sendme is bogus.
            let sendme = Sendme::new_empty().into();
            let e = h.handle_msg(&sendme).await.unwrap_err();
            assert!(matches!(e, Error::CircProto(_)));
        });
    }
}

//! The lowest-level stream interface: a cell-at-a-time view.

use crate::circuit::StreamTarget;
use crate::{Error, Result};
use shroud_cell::relaycell::msg::RelayMsg;

use futures::channel::mpsc;
use futures::lock::Mutex;
use futures::stream::StreamExt;

/// A RawCellStream is a client's cell-oriented view of a stream over
/// the overlay network.
///
/// Each relay message received on this stream has already been
/// checked by the circuit reactor: flow-control windows are already
/// accounted, and stream-level SENDMEs never show up here.
pub struct RawCellStream {
    /// Wrapped view of the circuit, hop, and stream ID that we're
    /// using.
    target: Mutex<StreamTarget>,
    /// Stream of relay messages for this stream, delivered by the
    /// circuit reactor.
    receiver: Mutex<mpsc::Receiver<RelayMsg>>,
}

impl RawCellStream {
    /// Internal: build a new RawCellStream.
    pub(crate) fn new(target: StreamTarget, receiver: mpsc::Receiver<RelayMsg>) -> Self {
        RawCellStream {
            target: Mutex::new(target),
            receiver: Mutex::new(receiver),
        }
    }

    /// Try to read the next relay message from this stream.
    pub async fn recv(&self) -> Result<RelayMsg> {
        let msg = self
            .receiver
            .lock()
            .await
            .next()
            .await
            // The channel is closed: the circuit (or stream) is gone.
            .ok_or(Error::CircuitClosed)?;
        Ok(msg)
    }

    /// Send a relay message along this stream.
    pub async fn send(&self, msg: RelayMsg) -> Result<()> {
        self.target.lock().await.send(msg).await
    }

    /// Called when a circuit-level protocol error has occurred and
    /// the circuit needs to shut down.
    pub(crate) async fn protocol_error(&self) {
        self.target.lock().await.protocol_error().await;
    }

    /// Inform the peer that we will not be writing on this stream any
    /// more, by sending an END message.
    ///
    /// (Reading may still work until the peer replies in kind.)
    pub async fn send_end(&self, reason: shroud_cell::relaycell::msg::EndReason) -> Result<()> {
        use shroud_cell::relaycell::msg::End;
        self.send(End::new_with_reason(reason).into()).await
    }
}

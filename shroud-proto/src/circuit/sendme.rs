//! Flow-control windows for circuits and streams.
//!
//! There are two levels of flow control.  Each circuit has a pair of
//! windows that start at 1000 cells and are refilled 100 at a time by
//! circuit-level SENDME messages; each stream has a pair that start
//! at 500 and are refilled 50 at a time by stream-level SENDMEs.
//! Only DATA cells count against a window.
//!
//! Circuit-level SENDMEs are authenticated: the acknowledging side
//! must echo the digest tag of the cell that triggered the SENDME, so
//! a relay cannot blindly acknowledge traffic it never saw.

use crate::{Error, Result};

use futures::channel::oneshot;
use futures::lock::Mutex;

use std::collections::VecDeque;
use std::sync::Arc;

use shroud_cell::relaycell::msg::RelayMsg;
use shroud_cell::relaycell::RelayCell;

/// The authentication tag carried in a circuit-level SENDME.
///
/// Comparison between tags is constant-time.
#[derive(Clone, Debug)]
pub(crate) struct CircTag([u8; 20]);

impl PartialEq for CircTag {
    fn eq(&self, other: &Self) -> bool {
        crate::util::ct::bytes_eq(&self.0[..], &other.0[..])
    }
}
impl Eq for CircTag {}
impl From<[u8; 20]> for CircTag {
    fn from(v: [u8; 20]) -> CircTag {
        CircTag(v)
    }
}
impl AsRef<[u8]> for CircTag {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl std::convert::TryFrom<&[u8]> for CircTag {
    type Error = Error;
    fn try_from(v: &[u8]) -> Result<CircTag> {
        if v.len() != 20 {
            return Err(Error::CircProto("malformed tag on circuit sendme".into()));
        }
        let mut tag = [0_u8; 20];
        tag.copy_from_slice(v);
        Ok(CircTag(tag))
    }
}

/// The tag type for windows that have no authentication, such as
/// stream-level windows.
pub(crate) type NoTag = ();

/// A circuit's outbound window.
pub(crate) type CircSendWindow = SendWindow<CircParams, CircTag>;
/// A stream's outbound window.
pub(crate) type StreamSendWindow = SendWindow<StreamParams, NoTag>;

/// A circuit's inbound window.
pub(crate) type CircRecvWindow = RecvWindow<CircParams>;
/// A stream's inbound window.
pub(crate) type StreamRecvWindow = RecvWindow<StreamParams>;

/// Tunable parameters for one kind of window.
pub(crate) trait WindowParams {
    /// Largest allowable value for this window.
    fn maximum() -> u16;
    /// Increment for one SENDME message on this window.
    fn increment() -> u16;
}

/// Parameters for circuit-level windows.
#[derive(Clone)]
pub(crate) struct CircParams;
impl WindowParams for CircParams {
    fn maximum() -> u16 {
        1000
    }
    fn increment() -> u16 {
        100
    }
}

/// Parameters for stream-level windows.
#[derive(Clone)]
pub(crate) struct StreamParams;
impl WindowParams for StreamParams {
    fn maximum() -> u16 {
        500
    }
    fn increment() -> u16 {
        50
    }
}

/// A window used to track how many cells we may send on a circuit or
/// stream.
///
/// Sending blocks when the window is empty, and unblocks when a valid
/// SENDME arrives.
pub(crate) struct SendWindow<P, T>
where
    P: WindowParams,
    T: PartialEq + Eq + Clone,
{
    // TODO: this lock is paired against short critical sections only,
    // but it would be nice to go lock-free someday.
    /// Shared window state.
    w: Arc<Mutex<SendWindowInner<T>>>,
    /// Marker for the parameter type.
    _dummy: std::marker::PhantomData<P>,
}

/// Interior (locked) representation of a SendWindow.
struct SendWindowInner<T>
where
    T: PartialEq + Eq + Clone,
{
    /// The maximum value this window may hold.
    capacity: u16,
    /// Current value: how many cells we may still send.
    window: u16,
    /// Tags of cells whose SENDMEs we expect, oldest first.
    tags: VecDeque<T>,
    /// A sender to notify whoever is blocked waiting for the window
    /// to refill.
    unblock: Option<oneshot::Sender<()>>,
}

impl<P, T> SendWindow<P, T>
where
    P: WindowParams,
    T: PartialEq + Eq + Clone,
{
    /// Construct a new SendWindow starting (and capped) at `window`.
    pub(crate) fn new(window: u16) -> SendWindow<P, T> {
        let increment = P::increment();
        let capacity = (window + increment - 1) / increment;
        let inner = SendWindowInner {
            capacity: window,
            window,
            tags: VecDeque::with_capacity(capacity as usize),
            unblock: None,
        };
        SendWindow {
            w: Arc::new(Mutex::new(inner)),
            _dummy: std::marker::PhantomData,
        }
    }

    /// Return a new reference to this window.
    pub(crate) fn new_ref(&self) -> Self {
        SendWindow {
            w: Arc::clone(&self.w),
            _dummy: std::marker::PhantomData,
        }
    }

    /// Remove one cell from this window, blocking until the window is
    /// nonempty.
    ///
    /// If the cell is at a SENDME boundary, remember `tag`: a future
    /// SENDME must echo it.
    ///
    /// The acknowledged cell is the one that moves the window onto a
    /// multiple of the increment: with the standard parameters,
    /// that's every 100th cell on a circuit.  The receiving side uses
    /// the same rule, so the tag in each SENDME matches the tag we
    /// record here; a SENDME acknowledging any other cell fails the
    /// tag check and kills the circuit.
    pub(crate) async fn take(&mut self, tag: &T) -> Result<u16> {
        loop {
            let wait_on = {
                let mut w = self.w.lock().await;
                let oldval = w.window;
                if oldval % P::increment() == 1 {
                    w.tags.push_back(tag.clone());
                }
                if let Some(val) = w.window.checked_sub(1) {
                    w.window = val;
                    return Ok(val);
                }

                // Window is empty; we can't send yet.
                let (send, recv) = oneshot::channel::<()>();

                if w.unblock.replace(send).is_some() {
                    return Err(Error::InternalError(
                        "two tasks blocking on one send window".into(),
                    ));
                }
                recv
            };
            // Wait on this receiver while _not_ holding the lock.
            if wait_on.await.is_err() {
                return Err(Error::CircuitClosed);
            }
        }
    }

    /// Check whether a `try_take` would currently succeed, without
    /// changing anything.
    pub(crate) fn try_take_check(&self) -> Result<bool> {
        let w = self
            .w
            .try_lock()
            .ok_or_else(|| Error::InternalError("send window lock contended".into()))?;
        Ok(w.window > 0)
    }

    /// Like [`SendWindow::take`], but never blocks: returns Ok(None)
    /// when the window is empty.
    ///
    /// Used on the relay side, where the reactor must keep processing
    /// (a SENDME may be the very next cell) and expresses "window
    /// empty" by read-stopping the edge connection instead.
    pub(crate) fn try_take(&mut self, tag: &T) -> Result<Option<u16>> {
        let mut w = self
            .w
            .try_lock()
            .ok_or_else(|| Error::InternalError("send window lock contended".into()))?;
        let oldval = w.window;
        if oldval % P::increment() == 1 {
            w.tags.push_back(tag.clone());
        }
        match w.window.checked_sub(1) {
            Some(val) => {
                w.window = val;
                Ok(Some(val))
            }
            None => Ok(None),
        }
    }

    /// Handle an incoming SENDME with a provided tag.
    ///
    /// On success return the new window value.  Returns None if the
    /// tag is wrong, if no SENDME was expected, or if the window
    /// would exceed its capacity: all of those are protocol
    /// violations that the caller must treat as fatal to the circuit.
    pub(crate) async fn put(&mut self, tag: Option<T>) -> Option<u16> {
        let mut w = self.w.lock().await;

        match (w.tags.pop_front(), tag) {
            (Some(t), Some(tag)) if t == tag => {} // the right tag.
            (Some(_), None) => {}                  // didn't need a tag.
            _ => {
                return None; // Bad tag or unexpected sendme.
            }
        }

        let v = w.window.checked_add(P::increment())?;
        if v > w.capacity {
            return None;
        }
        w.window = v;

        if let Some(send) = w.unblock.take() {
            // If this fails, nothing cares about the window any more.
            let _ignore = send.send(());
        }

        Some(v)
    }

    /// Testing only: return the current window value along with the
    /// tags we expect future SENDMEs to carry.
    #[cfg(test)]
    pub(crate) async fn window_and_expected_tags(&self) -> (u16, Vec<T>) {
        let w = self.w.lock().await;
        (w.window, w.tags.iter().cloned().collect())
    }
}

/// A window used to track how many cells we are willing to receive.
pub(crate) struct RecvWindow<P: WindowParams> {
    /// Number of cells we are still willing to receive.
    window: u16,
    /// Marker for the parameter type.
    _dummy: std::marker::PhantomData<P>,
}

impl<P: WindowParams> RecvWindow<P> {
    /// Construct a new RecvWindow starting at `window`.
    pub(crate) fn new(window: u16) -> RecvWindow<P> {
        RecvWindow {
            window,
            _dummy: std::marker::PhantomData,
        }
    }

    /// Remove one cell from this window.
    ///
    /// Returns None if the window was empty: accepting the cell would
    /// be a protocol violation by the sender.  Otherwise returns
    /// Some(true) if it is time to send a SENDME.
    pub(crate) fn take(&mut self) -> Option<bool> {
        let v = self.window.checked_sub(1);
        if let Some(x) = v {
            self.window = x;
            Some(x % P::increment() == 0)
        } else {
            None
        }
    }

    /// Add one SENDME increment back onto the window, after we have
    /// decided to send an acknowledgement.
    pub(crate) fn put(&mut self) {
        self.window = self
            .window
            .checked_add(P::increment())
            .expect("recv window overflow");
    }
}

impl<P: WindowParams> Clone for RecvWindow<P> {
    fn clone(&self) -> Self {
        RecvWindow {
            window: self.window,
            _dummy: std::marker::PhantomData,
        }
    }
}

/// Return true if this message type counts towards flow-control
/// windows.
pub(crate) fn msg_counts_towards_windows(msg: &RelayMsg) -> bool {
    msg.counts_towards_windows()
}

/// Return true if this cell counts towards flow-control windows.
pub(crate) fn cell_counts_towards_windows(cell: &RelayCell) -> bool {
    cell.counts_towards_circuit_windows()
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn recv_window_boundaries() {
        let mut w: CircRecvWindow = RecvWindow::new(1000);
        // The first 99 cells don't hit a boundary.
        for _ in 0..99 {
            assert_eq!(w.take(), Some(false));
        }
        // The 100th does: the window just reached 900.
        assert_eq!(w.take(), Some(true));
        w.put();
        // Drain the whole thing: the sender may not overrun.
        for _ in 0..1000 {
            assert!(w.take().is_some());
        }
        assert_eq!(w.take(), None);
    }

    #[test]
    fn send_window_tags() {
        block_on(async {
            let mut w: CircSendWindow = SendWindow::new(1000);
            let tag1: CircTag = [1_u8; 20].into();
            let tag2: CircTag = [2_u8; 20].into();

            // Take 200 cells; the tags at the two boundaries are
            // recorded.
            for i in 0..200 {
                let tag = if i < 100 { &tag1 } else { &tag2 };
                w.take(tag).await.unwrap();
            }
            let (val, tags) = w.window_and_expected_tags().await;
            assert_eq!(val, 800);
            assert_eq!(tags.len(), 2);
            assert_eq!(tags[0], tag1);
            assert_eq!(tags[1], tag2);

            // A sendme with the right tag refills by exactly one
            // increment.
            assert_eq!(w.put(Some(tag1.clone())).await, Some(900));
            // One with the wrong tag is refused.
            assert_eq!(w.put(Some(tag1)).await, None);
        });
    }

    #[test]
    fn unexpected_sendme() {
        block_on(async {
            let mut w: StreamSendWindow = SendWindow::new(500);
            // No cells taken: a sendme now is a protocol violation.
            assert_eq!(w.put(Some(())).await, None);
        });
    }
}

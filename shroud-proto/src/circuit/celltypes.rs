//! Wrapper types for subsets of the channel messages that are valid
//! in particular circuit contexts.
//!
//! Using these instead of raw ChanMsg values lets the type system
//! enforce protocol properties: a circuit reactor can only ever see
//! the cell types that are legal on a live circuit.

use crate::{Error, Result};
use shroud_cell::chancell::msg::{self as chanmsg, ChanMsg};

use std::convert::TryFrom;

/// A subset of ChanMsg that can arrive in response to a CREATE* cell
/// that we send.
pub(crate) enum CreateResponse {
    /// Destroy cell: the CREATE failed.
    Destroy(chanmsg::Destroy),
    /// CreatedFast: good response to a CREATE_FAST cell.
    CreatedFast(chanmsg::CreatedFast),
    /// Created2: good response to a CREATE2 cell.
    Created2(chanmsg::Created2),
}

impl TryFrom<ChanMsg> for CreateResponse {
    type Error = crate::Error;

    fn try_from(m: ChanMsg) -> Result<CreateResponse> {
        match m {
            ChanMsg::Destroy(m) => Ok(CreateResponse::Destroy(m)),
            ChanMsg::CreatedFast(m) => Ok(CreateResponse::CreatedFast(m)),
            ChanMsg::Created2(m) => Ok(CreateResponse::Created2(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} in response to circuit creation",
                m.cmd()
            ))),
        }
    }
}

/// A subset of ChanMsg that can correctly arrive on a live circuit
/// (one where a CREATED* has been received, or which we created in
/// response to a CREATE*).
pub(crate) enum ClientCircChanMsg {
    /// A relay cell telling us some kind of remote command from some
    /// party on the circuit.
    Relay(chanmsg::Relay),
    /// A relay cell from the limited RELAY_EARLY supply.
    ///
    /// Valid only on forwarding circuits: nothing may send
    /// RELAY_EARLY towards a client.
    RelayEarly(chanmsg::Relay),
    /// A cell telling us to destroy the circuit.
    Destroy(chanmsg::Destroy),
}

impl TryFrom<ChanMsg> for ClientCircChanMsg {
    type Error = crate::Error;

    fn try_from(m: ChanMsg) -> Result<ClientCircChanMsg> {
        match m {
            ChanMsg::Destroy(m) => Ok(ClientCircChanMsg::Destroy(m)),
            ChanMsg::Relay(m) => Ok(ClientCircChanMsg::Relay(m)),
            ChanMsg::RelayEarly(m) => Ok(ClientCircChanMsg::RelayEarly(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} cell on an open circuit",
                m.cmd()
            ))),
        }
    }
}

//! Streams: the client's view of the anonymized conversations that
//! are multiplexed over a circuit.
//!
//! To create a stream, use [crate::circuit::ClientCirc::begin_stream]
//! (for data) or [crate::circuit::ClientCirc::resolve] (for DNS).
//!
//! The [RawCellStream] type gives a message-at-a-time view; most
//! callers want [DataStream], which is byte-oriented, or
//! [ResolveStream], which gives DNS answers.

mod data;
mod raw;
mod resolve;

pub use data::DataStream;
pub use raw::RawCellStream;
pub use resolve::ResolveStream;

//! Implementation of the core relay protocols of the shroud overlay.
//!
//! # Overview
//!
//! Participants in the overlay make authenticated TLS connections to
//! one another called "channels".  Each channel multiplexes a number
//! of multi-hop "circuits", which act as reliable transports for
//! onion-encrypted relay messages between a client and each relay on
//! the circuit.  Each circuit in turn multiplexes a number of
//! "streams", each corresponding roughly to one application-level
//! connection.
//!
//! This crate implements the logic, protocols, and cryptography for
//! channels, circuits, and streams -- on both the origin (client)
//! side and the forwarding (relay) side -- along with the
//! flow-control windows that pace traffic and the scheduler that
//! arbitrates which circuit's cell is written next on a channel.
//!
//! It uses rust async code and future-related traits, and is intended
//! to work with (nearly) any executor and any TLS implementation that
//! exposes `AsyncRead` and `AsyncWrite`.
//!
//! ## Not in this crate
//!
//! This crate does not decide _when_, _how_, or _where_ to build
//! channels and circuits: path selection, directory handling, and
//! retry policy all live at a higher level, and reach this crate only
//! through the traits in [`shroud_linkspec`] and the callback traits
//! defined here (resolvers, exit policies, edge connectors).
//!
//! This crate also has no timers of its own: every timeout is driven
//! by a caller that owns the clock.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![allow(clippy::unnecessary_wraps)]

pub mod channel;
pub mod circuit;
pub mod config;
mod crypto;
pub mod relay;
pub mod scheduler;
pub mod stream;
mod util;

pub use config::CoreConfig;
pub use util::err::Error;

pub use crypto::pool::{CryptoPool, CryptoToken};

/// A vector of bytes that gets cleared when it's dropped.
type SecretBytes = zeroize::Zeroizing<Vec<u8>>;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

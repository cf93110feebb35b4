//! Coding and decoding for the cells that make up the shroud link
//! protocol.
//!
//! # Overview
//!
//! Relays on the overlay network communicate by exchanging fixed- and
//! variable-width records called "cells".  Some cells implement the
//! channel protocol itself (handshaking, circuit creation, teardown);
//! RELAY cells carry a second, onion-encrypted protocol between a
//! client and the individual hops of its circuits.
//!
//! This crate implements the encoding layer only.  It knows how to
//! turn bytes into [chancell::ChanCell]s and relay-cell bodies into
//! [relaycell::RelayCell]s, and nothing about what to do with them:
//! that logic lives in `shroud-proto`.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]

pub mod chancell;
mod err;
pub mod relaycell;

pub use err::Error;

/// An error type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

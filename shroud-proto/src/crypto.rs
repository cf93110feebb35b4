//! Cryptographic functions of the shroud protocol.
//!
//! There are several pieces:
//!
//! The [cell] module implements the symmetric cryptography performed
//! on relay cells: one layer of keys and running digests per hop.
//!
//! The [handshake] module implements the key-exchange handshakes used
//! to establish those per-hop keys when creating and extending
//! circuits.
//!
//! The [pool] module runs the expensive asymmetric parts of those
//! handshakes on a bounded pool of worker threads, so the protocol
//! reactors never stall on public-key operations.
//!
//! The [ll] module provides low-level building blocks (KDFs).

pub(crate) mod cell;
pub(crate) mod handshake;
pub(crate) mod ll;
pub mod pool;

#[cfg(test)]
pub(crate) mod testing;

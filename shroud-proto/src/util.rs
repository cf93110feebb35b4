//! Internal utilities for shroud-proto.

pub(crate) mod ct;
pub(crate) mod err;
pub(crate) mod idmap;

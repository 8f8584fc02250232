//! Domain types and the ports the routing core talks through.

pub mod identity;
pub mod ports;
pub mod transaction;

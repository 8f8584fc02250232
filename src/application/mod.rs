//! Application layer: link admission, the routing engine and the node that
//! wires them together.
//!
//! Each long-running part (listener, routing engine, every link) runs as its
//! own `tokio` task and is stopped through a `watch` flag.

pub mod container;
pub mod inbox;
pub mod listener;
pub mod node;
pub mod router;

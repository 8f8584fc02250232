//! Transport, link and pay-link implementations behind the domain ports.

pub mod amiko_link;
pub mod in_memory;
pub mod link;
pub mod registry;
pub mod tcp;

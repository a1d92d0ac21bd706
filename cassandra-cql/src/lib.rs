//! Defines CQL native protocol v2 frames and primitives for interacting with Apache Cassandra.
//!
//! Mainly intended to be used by the `cassandra` driver, but can also be useful for other
//! applications (test servers, proxies) that need to speak the protocol.

pub mod errors;
pub mod frame;

pub use crate::frame::types::Consistency;

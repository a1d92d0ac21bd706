//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour. Users can implement a policy on their own, because
//! they simply need to implement a certain trait.
//!
//! This includes:
//! - [load_balancing]: which endpoints a request is sent to, and in what order,
//! - [retry]: whether a failed request is tried again on the next endpoint.

pub mod load_balancing;
pub mod retry;

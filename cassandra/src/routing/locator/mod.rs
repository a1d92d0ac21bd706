//! Finding the replicas of a token: the token ring and the replication strategies
//! that walk it.

mod replication;
mod token_ring;

pub use replication::ReplicationStrategy;
pub use token_ring::TokenRing;

use smallvec::SmallVec;
use std::net::IpAddr;

/// Replicas of one token in ring order, without repeats.
pub type ReplicaList = SmallVec<[IpAddr; 8]>;

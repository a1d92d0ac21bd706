//! This module holds entities that represent the cluster as a whole.
//!
//! This includes:
//! - the [Cluster] handle, which discovers the cluster through its seeds and keeps
//!   a background worker applying server events,
//! - the [TopologyDirectory] of [PeerRecord]s and [KeyspaceMetadata], published as
//!   immutable [TopologySnapshot]s,
//! - [EventListener]s notified about every applied change.
//
//  The control connection is the single connection registered for server events
//  and used to read the system tables.

mod control_connection;
mod directory;
mod listener;
pub(crate) mod metadata_reader;
mod peer;
mod worker;

pub use directory::{KeyspaceMetadata, TopologyDirectory, TopologySnapshot};
pub use listener::EventListener;
pub use peer::PeerRecord;
pub use worker::Cluster;
pub(crate) use worker::ClusterContext;

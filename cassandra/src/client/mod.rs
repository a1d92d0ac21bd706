//! Entry points of the driver: the cluster configuration and the [`Session`](session::Session)
//! executing statements.

pub mod config;
pub mod session;

pub use cassandra_cql::frame::Compression;
pub use config::{ClusterConfig, DEFAULT_PORT};
pub use session::Session;

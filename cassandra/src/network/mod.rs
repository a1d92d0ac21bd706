//! Connections to single nodes and the registry of their pending requests.

mod connection;
pub(crate) mod future_map;

pub(crate) use connection::{ErrorReceiver, QueryResponse};
pub use connection::{Connection, ConnectionConfig, ConnectionState, VerifiedKeyspaceName};
pub use future_map::FutureMap;

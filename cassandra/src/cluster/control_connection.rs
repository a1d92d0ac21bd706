//! Specially treated single connection used to fetch metadata
//! and receive events from the cluster.

use cassandra_cql::frame::server_event_type::EventType;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::ConnectionError;
use crate::network::{Connection, ConnectionConfig, ErrorReceiver, FutureMap};

/// The single connection registered for server events.
pub(super) struct ControlConnection {
    conn: Connection,
    address: IpAddr,
    error_receiver: ErrorReceiver,
}

impl ControlConnection {
    /// Opens a connection to `address` and registers it for `event_types`.
    pub(super) async fn open(
        address: SocketAddr,
        config: ConnectionConfig,
        future_map: Arc<FutureMap>,
        event_types: &[EventType],
    ) -> Result<Self, ConnectionError> {
        let (conn, error_receiver) = Connection::new(address, config, future_map);
        conn.open().await?;
        if let Err(err) = conn.register(event_types).await {
            conn.close();
            return Err(err.into());
        }
        Ok(ControlConnection {
            conn,
            address: address.ip(),
            error_receiver,
        })
    }

    /// Tries the candidates in order; the first one that accepts the registration wins.
    /// Each attempt gets `attempt_timeout` to finish the handshake and the registration.
    /// Fails with the error of the last candidate tried.
    pub(super) async fn open_any(
        candidates: impl IntoIterator<Item = IpAddr>,
        port: u16,
        config: &ConnectionConfig,
        future_map: &Arc<FutureMap>,
        event_types: &[EventType],
        attempt_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let mut last_error = ConnectionError::Closed;
        for candidate in candidates {
            let address = SocketAddr::new(candidate, port);
            let attempt = Self::open(address, config.clone(), Arc::clone(future_map), event_types);
            let err = match tokio::time::timeout(attempt_timeout, attempt).await {
                Ok(Ok(control)) => {
                    debug!(%address, "Control connection registered");
                    return Ok(control);
                }
                Ok(Err(err)) => err,
                Err(_) => ConnectionError::SetupTimeout(attempt_timeout),
            };
            warn!(%address, error = %err, "Failed to register control connection");
            last_error = err;
        }
        Err(last_error)
    }

    pub(super) fn address(&self) -> IpAddr {
        self.address
    }

    pub(super) fn get_connect_address(&self) -> SocketAddr {
        self.conn.get_connect_address()
    }

    pub(super) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Resolves once the connection breaks. Must not be awaited again after it resolved.
    pub(super) async fn broken(&mut self) -> ConnectionError {
        (&mut self.error_receiver)
            .await
            .unwrap_or(ConnectionError::Closed)
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.conn.close();
    }
}

//! This module contains various errors which can be returned by the driver.

use std::sync::Arc;
use std::time::Duration;

pub use cassandra_cql::errors::{DbError, WriteType};

use cassandra_cql::frame::frame_errors::{FrameError, ParseError};
use cassandra_cql::frame::response::Error as CqlError;
use cassandra_cql::frame::Compression;
use thiserror::Error;

use crate::authentication::AuthError;
use crate::routing::partitioner::PartitionerName;

/// An error that occurred while opening a connection or after it had been opened.
///
/// Cheaply clonable, because one failure of a connection has to be delivered
/// to every request waiting on it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Input/Output error has occurred, e.g. the TCP connect was refused.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The node did not accept the connection within the connect timeout.
    #[error("Connect timeout elapsed after {0:?}")]
    ConnectTimeout(Duration),

    /// The node accepted the connection but the handshake or event registration
    /// did not finish in time.
    #[error("Connection setup did not finish within {0:?}")]
    SetupTimeout(Duration),

    /// Database sent an ERROR response during the handshake.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The server requested authentication and no authenticator was configured.
    #[error("Server requested authentication with {0}, but no authenticator was configured")]
    MissingAuthentication(String),

    /// The authenticator rejected the exchange.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthError),

    /// The server does not list the requested compression in its SUPPORTED response.
    #[error("Compression {0} is not supported by the node")]
    CompressionNotSupported(Compression),

    /// The server answered a handshake request with an unexpected response.
    #[error("Unexpected response during connection setup: {0}")]
    UnexpectedResponse(&'static str),

    /// A response could not be parsed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Keyspace requested for the connection has an invalid name.
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The connection broke after being opened.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The connection was closed explicitly.
    #[error("Connection was closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(io_error: std::io::Error) -> ConnectionError {
        ConnectionError::IoError(Arc::new(io_error))
    }
}

impl From<FrameError> for ConnectionError {
    fn from(frame_error: FrameError) -> ConnectionError {
        ConnectionError::InvalidMessage(format!("Frame error: {}", frame_error))
    }
}

impl From<ParseError> for ConnectionError {
    fn from(parse_error: ParseError) -> ConnectionError {
        ConnectionError::InvalidMessage(format!("Error parsing message: {}", parse_error))
    }
}

impl From<CqlError> for ConnectionError {
    fn from(error: CqlError) -> ConnectionError {
        ConnectionError::DbError(error.error, error.reason)
    }
}

impl From<RequestAttemptError> for ConnectionError {
    fn from(error: RequestAttemptError) -> ConnectionError {
        match error {
            RequestAttemptError::DbError(err, msg) => ConnectionError::DbError(err, msg),
            RequestAttemptError::ConnectionError(err) => err,
            RequestAttemptError::BrokenConnection(err) => ConnectionError::BrokenConnection(err),
            RequestAttemptError::UnexpectedResponse(what) => {
                ConnectionError::UnexpectedResponse(what)
            }
            other => ConnectionError::InvalidMessage(other.to_string()),
        }
    }
}

/// Reason for which an open connection stopped working.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Failed to read a frame from the socket.
    #[error("Failed to read a frame: {0}")]
    FrameReadError(Arc<FrameError>),

    /// Failed to write a request to the socket.
    #[error("Failed to write a request: {0}")]
    WriteError(Arc<std::io::Error>),

    /// A pushed event could not be parsed.
    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(String),

    /// The channel to the router task was closed.
    #[error("The connection router is gone")]
    ChannelError,

    /// The server closed the connection.
    #[error("Connection closed by the node")]
    ClosedByPeer,
}

/// An error that broke an established connection.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {kind}")]
pub struct BrokenConnectionError {
    kind: BrokenConnectionErrorKind,
}

impl BrokenConnectionError {
    /// Reason of the breakage.
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.kind
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError { kind }
    }
}

/// An error of a single attempt of sending a request to one node.
///
/// The retry policy decides, based on this error, whether another attempt is made.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Could not open a connection to the node.
    #[error("Failed to open connection: {0}")]
    ConnectionError(#[from] ConnectionError),

    /// The connection broke while the request was in flight.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The connection has not finished its handshake yet.
    #[error("Connection is not yet open")]
    NotYetOpen,

    /// The connection was closed before the request was sent.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// All stream ids of the connection are in use.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// No response arrived before the request deadline.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Received a response of a kind that was not expected for the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl From<CqlError> for RequestAttemptError {
    fn from(error: CqlError) -> RequestAttemptError {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

impl From<FrameError> for RequestAttemptError {
    fn from(frame_error: FrameError) -> RequestAttemptError {
        RequestAttemptError::InvalidMessage(format!("Frame error: {}", frame_error))
    }
}

impl From<ParseError> for RequestAttemptError {
    fn from(parse_error: ParseError) -> RequestAttemptError {
        RequestAttemptError::InvalidMessage(format!("Error parsing message: {}", parse_error))
    }
}

impl From<FutureMapError> for RequestAttemptError {
    fn from(error: FutureMapError) -> RequestAttemptError {
        match error {
            FutureMapError::UnableToAllocStreamId => RequestAttemptError::UnableToAllocStreamId,
            FutureMapError::Timeout(deadline) => RequestAttemptError::RequestTimeout(deadline),
            FutureMapError::ConnectionFailed(err) => match err {
                ConnectionError::BrokenConnection(broken) => {
                    RequestAttemptError::BrokenConnection(broken)
                }
                ConnectionError::Closed => RequestAttemptError::ConnectionClosed,
                other => RequestAttemptError::ConnectionError(other),
            },
        }
    }
}

/// Error of a whole logical request, after the retry policy gave up.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The routing policy returned no candidate endpoints.
    #[error("Empty query plan: no endpoint to send the request to")]
    EmptyPlan,

    /// The last attempt failed and no further attempt was allowed.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// The cluster lost its control connection and could not re-establish it.
    #[error("Cluster is unavailable: no node could be reached to re-register for events")]
    ClusterUnavailable,

    /// A blocking call did not complete before the deadline.
    #[error("Request timeout: no result after {0:?}")]
    RequestTimeout(Duration),

    /// Keyspace passed to the request has an invalid name.
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// Error that occurred during [`Cluster`](crate::cluster::Cluster) creation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewClusterError {
    /// None of the seeds could be connected to.
    #[error("Could not connect to any seed, last error: {0}")]
    NoAvailablePeers(ConnectionError),

    /// Bootstrap metadata could not be read.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    /// The configuration is unusable.
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
}

/// An error of reading the cluster metadata from the system tables.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// A query to a system table failed.
    #[error("Failed to query {table}: {error}")]
    Query {
        /// Queried table.
        table: &'static str,
        /// Reason of the failure.
        error: RequestAttemptError,
    },

    /// A row of a system table could not be interpreted.
    #[error("Bad row in {table}: {reason}")]
    BadRow {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong with the row.
        reason: String,
    },

    /// `system.local` returned no row.
    #[error("system.local returned no rows")]
    MissingLocalRow,

    /// The partitioner class reported by the node is unknown.
    #[error("Unknown partitioner: {0}")]
    UnknownPartitioner(String),

    /// A stored token could not be parsed.
    #[error(transparent)]
    TokenParseError(#[from] TokenParseError),

    /// A keyspace's replication options could not be interpreted.
    #[error("Bad replication of keyspace {keyspace}: {error}")]
    Replication {
        /// Keyspace name.
        keyspace: String,
        /// What was wrong with its options.
        error: ReplicationStrategyError,
    },

    /// The system tables were not read within the request deadline.
    #[error("Reading metadata timed out after {0:?}")]
    Timeout(Duration),
}

/// A token in the textual form stored in the system tables could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid token {token:?} for {partitioner}")]
pub struct TokenParseError {
    /// Partitioner the token was parsed for.
    pub partitioner: PartitionerName,
    /// The offending text.
    pub token: String,
}

/// Replication options of a keyspace could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicationStrategyError {
    /// The options are not a JSON object of strings.
    #[error("Strategy options are not a JSON map: {0}")]
    BadOptions(String),

    /// The mandatory `replication_factor` option is absent.
    #[error("Missing replication_factor option")]
    MissingReplicationFactor,

    /// A replication factor is not a non-negative integer.
    #[error("Invalid replication factor {value:?} for {key}")]
    BadReplicationFactor {
        /// Option name (`replication_factor` or a datacenter).
        key: String,
        /// The offending value.
        value: String,
    },
}

/// Invalid keyspace name given to a session or a statement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Invalid cluster configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// There needs to be at least one seed to connect to.
    #[error("Empty seed list")]
    EmptySeedList,

    /// A seed could not be parsed as an address.
    #[error("Invalid seed address: {0}")]
    BadSeed(String),
}

/// Failure of a pending request tracked by the future map.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FutureMapError {
    /// Every stream id of the connection is taken by a pending request.
    #[error("Unable to allocate stream id: all 128 streams are in use")]
    UnableToAllocStreamId,

    /// The request was swept after waiting longer than the deadline.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The connection carrying the request failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassandra_cql::Consistency;

    #[test]
    fn dberror_full_info() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };

        let attempt_error =
            RequestAttemptError::DbError(db_error, "a message about unavailable error".to_string());

        let mut expected = "Database returned an error: ".to_string();
        expected += "Cannot achieve consistency Three: 2 replicas alive, 3 required";
        expected += ", Error message: a message about unavailable error";

        assert_eq!(attempt_error.to_string(), expected);
    }

    #[test]
    fn future_map_errors_map_onto_attempt_errors() {
        assert!(matches!(
            RequestAttemptError::from(FutureMapError::UnableToAllocStreamId),
            RequestAttemptError::UnableToAllocStreamId
        ));
        assert!(matches!(
            RequestAttemptError::from(FutureMapError::ConnectionFailed(ConnectionError::Closed)),
            RequestAttemptError::ConnectionClosed
        ));
        let broken: BrokenConnectionError = BrokenConnectionErrorKind::ClosedByPeer.into();
        assert!(matches!(
            RequestAttemptError::from(FutureMapError::ConnectionFailed(broken.into())),
            RequestAttemptError::BrokenConnection(_)
        ));
    }
}

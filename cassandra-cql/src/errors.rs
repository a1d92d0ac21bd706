//! Errors reported by the server in ERROR responses.

use crate::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// Error codes of an ERROR response in protocol v2, with the extra fields
/// some of them carry.
///
/// Codes `0x1xxx` are raised while executing a request; the coordinator may
/// succeed on another attempt. Codes `0x2xxx` mean the request itself is wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// `0x0000`: the server failed unexpectedly.
    #[error("Server error")]
    ServerError,

    /// `0x000A`: the server could not make sense of a frame.
    #[error("Protocol error")]
    ProtocolError,

    /// `0x0100`: the credentials were rejected.
    #[error("Bad credentials")]
    AuthenticationError,

    /// `0x1000`: the coordinator knows too few live replicas for the consistency level.
    #[error(
        "Cannot achieve consistency {consistency}: \
        {alive} replicas alive, {required} required"
    )]
    Unavailable {
        consistency: Consistency,
        /// Replicas the consistency level needs.
        required: i32,
        /// Replicas the coordinator believes to be alive.
        alive: i32,
    },

    /// `0x1001`: the coordinator refused the request under load.
    #[error("Coordinator is overloaded")]
    Overloaded,

    /// `0x1002`: the coordinator has not finished joining the ring.
    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    /// `0x1003`: a TRUNCATE did not complete on every replica.
    #[error("Truncate failed")]
    TruncateError,

    /// `0x1100`: too few replicas acknowledged a write in time.
    #[error(
        "Write timed out at consistency {consistency}: \
        {received} of {required} acknowledgements, write type {write_type}"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// `0x1200`: too few replicas answered a read in time.
    #[error(
        "Read timed out at consistency {consistency}: \
        {received} of {required} responses, data present: {data_present}"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Whether the replica asked for the data (not a digest) answered.
        data_present: bool,
    },

    /// `0x2000`
    #[error("Syntax error in CQL statement")]
    SyntaxError,

    /// `0x2100`: the logged-in user lacks a permission.
    #[error("Unauthorized")]
    Unauthorized,

    /// `0x2200`: the statement parses but cannot be executed.
    #[error("Invalid statement")]
    Invalid,

    /// `0x2300`: the statement conflicts with the server configuration.
    #[error("Configuration error")]
    ConfigError,

    /// `0x2400`: CREATE of an existing keyspace or table. `table` is empty for a keyspace.
    #[error("Already exists: keyspace {keyspace:?}, table {table:?}")]
    AlreadyExists { keyspace: String, table: String },

    /// `0x2500`: EXECUTE of an id the node does not know; the statement has
    /// to be prepared on that node again.
    #[error("Unknown prepared statement id {statement_id:?}")]
    Unprepared { statement_id: Bytes },

    /// A code this version of the protocol does not define.
    #[error("Unknown error code {0:#06x}")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// `writeType` of a write timeout, telling what kind of write was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// A single non-counter write.
    Simple,
    /// A logged batch whose batch log was written.
    Batch,
    UnloggedBatch,
    Counter,
    /// A logged batch that timed out writing the batch log itself.
    BatchLog,
    Cas,
    /// A name this crate does not know.
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::Other(write_type) => write_type.as_str(),
        }
    }
}

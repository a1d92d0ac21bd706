//! Result of a QUERY or EXECUTE request.

use std::net::SocketAddr;

use cassandra_cql::frame::response::event::SchemaChangeType;
use cassandra_cql::frame::response::result::{self, Row, Rows, SchemaChange};
use uuid::Uuid;

/// Result of a single request, together with the node that served it.
#[derive(Debug)]
pub struct QueryResult {
    result: result::Result,
    tracing_id: Option<Uuid>,
    coordinator: SocketAddr,
}

impl QueryResult {
    pub(crate) fn new(result: result::Result, tracing_id: Option<Uuid>, coordinator: SocketAddr) -> Self {
        Self {
            result,
            tracing_id,
            coordinator,
        }
    }

    /// Address of the connection the response came from.
    #[inline]
    pub fn coordinator(&self) -> SocketAddr {
        self.coordinator
    }

    /// Tracing id of the request, if tracing was requested.
    #[inline]
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Whether the request returned nothing, e.g. an INSERT.
    pub fn is_void(&self) -> bool {
        matches!(self.result, result::Result::Void)
    }

    /// Rows returned by a SELECT.
    pub fn rows(&self) -> Option<&Rows> {
        match &self.result {
            result::Result::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Consumes the result, returning its rows if it has any.
    pub fn into_rows(self) -> Option<Rows> {
        match self.result {
            result::Result::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Shortcut for the first row of a SELECT.
    pub fn first_row(&self) -> Option<&Row> {
        self.rows().and_then(|rows| rows.rows.first())
    }

    /// Keyspace switched to by a `USE` statement.
    pub fn set_keyspace(&self) -> Option<&str> {
        match &self.result {
            result::Result::SetKeyspace(set) => Some(&set.keyspace_name),
            _ => None,
        }
    }

    /// Schema modification made by a DDL statement.
    pub fn schema_change(&self) -> Option<&SchemaChange> {
        match &self.result {
            result::Result::SchemaChange(change) => Some(change),
            _ => None,
        }
    }

    /// Whether the statement created, altered or dropped a schema object.
    pub fn is_schema_change(&self, change_type: SchemaChangeType) -> bool {
        self.schema_change()
            .is_some_and(|change| change.change_type == change_type)
    }

    /// The raw result.
    pub fn result(&self) -> &result::Result {
        &self.result
    }
}

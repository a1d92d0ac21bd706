//! Statements executed by a [`Session`](crate::client::session::Session).

pub mod prepared;
pub mod query;

use bytes::Bytes;
use cassandra_cql::frame::request::QueryParameters;

pub use cassandra_cql::frame::types::{Consistency, SerialConsistency};
pub use prepared::PreparedStatement;
pub use query::Query;

use crate::policies::load_balancing::RoutingInfo;

/// Page size used unless a statement sets its own.
pub const DEFAULT_PAGE_SIZE: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) page_size: Option<i32>,
}

impl Default for StatementConfig {
    fn default() -> Self {
        StatementConfig {
            consistency: Consistency::Quorum,
            serial_consistency: Some(SerialConsistency::Serial),
            page_size: Some(DEFAULT_PAGE_SIZE),
        }
    }
}

impl StatementConfig {
    pub(crate) fn parameters(&self, values: &[Option<Bytes>]) -> QueryParameters {
        QueryParameters {
            consistency: self.consistency,
            serial_consistency: self.serial_consistency,
            skip_metadata: false,
            page_size: self.page_size,
            paging_state: None,
            values: values.to_vec(),
        }
    }
}

/// Anything a session can execute.
#[derive(Debug, Clone)]
pub enum Statement {
    /// Plain CQL text.
    Query(Query),
    /// A statement prepared earlier, with its bound values.
    Prepared(PreparedStatement),
}

impl Statement {
    /// Information used by token-aware routing.
    pub fn routing_info(&self) -> RoutingInfo<'_> {
        match self {
            Statement::Query(query) => RoutingInfo {
                consistency: query.get_consistency(),
                keyspace: query.get_keyspace(),
                routing_key: query.get_routing_key(),
            },
            Statement::Prepared(prepared) => RoutingInfo {
                consistency: prepared.get_consistency(),
                keyspace: prepared.get_keyspace(),
                routing_key: prepared.get_routing_key(),
            },
        }
    }

    /// The CQL text of the statement.
    pub fn contents(&self) -> &str {
        match self {
            Statement::Query(query) => query.get_contents(),
            Statement::Prepared(prepared) => prepared.get_statement(),
        }
    }
}

impl From<Query> for Statement {
    fn from(query: Query) -> Self {
        Statement::Query(query)
    }
}

impl From<PreparedStatement> for Statement {
    fn from(prepared: PreparedStatement) -> Self {
        Statement::Prepared(prepared)
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Self {
        Statement::Query(Query::new(contents))
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Self {
        Statement::Query(Query::new(contents))
    }
}

use bytes::Bytes;
use cassandra_cql::frame::request::Execute;
use cassandra_cql::frame::response::result::ResultMetadata;
use std::sync::Arc;

use super::{Consistency, SerialConsistency, StatementConfig};

/// Represents a statement prepared on the server.
///
/// The driver keeps the id of every prepared statement together with its text, so
/// that a node which answers `UNPREPARED` can be given the statement again.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    statement: Arc<str>,
    metadata: Arc<ResultMetadata>,
    values: Vec<Option<Bytes>>,
    config: StatementConfig,
    keyspace: Option<String>,
    routing_key: Option<Bytes>,
}

impl PreparedStatement {
    pub(crate) fn new(id: Bytes, statement: impl Into<Arc<str>>, metadata: ResultMetadata) -> Self {
        // Bind markers of a single-table statement all come from that table.
        let keyspace = metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.ks_name.clone());
        Self {
            id,
            statement: statement.into(),
            metadata: Arc::new(metadata),
            values: Vec::new(),
            config: StatementConfig::default(),
            keyspace,
            routing_key: None,
        }
    }

    /// Statement id assigned by the server.
    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    /// Text of the prepared statement.
    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    /// Metadata of the bind markers.
    pub fn get_prepared_metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Returns a copy of the statement with the given serialized values bound.
    pub fn bind(&self, values: Vec<Option<Bytes>>) -> Self {
        Self {
            values,
            ..self.clone()
        }
    }

    /// Serialized bound values.
    pub fn get_values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = c;
    }

    /// Gets the consistency to be used when executing this statement.
    pub fn get_consistency(&self) -> Consistency {
        self.config.consistency
    }

    /// Sets the serial consistency used by conditional updates.
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    /// Sets the page size for this statement.
    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(page_size > 0, "page size must be larger than 0");
        self.config.page_size = Some(page_size);
    }

    /// Sets the serialized partition key used by token-aware routing.
    pub fn set_routing_key(&mut self, routing_key: Bytes) {
        self.routing_key = Some(routing_key);
    }

    /// Overrides the keyspace used by token-aware routing.
    pub fn set_keyspace(&mut self, keyspace: impl Into<String>) {
        self.keyspace = Some(keyspace.into());
    }

    /// Keyspace the statement operates on, as reported when it was prepared.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// Routing key, if set.
    pub fn get_routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    pub(crate) fn to_request(&self) -> Execute {
        Execute {
            id: self.id.clone(),
            parameters: self.config.parameters(&self.values),
        }
    }
}

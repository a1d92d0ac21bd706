use bytes::Bytes;
use cassandra_cql::frame::request;

use super::{Consistency, SerialConsistency, StatementConfig};

/// CQL query statement.
///
/// This represents a CQL query that can be executed on a server,
/// along with the already serialized values of its bind markers.
#[derive(Debug, Clone)]
pub struct Query {
    contents: String,
    values: Vec<Option<Bytes>>,
    config: StatementConfig,
    keyspace: Option<String>,
    routing_key: Option<Bytes>,
}

impl Query {
    /// Creates a new `Query` from a CQL query string.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            values: Vec::new(),
            config: StatementConfig::default(),
            keyspace: None,
            routing_key: None,
        }
    }

    /// Returns the string representation of the CQL query.
    pub fn get_contents(&self) -> &str {
        &self.contents
    }

    /// Sets serialized values of the bind markers, in order. `None` is a CQL `null`.
    pub fn with_values(mut self, values: Vec<Option<Bytes>>) -> Self {
        self.values = values;
        self
    }

    /// Serialized values of the bind markers.
    pub fn get_values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Sets the page size for this CQL query.
    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(page_size > 0, "page size must be larger than 0");
        self.config.page_size = Some(page_size);
    }

    /// Disables paging for this CQL query.
    pub fn disable_paging(&mut self) {
        self.config.page_size = None;
    }

    /// Returns the page size for this CQL query.
    pub fn get_page_size(&self) -> Option<i32> {
        self.config.page_size
    }

    /// Sets the consistency to be used when executing this query.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = c;
    }

    /// Gets the consistency to be used when executing this query.
    pub fn get_consistency(&self) -> Consistency {
        self.config.consistency
    }

    /// Sets the serial consistency used by conditional updates.
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    /// Gets the serial consistency used by conditional updates.
    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency
    }

    /// Tells token-aware routing where the partition touched by the query lives.
    ///
    /// `routing_key` is the serialized partition key, as the partitioner hashes it.
    pub fn set_routing(&mut self, keyspace: impl Into<String>, routing_key: Bytes) {
        self.keyspace = Some(keyspace.into());
        self.routing_key = Some(routing_key);
    }

    /// Keyspace used for routing, if set.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// Routing key, if set.
    pub fn get_routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    pub(crate) fn to_request(&self) -> request::Query {
        request::Query {
            contents: self.contents.clone(),
            parameters: self.config.parameters(&self.values),
        }
    }
}

impl From<String> for Query {
    fn from(s: String) -> Query {
        Query::new(s)
    }
}

impl<'a> From<&'a str> for Query {
    fn from(s: &'a str) -> Query {
        Query::new(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_request() {
        let mut query = Query::new("SELECT * FROM ks.t WHERE k = ?")
            .with_values(vec![Some(Bytes::from_static(b"key")), None]);
        assert_eq!(query.get_consistency(), Consistency::Quorum);
        assert_eq!(query.get_serial_consistency(), Some(SerialConsistency::Serial));
        assert_eq!(query.get_page_size(), Some(1000));

        query.set_consistency(Consistency::One);
        query.disable_paging();
        let request = query.to_request();
        assert_eq!(request.contents, "SELECT * FROM ks.t WHERE k = ?");
        assert_eq!(request.parameters.consistency, Consistency::One);
        assert_eq!(request.parameters.page_size, None);
        assert_eq!(request.parameters.values.len(), 2);
    }

    #[test]
    fn routing_is_opt_in() {
        let mut query = Query::from("INSERT INTO t (k) VALUES (1)");
        assert!(query.get_keyspace().is_none());
        query.set_routing("ks", Bytes::from_static(b"\x00\x00\x00\x01"));
        assert_eq!(query.get_keyspace(), Some("ks"));
        assert_eq!(query.get_routing_key(), Some(&b"\x00\x00\x00\x01"[..]));
    }
}

//! Reading the cluster metadata from the system tables of a node.

use cassandra_cql::frame::response::cql_to_rust::FromCqlVal;
use cassandra_cql::frame::response::result::{Row, Rows};
use std::net::IpAddr;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{KeyspaceMetadata, PeerRecord};
use crate::errors::MetadataError;
use crate::network::Connection;
use crate::routing::locator::ReplicationStrategy;
use crate::routing::partitioner::PartitionerName;

const LOCAL_TABLE: &str = "system.local";
const PEERS_TABLE: &str = "system.peers";
const KEYSPACES_TABLE: &str = "system.schema_keyspaces";
const TABLES_TABLE: &str = "system.schema_columnfamilies";

const LOCAL_QUERY: &str = "SELECT cluster_name, data_center, rack, host_id, partitioner, \
    release_version, schema_version, tokens FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT peer, data_center, rack, host_id, rpc_address, \
    release_version, schema_version, tokens FROM system.peers";
const KEYSPACES_QUERY: &str = "SELECT keyspace_name, durable_writes, strategy_class, \
    strategy_options FROM system.schema_keyspaces";
const TABLES_QUERY: &str =
    "SELECT keyspace_name, columnfamily_name FROM system.schema_columnfamilies";

/// Everything read from the system tables in one go.
#[derive(Debug, Clone)]
pub(crate) struct Metadata {
    pub(crate) cluster_name: Option<String>,
    pub(crate) partitioner: PartitionerName,
    /// The queried node first, then its peers.
    pub(crate) peers: Vec<PeerRecord>,
    pub(crate) keyspaces: Vec<KeyspaceMetadata>,
}

/// Identity of the cluster and of the queried node, from `system.local`.
#[derive(Debug, Clone)]
pub(crate) struct LocalInfo {
    pub(crate) cluster_name: Option<String>,
    pub(crate) partitioner: PartitionerName,
    pub(crate) peer: PeerRecord,
}

/// Reads the whole topology and schema through `connection`, which is connected to
/// the node listening on `local_address`.
pub(crate) async fn read_metadata(
    connection: &Connection,
    local_address: IpAddr,
) -> Result<Metadata, MetadataError> {
    let local = query_local(connection, local_address).await?;
    let mut peers = vec![local.peer];
    peers.extend(
        query_peers(connection, local.partitioner)
            .await?
            .into_iter()
            .filter(|peer| peer.address != local_address),
    );

    let mut keyspaces = query_keyspaces(connection, None).await?;
    for (keyspace, table) in query_tables(connection, None).await? {
        match keyspaces.iter_mut().find(|ks| ks.name == keyspace) {
            Some(ks) => {
                ks.tables.insert(table);
            }
            None => debug!(keyspace, table, "Table of an unknown keyspace"),
        }
    }

    Ok(Metadata {
        cluster_name: local.cluster_name,
        partitioner: local.partitioner,
        peers,
        keyspaces,
    })
}

pub(crate) async fn query_local(
    connection: &Connection,
    local_address: IpAddr,
) -> Result<LocalInfo, MetadataError> {
    let rows = query_rows(connection, LOCAL_TABLE, LOCAL_QUERY).await?;
    let row = rows.rows.first().ok_or(MetadataError::MissingLocalRow)?;

    let partitioner_class: String = get(&rows, row, LOCAL_TABLE, "partitioner")?;
    let partitioner = PartitionerName::from_class_name(&partitioner_class)
        .ok_or(MetadataError::UnknownPartitioner(partitioner_class))?;

    let tokens: Vec<String> = get(&rows, row, LOCAL_TABLE, "tokens")?;
    let peer = PeerRecord {
        datacenter: get(&rows, row, LOCAL_TABLE, "data_center")?,
        rack: get(&rows, row, LOCAL_TABLE, "rack")?,
        host_id: get(&rows, row, LOCAL_TABLE, "host_id")?,
        schema_version: get(&rows, row, LOCAL_TABLE, "schema_version")?,
        release_version: get(&rows, row, LOCAL_TABLE, "release_version")?,
        tokens: tokens
            .iter()
            .map(|token| partitioner.parse_token(token))
            .collect::<Result<_, _>>()?,
        ..PeerRecord::new(local_address)
    };

    Ok(LocalInfo {
        cluster_name: get(&rows, row, LOCAL_TABLE, "cluster_name")?,
        partitioner,
        peer,
    })
}

/// Reads `system.peers`. Peers whose tokens cannot be parsed are skipped.
pub(crate) async fn query_peers(
    connection: &Connection,
    partitioner: PartitionerName,
) -> Result<Vec<PeerRecord>, MetadataError> {
    let rows = query_rows(connection, PEERS_TABLE, PEERS_QUERY).await?;
    let mut peers = Vec::with_capacity(rows.rows.len());
    for row in &rows.rows {
        let peer_address: IpAddr = get(&rows, row, PEERS_TABLE, "peer")?;
        // Nodes listening on every interface report the wildcard as their rpc address.
        let address = match get::<Option<IpAddr>>(&rows, row, PEERS_TABLE, "rpc_address")? {
            Some(rpc_address) if !rpc_address.is_unspecified() => rpc_address,
            _ => peer_address,
        };

        let tokens: Vec<String> = get(&rows, row, PEERS_TABLE, "tokens")?;
        let tokens = match tokens
            .iter()
            .map(|token| partitioner.parse_token(token))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(%address, error = %err, "Skipping peer with unparsable tokens");
                continue;
            }
        };

        let host_id: Option<Uuid> = get(&rows, row, PEERS_TABLE, "host_id")?;
        peers.push(PeerRecord {
            datacenter: get(&rows, row, PEERS_TABLE, "data_center")?,
            rack: get(&rows, row, PEERS_TABLE, "rack")?,
            host_id,
            schema_version: get(&rows, row, PEERS_TABLE, "schema_version")?,
            release_version: get(&rows, row, PEERS_TABLE, "release_version")?,
            tokens,
            ..PeerRecord::new(address)
        });
    }
    Ok(peers)
}

/// Reads the keyspaces, or the one named `only`. Their table sets are empty.
///
/// Reading all keyspaces skips those with unusable replication options; reading
/// a single one fails instead.
pub(crate) async fn query_keyspaces(
    connection: &Connection,
    only: Option<&str>,
) -> Result<Vec<KeyspaceMetadata>, MetadataError> {
    let query = match only {
        Some(keyspace) => format!("{} WHERE keyspace_name={}", KEYSPACES_QUERY, quote(keyspace)),
        None => KEYSPACES_QUERY.to_owned(),
    };
    let rows = query_rows(connection, KEYSPACES_TABLE, &query).await?;

    let mut keyspaces = Vec::with_capacity(rows.rows.len());
    for row in &rows.rows {
        let name: String = get(&rows, row, KEYSPACES_TABLE, "keyspace_name")?;
        if only.is_some_and(|only| only != name) {
            continue;
        }
        let durable_writes: Option<bool> = get(&rows, row, KEYSPACES_TABLE, "durable_writes")?;
        let class: String = get(&rows, row, KEYSPACES_TABLE, "strategy_class")?;
        let options: Option<String> = get(&rows, row, KEYSPACES_TABLE, "strategy_options")?;

        let strategy = match ReplicationStrategy::from_schema(&class, options.as_deref().unwrap_or("{}")) {
            Ok(strategy) => strategy,
            Err(error) => {
                let error = MetadataError::Replication {
                    keyspace: name,
                    error,
                };
                if only.is_some() {
                    return Err(error);
                }
                warn!(%error, "Skipping keyspace");
                continue;
            }
        };

        keyspaces.push(KeyspaceMetadata {
            durable_writes: durable_writes.unwrap_or(true),
            ..KeyspaceMetadata::new(name, strategy)
        });
    }
    Ok(keyspaces)
}

/// Reads (keyspace, table) pairs, optionally of one keyspace only.
pub(crate) async fn query_tables(
    connection: &Connection,
    keyspace: Option<&str>,
) -> Result<Vec<(String, String)>, MetadataError> {
    let query = match keyspace {
        Some(keyspace) => format!("{} WHERE keyspace_name={}", TABLES_QUERY, quote(keyspace)),
        None => TABLES_QUERY.to_owned(),
    };
    let rows = query_rows(connection, TABLES_TABLE, &query).await?;

    let mut tables = Vec::with_capacity(rows.rows.len());
    for row in &rows.rows {
        let table_keyspace: String = get(&rows, row, TABLES_TABLE, "keyspace_name")?;
        if keyspace.is_some_and(|keyspace| keyspace != table_keyspace) {
            continue;
        }
        tables.push((
            table_keyspace,
            get(&rows, row, TABLES_TABLE, "columnfamily_name")?,
        ));
    }
    Ok(tables)
}

async fn query_rows(
    connection: &Connection,
    table: &'static str,
    contents: &str,
) -> Result<Rows, MetadataError> {
    let result = connection
        .query_single_page(contents)
        .await
        .map_err(|error| MetadataError::Query { table, error })?;
    result.into_rows().ok_or_else(|| MetadataError::BadRow {
        table,
        reason: "query did not return rows".to_owned(),
    })
}

fn get<T: FromCqlVal>(
    rows: &Rows,
    row: &Row,
    table: &'static str,
    column: &str,
) -> Result<T, MetadataError> {
    rows.get(row, column).map_err(|err| MetadataError::BadRow {
        table,
        reason: format!("{}: {}", column, err),
    })
}

// CQL string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionConfig, FutureMap};
    use crate::routing::Token;
    use crate::utils::test_utils::{
        ip, setup_tracing, FakeCluster, NodeSpec, Reply, SystemTables,
    };
    use assert_matches::assert_matches;
    use cassandra_cql::errors::DbError;
    use cassandra_cql::frame::request::Request;
    use cassandra_cql::frame::response::result;
    use std::sync::Arc;
    use std::time::Duration;

    fn tables() -> SystemTables {
        SystemTables {
            nodes: vec![
                NodeSpec::new(1, "dc1", "r1", &[-100, 100]),
                NodeSpec::new(2, "dc1", "r2", &[0]),
                NodeSpec::new(3, "dc2", "r1", &[50]),
            ],
            ..Default::default()
        }
        .with_keyspace(
            "ks",
            "org.apache.cassandra.locator.NetworkTopologyStrategy",
            r#"{"dc1":"2","dc2":"1"}"#,
        )
        .with_keyspace("broken", "SimpleStrategy", "{}")
        .with_table("ks", "t1")
        .with_table("ks", "t2")
        .with_table("ghost", "t")
    }

    async fn connect(cluster: &FakeCluster, index: u8) -> Connection {
        let (connection, _) = Connection::new(
            cluster.address(index),
            ConnectionConfig::default(),
            Arc::new(FutureMap::new(Duration::from_secs(5))),
        );
        connection.open().await.unwrap();
        connection
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn reads_topology_and_schema() {
        setup_tracing();
        let cluster = FakeCluster::start(tables()).await;
        let connection = connect(&cluster, 1).await;

        let metadata = read_metadata(&connection, ip(1)).await.unwrap();
        assert_eq!(metadata.cluster_name.as_deref(), Some("Test Cluster"));
        assert_eq!(metadata.partitioner, PartitionerName::Murmur3);

        let addresses: Vec<IpAddr> = metadata.peers.iter().map(|peer| peer.address).collect();
        assert_eq!(addresses, vec![ip(1), ip(2), ip(3)]);
        let local = &metadata.peers[0];
        assert_eq!(local.datacenter.as_deref(), Some("dc1"));
        assert_eq!(local.rack.as_deref(), Some("r1"));
        assert_eq!(local.host_id, Some(Uuid::from_u128(1)));
        assert_eq!(local.release_version.as_deref(), Some("2.0.9"));
        let mut tokens = local.tokens.clone();
        tokens.sort();
        assert_eq!(tokens, vec![Token::Murmur3(-100), Token::Murmur3(100)]);
        assert!(metadata.peers.iter().all(PeerRecord::is_up));
        assert_eq!(metadata.peers[2].datacenter.as_deref(), Some("dc2"));

        // The keyspace without a replication factor is skipped.
        assert_eq!(metadata.keyspaces.len(), 1);
        let ks = &metadata.keyspaces[0];
        assert_eq!(ks.name, "ks");
        assert_matches!(
            &ks.strategy,
            ReplicationStrategy::NetworkTopologyStrategy { datacenter_repfactors }
                if datacenter_repfactors["dc1"] == 2 && datacenter_repfactors["dc2"] == 1
        );
        assert_eq!(
            ks.tables.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn single_keyspace_reads_filter_and_fail_loudly() {
        setup_tracing();
        let cluster = FakeCluster::start(tables()).await;
        let connection = connect(&cluster, 2).await;

        let keyspaces = query_keyspaces(&connection, Some("ks")).await.unwrap();
        assert_eq!(keyspaces.len(), 1);
        assert!(query_keyspaces(&connection, Some("missing"))
            .await
            .unwrap()
            .is_empty());
        assert_matches!(
            query_keyspaces(&connection, Some("broken")).await,
            Err(MetadataError::Replication { keyspace, .. }) if keyspace == "broken"
        );

        let tables = query_tables(&connection, Some("ks")).await.unwrap();
        assert_eq!(tables.len(), 2);

        let statement = cluster.count(|request| {
            matches!(request, Request::Query(q) if q.contents.contains("WHERE keyspace_name='ks'"))
        });
        assert_eq!(statement, 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn missing_local_row_and_query_errors() {
        setup_tracing();
        let cluster = FakeCluster::start_with(tables(), |index, request| match request {
            Request::Query(q) if index == 1 && q.contents.contains("system.local") => {
                Some(Reply::Error(DbError::Unauthorized, "no access"))
            }
            Request::Query(q) if index == 2 && q.contents.contains("system.local") => {
                Some(Reply::Result(result::Result::Rows(Rows::new(
                    "system",
                    "local",
                    vec![],
                    vec![],
                ))))
            }
            _ => None,
        })
        .await;

        let connection = connect(&cluster, 1).await;
        assert_matches!(
            read_metadata(&connection, ip(1)).await,
            Err(MetadataError::Query { table: "system.local", .. })
        );

        let connection = connect(&cluster, 2).await;
        assert_matches!(
            query_local(&connection, ip(2)).await,
            Err(MetadataError::MissingLocalRow)
        );
        // The other tables are still readable.
        assert_eq!(query_peers(&connection, PartitionerName::Murmur3).await.unwrap().len(), 2);
    }

    #[test]
    fn literals_are_quoted() {
        assert_eq!(quote("ks"), "'ks'");
        assert_eq!(quote("it's"), "'it''s'");
    }
}

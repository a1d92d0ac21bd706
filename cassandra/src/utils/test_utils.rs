//! Helpers shared by unit tests: tracing setup, topology builders and an
//! in-process node speaking the v2 protocol.

use bytes::Bytes;
use cassandra_cql::errors::DbError;
use cassandra_cql::frame::request::Request;
use cassandra_cql::frame::response::cql_to_rust::serialize_string_collection;
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::response::result::{
    self, ColumnType, Prepared, ResultMetadata, Row, Rows, SetKeyspace,
};
use cassandra_cql::frame::response::{Error as ErrorBody, ResponseOpcode};
use cassandra_cql::frame::server_event_type::EventType;
use cassandra_cql::frame::{self, types};
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{PeerRecord, TopologyDirectory, TopologySnapshot};
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Polls `condition` until it holds. Callers bound the wait with `ntest::timeout`.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// 127.0.0.n
pub(crate) fn ip(n: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
}

pub(crate) fn peer(n: u8, datacenter: &str, rack: &str, tokens: &[i64]) -> PeerRecord {
    PeerRecord {
        datacenter: Some(datacenter.to_owned()),
        rack: Some(rack.to_owned()),
        tokens: tokens.iter().copied().map(Token::murmur3).collect(),
        ..PeerRecord::new(ip(n))
    }
}

pub(crate) fn topology(peers: impl IntoIterator<Item = PeerRecord>) -> Arc<TopologySnapshot> {
    let directory = TopologyDirectory::new();
    directory.set_cluster_info(Some("Test Cluster".to_owned()), PartitionerName::Murmur3);
    for peer in peers {
        directory.add_peer(peer);
    }
    directory.snapshot()
}

/// What a [`FakeNode`] answers to a request.
#[derive(Debug)]
pub(crate) enum Reply {
    Ready,
    Supported(HashMap<String, Vec<String>>),
    Result(result::Result),
    Error(DbError, &'static str),
    Authenticate(String),
    AuthChallenge(Option<Vec<u8>>),
    AuthSuccess,
    /// Never answer.
    Silence,
    /// Drop the connection without answering.
    Close,
}

impl Reply {
    fn encode(self, stream: i8) -> Option<Vec<u8>> {
        let mut body = Vec::new();
        let opcode = match self {
            Reply::Silence | Reply::Close => return None,
            Reply::Ready => ResponseOpcode::Ready,
            Reply::Supported(options) => {
                types::write_string_multimap(&options, &mut body).unwrap();
                ResponseOpcode::Supported
            }
            Reply::Result(result) => {
                result.serialize(&mut body).unwrap();
                ResponseOpcode::Result
            }
            Reply::Error(error, reason) => {
                ErrorBody {
                    error,
                    reason: reason.to_owned(),
                }
                .serialize(&mut body)
                .unwrap();
                ResponseOpcode::Error
            }
            Reply::Authenticate(authenticator) => {
                types::write_string(&authenticator, &mut body).unwrap();
                ResponseOpcode::Authenticate
            }
            Reply::AuthChallenge(challenge) => {
                types::write_bytes_opt(challenge.as_deref(), &mut body).unwrap();
                ResponseOpcode::AuthChallenge
            }
            Reply::AuthSuccess => {
                types::write_bytes_opt(None, &mut body).unwrap();
                ResponseOpcode::AuthSuccess
            }
        };
        Some(frame::make_response_frame(stream, opcode, &body))
    }
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

struct NodeState {
    handler: Handler,
    requests: Mutex<Vec<Request>>,
    events: broadcast::Sender<Event>,
    connections: AtomicUsize,
}

/// A node listening on a local address, answering requests with a handler.
///
/// Pushed events reach only connections that registered for their type.
pub(crate) struct FakeNode {
    address: SocketAddr,
    state: Arc<NodeState>,
    stop: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl FakeNode {
    pub(crate) async fn start(
        handler: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> FakeNode {
        Self::start_at(SocketAddr::new(ip(1), 0), handler).await
    }

    pub(crate) async fn start_at(
        address: SocketAddr,
        handler: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> FakeNode {
        let listener = TcpListener::bind(address).await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(NodeState {
            handler: Arc::new(handler),
            requests: Mutex::new(Vec::new()),
            events,
            connections: AtomicUsize::new(0),
        });
        let (stop, stop_receiver) = watch::channel(false);
        let task = tokio::spawn(Self::listen(listener, Arc::clone(&state), stop_receiver));

        FakeNode {
            address,
            state,
            stop,
            listener: Mutex::new(Some(task)),
        }
    }

    /// An address nothing listens on.
    pub(crate) async fn unused_address() -> SocketAddr {
        let listener = TcpListener::bind(SocketAddr::new(ip(1), 0)).await.unwrap();
        listener.local_addr().unwrap()
    }

    pub(crate) fn default_reply(request: &Request) -> Reply {
        match request {
            Request::Options => Reply::Supported(HashMap::from([
                ("CQL_VERSION".to_owned(), vec![frame::CQL_VERSION.to_owned()]),
                ("COMPRESSION".to_owned(), vec!["snappy".to_owned()]),
            ])),
            Request::Startup(_) | Request::Register(_) => Reply::Ready,
            Request::Query(query) if query.contents.starts_with("USE ") => {
                Reply::Result(result::Result::SetKeyspace(SetKeyspace {
                    keyspace_name: query.contents[4..].trim_matches('"').to_owned(),
                }))
            }
            Request::Prepare(prepare) => Reply::Result(result::Result::Prepared(Prepared {
                id: Bytes::copy_from_slice(&Md5::digest(prepare.query.as_bytes())),
                prepared_metadata: ResultMetadata::default(),
                result_metadata: ResultMetadata::default(),
            })),
            Request::AuthResponse(_) => Reply::AuthSuccess,
            Request::Query(_) | Request::Execute(_) => Reply::Result(result::Result::Void),
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of received requests matching the predicate.
    pub(crate) fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| predicate(request))
            .count()
    }

    /// Number of accepted connections.
    pub(crate) fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn push_event(&self, event: Event) {
        let _ = self.state.events.send(event);
    }

    /// Stops listening and drops every connection.
    pub(crate) async fn stop(&self) {
        self.stop.send_replace(true);
        let task = self.listener.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn listen(listener: TcpListener, state: Arc<NodeState>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((socket, _)) = accepted else { break };
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(Self::serve(socket, Arc::clone(&state), stop.clone()));
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn serve(socket: TcpStream, state: Arc<NodeState>, mut stop: watch::Receiver<bool>) {
        let (mut read_half, mut write_half) = socket.into_split();
        let (frame_sender, mut frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                let frame = frame::read_request_frame(&mut read_half).await;
                let failed = frame.is_err();
                if frame_sender.send(frame).is_err() || failed {
                    break;
                }
            }
        });

        let mut events: Option<(Vec<EventType>, broadcast::Receiver<Event>)> = None;
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(Ok((params, opcode, body))) = frame else { break };
                    let request = match Request::deserialize(&mut &*body, opcode) {
                        Ok(request) => request,
                        Err(_) => break,
                    };
                    let reply = (state.handler)(&request);
                    if let (Request::Register(register), Reply::Ready) = (&request, &reply) {
                        events = Some((
                            register.event_types_to_register_for.clone(),
                            state.events.subscribe(),
                        ));
                    }
                    state.requests.lock().unwrap().push(request);

                    if matches!(reply, Reply::Close) {
                        break;
                    }
                    if let Some(data) = reply.encode(params.stream) {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                }
                event = async { events.as_mut().unwrap().1.recv().await }, if events.is_some() => {
                    let Ok(event) = event else { continue };
                    let Some((types, _)) = events.as_ref() else { continue };
                    if !types.contains(&event.event_type()) {
                        continue;
                    }
                    let mut body = Vec::new();
                    event.serialize(&mut body).unwrap();
                    let data = frame::make_response_frame(-1, ResponseOpcode::Event, &body);
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }
        reader.abort();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// One node of a [`FakeCluster`], living at 127.0.0.`index`.
#[derive(Debug, Clone)]
pub(crate) struct NodeSpec {
    pub(crate) index: u8,
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    pub(crate) tokens: Vec<i64>,
}

impl NodeSpec {
    pub(crate) fn new(index: u8, datacenter: &str, rack: &str, tokens: &[i64]) -> Self {
        NodeSpec {
            index,
            datacenter: datacenter.to_owned(),
            rack: rack.to_owned(),
            tokens: tokens.to_vec(),
        }
    }
}

/// Contents of the system tables every node of a [`FakeCluster`] serves.
#[derive(Debug, Clone, Default)]
pub(crate) struct SystemTables {
    pub(crate) nodes: Vec<NodeSpec>,
    /// (name, strategy class, strategy options as JSON)
    pub(crate) keyspaces: Vec<(String, String, String)>,
    /// (keyspace, table)
    pub(crate) tables: Vec<(String, String)>,
}

impl SystemTables {
    pub(crate) fn with_keyspace(mut self, name: &str, class: &str, options: &str) -> Self {
        self.keyspaces
            .push((name.to_owned(), class.to_owned(), options.to_owned()));
        self
    }

    pub(crate) fn with_table(mut self, keyspace: &str, table: &str) -> Self {
        self.tables.push((keyspace.to_owned(), table.to_owned()));
        self
    }

    fn reply(&self, local: u8, request: &Request) -> Option<Reply> {
        let Request::Query(query) = request else {
            return None;
        };
        let rows = if query.contents.contains("FROM system.local") {
            let node = self.nodes.iter().find(|node| node.index == local)?;
            Rows::new(
                "system",
                "local",
                vec![
                    ("cluster_name", ColumnType::Text),
                    ("data_center", ColumnType::Text),
                    ("rack", ColumnType::Text),
                    ("host_id", ColumnType::Uuid),
                    ("partitioner", ColumnType::Text),
                    ("release_version", ColumnType::Text),
                    ("schema_version", ColumnType::Uuid),
                    ("tokens", ColumnType::Set(Box::new(ColumnType::Text))),
                ],
                vec![Row {
                    columns: vec![
                        text("Test Cluster"),
                        text(&node.datacenter),
                        text(&node.rack),
                        uuid(Uuid::from_u128(node.index as u128)),
                        text("org.apache.cassandra.dht.Murmur3Partitioner"),
                        text("2.0.9"),
                        uuid(Uuid::from_u128(0xabcd)),
                        tokens(&node.tokens),
                    ],
                }],
            )
        } else if query.contents.contains("FROM system.peers") {
            let rows = self
                .nodes
                .iter()
                .filter(|node| node.index != local)
                .map(|node| Row {
                    columns: vec![
                        inet(ip(node.index)),
                        text(&node.datacenter),
                        text(&node.rack),
                        uuid(Uuid::from_u128(node.index as u128)),
                        inet(ip(node.index)),
                        text("2.0.9"),
                        uuid(Uuid::from_u128(0xabcd)),
                        tokens(&node.tokens),
                    ],
                })
                .collect();
            Rows::new(
                "system",
                "peers",
                vec![
                    ("peer", ColumnType::Inet),
                    ("data_center", ColumnType::Text),
                    ("rack", ColumnType::Text),
                    ("host_id", ColumnType::Uuid),
                    ("rpc_address", ColumnType::Inet),
                    ("release_version", ColumnType::Text),
                    ("schema_version", ColumnType::Uuid),
                    ("tokens", ColumnType::Set(Box::new(ColumnType::Text))),
                ],
                rows,
            )
        } else if query.contents.contains("FROM system.schema_keyspaces") {
            let rows = self
                .keyspaces
                .iter()
                .map(|(name, class, options)| Row {
                    columns: vec![
                        text(name),
                        Some(Bytes::from_static(&[1])),
                        text(class),
                        text(options),
                    ],
                })
                .collect();
            Rows::new(
                "system",
                "schema_keyspaces",
                vec![
                    ("keyspace_name", ColumnType::Text),
                    ("durable_writes", ColumnType::Boolean),
                    ("strategy_class", ColumnType::Text),
                    ("strategy_options", ColumnType::Text),
                ],
                rows,
            )
        } else if query.contents.contains("FROM system.schema_columnfamilies") {
            let rows = self
                .tables
                .iter()
                .map(|(keyspace, table)| Row {
                    columns: vec![text(keyspace), text(table)],
                })
                .collect();
            Rows::new(
                "system",
                "schema_columnfamilies",
                vec![
                    ("keyspace_name", ColumnType::Text),
                    ("columnfamily_name", ColumnType::Text),
                ],
                rows,
            )
        } else {
            return None;
        };
        Some(Reply::Result(result::Result::Rows(rows)))
    }
}

fn text(value: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(value.as_bytes()))
}

fn uuid(value: Uuid) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(value.as_bytes()))
}

fn inet(address: IpAddr) -> Option<Bytes> {
    match address {
        IpAddr::V4(v4) => Some(Bytes::copy_from_slice(&v4.octets())),
        IpAddr::V6(v6) => Some(Bytes::copy_from_slice(&v6.octets())),
    }
}

fn tokens(tokens: &[i64]) -> Option<Bytes> {
    let tokens: Vec<String> = tokens.iter().map(i64::to_string).collect();
    Some(serialize_string_collection(tokens.iter().map(String::as_str)))
}

type Override = Arc<dyn Fn(u8, &Request) -> Option<Reply> + Send + Sync>;

/// Several [`FakeNode`]s sharing one port on different loopback addresses and
/// serving consistent system tables.
pub(crate) struct FakeCluster {
    port: u16,
    tables: Arc<Mutex<SystemTables>>,
    overrides: Override,
    nodes: Mutex<HashMap<u8, Arc<FakeNode>>>,
}

impl FakeCluster {
    pub(crate) async fn start(tables: SystemTables) -> FakeCluster {
        Self::start_with(tables, |_, _| None).await
    }

    /// Starts every node of `tables`; `overrides` is consulted before the
    /// system tables and the default replies.
    pub(crate) async fn start_with(
        tables: SystemTables,
        overrides: impl Fn(u8, &Request) -> Option<Reply> + Send + Sync + 'static,
    ) -> FakeCluster {
        let specs = tables.nodes.clone();
        let mut cluster = FakeCluster {
            port: 0,
            tables: Arc::new(Mutex::new(tables)),
            overrides: Arc::new(overrides),
            nodes: Mutex::new(HashMap::new()),
        };
        for spec in specs {
            let node = cluster.start_node(spec.index).await;
            if cluster.port == 0 {
                cluster.port = node.address().port();
            }
            cluster.nodes.lock().unwrap().insert(spec.index, node);
        }
        cluster
    }

    async fn start_node(&self, index: u8) -> Arc<FakeNode> {
        let tables = Arc::clone(&self.tables);
        let overrides = Arc::clone(&self.overrides);
        let node = FakeNode::start_at(SocketAddr::new(ip(index), self.port), move |request| {
            overrides(index, request)
                .or_else(|| tables.lock().unwrap().reply(index, request))
                .unwrap_or_else(|| FakeNode::default_reply(request))
        })
        .await;
        Arc::new(node)
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn address(&self, index: u8) -> SocketAddr {
        SocketAddr::new(ip(index), self.port)
    }

    pub(crate) fn node(&self, index: u8) -> Arc<FakeNode> {
        Arc::clone(&self.nodes.lock().unwrap()[&index])
    }

    /// Adds a node to the system tables and starts it.
    pub(crate) async fn add_node(&self, spec: NodeSpec) -> Arc<FakeNode> {
        let index = spec.index;
        self.tables.lock().unwrap().nodes.push(spec);
        let node = self.start_node(index).await;
        self.nodes.lock().unwrap().insert(index, Arc::clone(&node));
        node
    }

    /// Stops a node, keeping it in the system tables.
    pub(crate) async fn stop_node(&self, index: u8) {
        let node = self.nodes.lock().unwrap().remove(&index);
        if let Some(node) = node {
            node.stop().await;
        }
    }

    /// Restarts a node stopped earlier.
    pub(crate) async fn restart_node(&self, index: u8) -> Arc<FakeNode> {
        let node = self.start_node(index).await;
        self.nodes.lock().unwrap().insert(index, Arc::clone(&node));
        node
    }

    /// Removes a node from the system tables and stops it.
    pub(crate) async fn remove_node(&self, index: u8) {
        self.tables
            .lock()
            .unwrap()
            .nodes
            .retain(|node| node.index != index);
        self.stop_node(index).await;
    }

    pub(crate) fn update_tables(&self, update: impl FnOnce(&mut SystemTables)) {
        update(&mut self.tables.lock().unwrap());
    }

    /// Pushes the event from every running node.
    pub(crate) fn push_event(&self, event: Event) {
        for node in self.nodes.lock().unwrap().values() {
            node.push_event(event.clone());
        }
    }

    /// Number of requests matching the predicate received by all nodes.
    pub(crate) fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .map(|node| node.count(&predicate))
            .sum()
    }
}

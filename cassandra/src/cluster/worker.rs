use arc_swap::ArcSwapOption;
use bytes::Bytes;
use cassandra_cql::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeType, StatusChangeEvent, TopologyChangeEvent,
};
use dashmap::DashMap;
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use itertools::Itertools;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::control_connection::ControlConnection;
use super::listener::{EventListener, ListenerList};
use super::metadata_reader::{self, Metadata};
use super::{PeerRecord, TopologyDirectory, TopologySnapshot};
use crate::client::config::ClusterConfig;
use crate::client::session::Session;
use crate::errors::{
    BadKeyspaceName, ConfigError, ConnectionError, MetadataError, NewClusterError,
};
use crate::network::{Connection, ConnectionConfig, FutureMap, VerifiedKeyspaceName};
use crate::policies::load_balancing::{RoutingCandidates, RoutingInfo};

/// Server events waiting for the worker. The connection reading them waits while it is full.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// State shared by the cluster handle, its sessions and the background worker.
pub(crate) struct ClusterContext {
    pub(crate) config: ClusterConfig,
    pub(crate) directory: TopologyDirectory,
    pub(crate) future_map: Arc<FutureMap>,
    listeners: ListenerList,
    // Prepared statement id -> statement text.
    prepared: DashMap<Bytes, String>,
    control_address: ArcSwapOption<SocketAddr>,
    unavailable: AtomicBool,
}

impl ClusterContext {
    fn new(config: ClusterConfig) -> Self {
        let listeners = ListenerList::default();
        for listener in &config.listeners {
            listeners.add(Arc::clone(listener));
        }
        ClusterContext {
            future_map: Arc::new(FutureMap::new(config.request_deadline)),
            config,
            directory: TopologyDirectory::new(),
            listeners,
            prepared: DashMap::new(),
            control_address: ArcSwapOption::empty(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Options of a data connection, switched to `keyspace` if given.
    pub(crate) fn connection_config(
        &self,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> ConnectionConfig {
        ConnectionConfig {
            keyspace,
            event_sender: None,
            ..self.config.connection.clone()
        }
    }

    fn control_connection_config(&self, event_sender: &mpsc::Sender<Event>) -> ConnectionConfig {
        ConnectionConfig {
            keyspace: None,
            event_sender: Some(event_sender.clone()),
            ..self.config.connection.clone()
        }
    }

    pub(crate) fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Remembers a prepared statement. Returns `true` if the id was not known before.
    pub(crate) fn register_prepared(&self, id: Bytes, statement: &str) -> bool {
        self.prepared.insert(id, statement.to_owned()).is_none()
    }

    /// Every statement prepared so far, as (id, text).
    pub(crate) fn prepared_statements(&self) -> Vec<(Bytes, String)> {
        self.prepared
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn notify(&self, notify: impl Fn(&dyn EventListener, &TopologySnapshot)) {
        let topology = self.directory.snapshot();
        self.listeners.notify(|listener| notify(listener, topology.as_ref()));
    }

    fn join(&self, peer: PeerRecord) {
        let address = peer.address;
        info!(%address, datacenter = ?peer.datacenter, "Node joined the cluster");
        if let Some(previous) = self.directory.add_peer(peer.clone()) {
            self.config.routing_policy.remove_endpoint(&previous);
        }
        if peer.is_up() {
            self.config.routing_policy.add_endpoint(&peer);
        }
        self.notify(|listener, topology| listener.on_join_cluster(topology, address));
    }

    fn leave(&self, address: IpAddr) {
        info!(%address, "Node left the cluster");
        let removed = self
            .directory
            .remove_peer(&address)
            .map_or_else(|| PeerRecord::new(address), |peer| PeerRecord::clone(&peer));
        self.config.routing_policy.remove_endpoint(&removed);
        self.notify(|listener, topology| listener.on_leave_cluster(topology, address));
    }

    fn moved(&self, peer: PeerRecord) {
        let address = peer.address;
        info!(%address, "Node moved");
        let peer = match self.directory.peer(&address) {
            Some(previous) => {
                self.config.routing_policy.remove_endpoint(&previous);
                peer.with_status(previous.is_up())
            }
            None => peer,
        };
        self.directory.add_peer(peer.clone());
        if peer.is_up() {
            self.config.routing_policy.add_endpoint(&peer);
        }
        self.notify(|listener, topology| listener.on_move(topology, address));
    }

    fn mark_up(&self, peer: PeerRecord) {
        let address = peer.address;
        info!(%address, "Node is up");
        let peer = match self.directory.set_peer_up(&address) {
            Some(updated) => PeerRecord::clone(&updated),
            None => {
                let peer = peer.with_status(true);
                self.directory.add_peer(peer.clone());
                peer
            }
        };
        self.config.routing_policy.add_endpoint(&peer);
        self.notify(|listener, topology| listener.on_up(topology, address));
    }

    fn mark_down(&self, address: IpAddr) {
        info!(%address, "Node is down");
        let peer = self
            .directory
            .set_peer_down(&address)
            .map_or_else(|| PeerRecord::new(address), |peer| PeerRecord::clone(&peer));
        self.config.routing_policy.remove_endpoint(&peer);
        self.notify(|listener, topology| listener.on_down(topology, address));
    }

    /// Merges a full read of the system tables into the directory. Known peers
    /// keep their status; peers and keyspaces no longer listed are dropped.
    fn apply_metadata(&self, metadata: Metadata) {
        self.directory
            .set_cluster_info(metadata.cluster_name, metadata.partitioner);

        let listed: HashSet<IpAddr> = metadata.peers.iter().map(|peer| peer.address).collect();
        for peer in metadata.peers {
            match self.directory.peer(&peer.address) {
                Some(known) => {
                    let peer = peer.with_status(known.is_up());
                    self.directory.add_peer(peer.clone());
                    if peer.is_up() {
                        self.config.routing_policy.remove_endpoint(&known);
                        self.config.routing_policy.add_endpoint(&peer);
                    }
                }
                None => self.join(peer),
            }
        }
        for gone in self
            .directory
            .peers()
            .iter()
            .map(|peer| peer.address)
            .filter(|address| !listed.contains(address))
        {
            self.leave(gone);
        }

        let listed: HashSet<String> = metadata
            .keyspaces
            .iter()
            .map(|keyspace| keyspace.name.clone())
            .collect();
        for keyspace in metadata.keyspaces {
            self.directory.put_keyspace(keyspace);
        }
        let snapshot = self.directory.snapshot();
        for gone in snapshot
            .keyspaces()
            .map(|keyspace| keyspace.name.as_str())
            .filter(|name| !listed.contains(*name))
        {
            debug!(keyspace = gone, "Keyspace no longer exists");
            self.directory.remove_keyspace(gone);
        }
    }

    /// Opens a short-lived connection to every peer but `skip`; peers that are
    /// unreachable or do not finish the handshake within the request deadline
    /// are marked down.
    async fn check_peers(&self, skip: IpAddr) {
        let deadline = self.config.request_deadline;
        let checks = self
            .directory
            .peers()
            .into_iter()
            .filter(|peer| peer.address != skip)
            .map(|peer| async move {
                let address = SocketAddr::new(peer.address, self.config.port);
                let (connection, _) = Connection::new(
                    address,
                    self.connection_config(None),
                    Arc::clone(&self.future_map),
                );
                let result = timeout(deadline, connection.open())
                    .await
                    .unwrap_or(Err(ConnectionError::SetupTimeout(deadline)));
                connection.close();
                (peer.address, result)
            });

        for (address, result) in join_all(checks).await {
            match result {
                Ok(()) => trace!(%address, "Peer is reachable"),
                Err(err) => {
                    warn!(%address, error = %err, "Peer is unreachable");
                    self.mark_down(address);
                }
            }
        }
    }
}

/// Cluster keeps the driver's view of the cluster up to date.
///
/// Connecting registers a control connection for server events, reads the topology
/// and the schema from the system tables and opens a connection to every peer.
/// Each of these steps is bounded by the request deadline. A background worker
/// then applies every event to the topology directory and the routing policy and
/// notifies the [`EventListener`]s. If the control connection breaks, the worker
/// registers again through the seeds and the up peers; if none of them accepts,
/// the cluster becomes unavailable for good.
///
/// Requests that stay unanswered past the deadline are failed by a separate
/// sweeper task, so a busy worker never delays them.
///
/// Dropping the last handle stops the worker and the sweeper.
pub struct Cluster {
    context: Arc<ClusterContext>,
    runtime: tokio::runtime::Handle,
    _worker_handle: RemoteHandle<()>,
    _sweeper_handle: RemoteHandle<()>,
}

impl Cluster {
    /// Discovers the cluster through the seeds of `config`.
    pub async fn connect(config: ClusterConfig) -> Result<Arc<Cluster>, NewClusterError> {
        if config.seeds.is_empty() {
            return Err(ConfigError::EmptySeedList.into());
        }

        let context = Arc::new(ClusterContext::new(config));
        let deadline = context.config.request_deadline;

        // Requests sent while bootstrapping are swept too.
        let (sweeper, sweeper_handle) =
            sweep_periodically(Arc::clone(&context.future_map), context.config.sweep_interval)
                .remote_handle();
        tokio::spawn(sweeper);

        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let control = ControlConnection::open_any(
            context.config.seeds.iter().copied(),
            context.config.port,
            &context.control_connection_config(&event_sender),
            &context.future_map,
            &context.config.event_types,
            deadline,
        )
        .await
        .map_err(NewClusterError::NoAvailablePeers)?;

        let metadata = timeout(
            deadline,
            metadata_reader::read_metadata(control.connection(), control.address()),
        )
        .await
        .map_err(|_| MetadataError::Timeout(deadline))??;
        context.apply_metadata(metadata);
        context
            .control_address
            .store(Some(Arc::new(control.get_connect_address())));
        context.check_peers(control.address()).await;

        let topology = context.directory.snapshot();
        info!(
            cluster = topology.cluster_name().unwrap_or("unknown"),
            control = %control.get_connect_address(),
            "Cluster discovered: {}",
            context.directory.describe()
        );

        let worker = ClusterWorker {
            context: Arc::clone(&context),
            control: Some(control),
            event_sender,
            event_receiver,
        };
        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Arc::new(Cluster {
            context,
            runtime: tokio::runtime::Handle::current(),
            _worker_handle: worker_handle,
            _sweeper_handle: sweeper_handle,
        }))
    }

    /// Creates a session whose connections use `keyspace`.
    pub fn session(self: &Arc<Self>, keyspace: Option<&str>) -> Result<Session, BadKeyspaceName> {
        let keyspace = keyspace
            .map(|keyspace| VerifiedKeyspaceName::new(keyspace.to_owned(), false))
            .transpose()?;
        Ok(Session::new(Arc::clone(self), keyspace))
    }

    /// The configuration the cluster was connected with.
    pub fn config(&self) -> &ClusterConfig {
        &self.context.config
    }

    /// Current view of the topology and the schema.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.context.directory.snapshot()
    }

    /// Name of the cluster as reported by `system.local`.
    pub fn cluster_name(&self) -> Option<String> {
        self.topology().cluster_name().map(str::to_owned)
    }

    /// Adds a listener; it is notified of events handled from now on.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.context.listeners.add(listener);
    }

    /// Endpoints to send a request with the given routing information to, in order of preference.
    pub fn active_endpoints(&self, routing: &RoutingInfo<'_>) -> RoutingCandidates {
        self.context
            .config
            .routing_policy
            .active_endpoints(routing, &self.topology())
    }

    /// Address of the node holding the control connection, if one is registered.
    pub fn control_connection_address(&self) -> Option<SocketAddr> {
        self.context.control_address.load().as_deref().copied()
    }

    /// `false` once the control connection could not be re-established.
    /// Requests then fail with [`ExecutionError::ClusterUnavailable`](crate::errors::ExecutionError::ClusterUnavailable).
    pub fn is_available(&self) -> bool {
        !self.context.is_unavailable()
    }

    /// Requests currently waiting for a response, over all connections.
    pub fn pending_requests(&self) -> usize {
        self.context.future_map.len()
    }

    pub(crate) fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("topology", &self.context.directory.describe())
            .field("control_connection", &self.control_connection_address())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

enum WorkerInput {
    Event(Event),
    ControlConnectionBroken(ConnectionError),
}

/// Fails requests whose deadline passed, every `period`, until the handle is dropped.
async fn sweep_periodically(future_map: Arc<FutureMap>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let swept = future_map.sweep(Instant::now());
        if swept > 0 {
            debug!(swept, "Failed requests past their deadline");
        }
    }
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    context: Arc<ClusterContext>,

    // None after re-registration failed.
    control: Option<ControlConnection>,

    // Handed to every new control connection.
    event_sender: mpsc::Sender<Event>,
    event_receiver: mpsc::Receiver<Event>,
}

impl ClusterWorker {
    async fn work(mut self) {
        loop {
            let input = tokio::select! {
                event = self.event_receiver.recv() => match event {
                    Some(event) => WorkerInput::Event(event),
                    None => return,
                },
                error = wait_until_broken(&mut self.control) => {
                    WorkerInput::ControlConnectionBroken(error)
                }
            };

            match input {
                WorkerInput::Event(event) => self.handle_event(event).await,
                WorkerInput::ControlConnectionBroken(error) => {
                    self.control = None;
                    self.reregister(error).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        debug!(?event, "Handling server event");
        match event {
            Event::TopologyChange(change) => self.handle_topology_change(change).await,
            Event::StatusChange(change) => self.handle_status_change(change).await,
            Event::SchemaChange(change) => self.handle_schema_change(change).await,
        }
    }

    async fn handle_topology_change(&mut self, change: TopologyChangeEvent) {
        match change {
            TopologyChangeEvent::NewNode(address) => {
                let peer = self.read_peer(address.ip()).await;
                self.context.join(peer);
            }
            TopologyChangeEvent::RemovedNode(address) => self.context.leave(address.ip()),
            TopologyChangeEvent::MovedNode(address) => {
                let peer = self.read_peer(address.ip()).await;
                self.context.moved(peer);
            }
        }
    }

    async fn handle_status_change(&mut self, change: StatusChangeEvent) {
        match change {
            StatusChangeEvent::Up(address) => {
                let peer = match self.context.directory.peer(&address.ip()) {
                    Some(known) => PeerRecord::clone(&known),
                    None => self.read_peer(address.ip()).await,
                };
                self.context.mark_up(peer);
            }
            StatusChangeEvent::Down(address) => self.context.mark_down(address.ip()),
        }
    }

    async fn handle_schema_change(&mut self, change: SchemaChangeEvent) {
        let context = &self.context;
        match change {
            SchemaChangeEvent::KeyspaceChange {
                change_type,
                keyspace_name: keyspace,
            } => match change_type {
                SchemaChangeType::Created => {
                    self.refresh_keyspace(&keyspace).await;
                    context.notify(|listener, topology| listener.on_create_keyspace(topology, &keyspace));
                }
                SchemaChangeType::Updated => {
                    self.refresh_keyspace(&keyspace).await;
                    context.notify(|listener, topology| listener.on_update_keyspace(topology, &keyspace));
                }
                SchemaChangeType::Dropped => {
                    context.directory.remove_keyspace(&keyspace);
                    context.notify(|listener, topology| listener.on_drop_keyspace(topology, &keyspace));
                }
                SchemaChangeType::Invalid => {
                    warn!(keyspace = %keyspace, "Ignoring schema change of unknown type")
                }
            },
            SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name: keyspace,
                object_name: table,
            } => match change_type {
                SchemaChangeType::Created => {
                    self.add_table(&keyspace, &table);
                    context.notify(|listener, topology| {
                        listener.on_create_table(topology, &keyspace, &table)
                    });
                }
                SchemaChangeType::Updated => {
                    self.add_table(&keyspace, &table);
                    context.notify(|listener, topology| {
                        listener.on_update_table(topology, &keyspace, &table)
                    });
                }
                SchemaChangeType::Dropped => {
                    context.directory.remove_table(&keyspace, &table);
                    context.notify(|listener, topology| {
                        listener.on_drop_table(topology, &keyspace, &table)
                    });
                }
                SchemaChangeType::Invalid => {
                    warn!(keyspace = %keyspace, table = %table, "Ignoring schema change of unknown type")
                }
            },
        }
    }

    fn add_table(&self, keyspace: &str, table: &str) {
        if !self.context.directory.add_table(keyspace, table) {
            debug!(keyspace, table, "Table of an unknown keyspace");
        }
    }

    fn deadline(&self) -> Duration {
        self.context.config.request_deadline
    }

    /// Reads the row of `address` from `system.peers`. Falls back to a bare record
    /// if it cannot be read within the request deadline.
    async fn read_peer(&self, address: IpAddr) -> PeerRecord {
        let Some(control) = &self.control else {
            return PeerRecord::new(address);
        };
        let partitioner = self.context.directory.snapshot().partitioner();
        let peers = timeout(
            self.deadline(),
            metadata_reader::query_peers(control.connection(), partitioner),
        )
        .await
        .unwrap_or(Err(MetadataError::Timeout(self.deadline())));
        match peers {
            Ok(peers) => match peers.into_iter().find(|peer| peer.address == address) {
                Some(peer) => peer,
                None => {
                    debug!(%address, "Node not listed in system.peers yet");
                    PeerRecord::new(address)
                }
            },
            Err(err) => {
                warn!(%address, error = %err, "Failed to read peer");
                PeerRecord::new(address)
            }
        }
    }

    async fn refresh_keyspace(&self, keyspace: &str) {
        let Some(control) = &self.control else {
            return;
        };
        let keyspaces = timeout(
            self.deadline(),
            metadata_reader::query_keyspaces(control.connection(), Some(keyspace)),
        )
        .await
        .unwrap_or(Err(MetadataError::Timeout(self.deadline())));
        match keyspaces {
            Ok(keyspaces) => {
                for keyspace in keyspaces {
                    self.context.directory.put_keyspace(keyspace);
                }
            }
            Err(err) => warn!(keyspace, error = %err, "Failed to read keyspace"),
        }
    }

    async fn reregister(&mut self, error: ConnectionError) {
        warn!(error = %error, "Control connection broke, registering again");

        // Seeds first, in order, then the peers believed to be up.
        let seeds = self.context.config.seeds.iter().copied();
        let up_peers = self
            .context
            .directory
            .peers()
            .into_iter()
            .filter(|peer| peer.is_up())
            .map(|peer| peer.address)
            .sorted();
        let candidates: Vec<IpAddr> = seeds.chain(up_peers).unique().collect();

        let control = match ControlConnection::open_any(
            candidates,
            self.context.config.port,
            &self.context.control_connection_config(&self.event_sender),
            &self.context.future_map,
            &self.context.config.event_types,
            self.deadline(),
        )
        .await
        {
            Ok(control) => control,
            Err(err) => {
                error!(error = %err, "No node accepted the control connection, the cluster is unavailable");
                self.context.control_address.store(None);
                self.context.unavailable.store(true, Ordering::Release);
                return;
            }
        };

        info!(address = %control.get_connect_address(), "Control connection registered again");
        self.context
            .control_address
            .store(Some(Arc::new(control.get_connect_address())));

        // Events may have been missed while no connection was registered.
        let metadata = timeout(
            self.deadline(),
            metadata_reader::read_metadata(control.connection(), control.address()),
        )
        .await
        .unwrap_or(Err(MetadataError::Timeout(self.deadline())));
        match metadata {
            Ok(metadata) => self.context.apply_metadata(metadata),
            Err(err) => warn!(error = %err, "Failed to refresh metadata"),
        }
        self.control = Some(control);
    }
}

async fn wait_until_broken(control: &mut Option<ControlConnection>) -> ConnectionError {
    match control {
        Some(control) => control.broken().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::listener::tests::RecordingListener;
    use crate::policies::load_balancing::RoundRobinPolicy;
    use crate::routing::Token;
    use crate::utils::test_utils::{
        ip, setup_tracing, wait_until, FakeCluster, FakeNode, NodeSpec, Reply, SystemTables,
    };
    use assert_matches::assert_matches;
    use cassandra_cql::frame::request::Request;
    use std::sync::Mutex;
    use std::time::Duration;

    const SIMPLE: &str = "org.apache.cassandra.locator.SimpleStrategy";

    fn tables() -> SystemTables {
        SystemTables {
            nodes: vec![
                NodeSpec::new(1, "dc1", "r1", &[-100]),
                NodeSpec::new(2, "dc1", "r2", &[0]),
                NodeSpec::new(3, "dc2", "r1", &[100]),
            ],
            ..Default::default()
        }
        .with_keyspace("ks", SIMPLE, r#"{"replication_factor":"2"}"#)
        .with_table("ks", "t")
    }

    struct Setup {
        config: ClusterConfig,
        policy: Arc<RoundRobinPolicy>,
        listener: Arc<RecordingListener>,
    }

    fn setup(cluster: &FakeCluster, seeds: &[u8]) -> Setup {
        let policy = Arc::new(RoundRobinPolicy::new());
        let listener = Arc::new(RecordingListener::default());
        let config = ClusterConfig {
            seeds: seeds.iter().copied().map(ip).collect(),
            port: cluster.port(),
            routing_policy: policy.clone(),
            listeners: vec![listener.clone() as Arc<dyn EventListener>],
            ..Default::default()
        };
        Setup {
            config,
            policy,
            listener,
        }
    }

    fn sorted(endpoints: &[IpAddr]) -> Vec<IpAddr> {
        endpoints.iter().copied().sorted().collect()
    }

    /// Waits for the listener to record `count` more calls than `before`, returning the new ones.
    async fn new_calls(listener: &RecordingListener, before: usize, count: usize) -> Vec<String> {
        wait_until(|| listener.calls().len() >= before + count).await;
        listener.calls()[before..].to_vec()
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn discovers_the_cluster() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        let Setup {
            config,
            policy,
            listener,
        } = setup(&fake, &[1]);

        let cluster = Cluster::connect(config).await.unwrap();
        assert_eq!(cluster.cluster_name().as_deref(), Some("Test Cluster"));
        assert_eq!(cluster.control_connection_address(), Some(fake.address(1)));
        assert!(cluster.is_available());

        let topology = cluster.topology();
        assert_eq!(topology.peer_count(), 3);
        assert!(topology.peers().all(|peer| peer.is_up()));
        assert_eq!(
            topology.peer(&ip(3)).unwrap().datacenter.as_deref(),
            Some("dc2")
        );
        let keyspace = topology.keyspace("ks").unwrap();
        assert!(keyspace.tables.contains("t"));

        assert_eq!(sorted(&policy.endpoints()), vec![ip(1), ip(2), ip(3)]);
        assert_eq!(
            listener.calls(),
            vec!["join 127.0.0.1", "join 127.0.0.2", "join 127.0.0.3"]
        );
        // Only the control connection registers for events.
        assert_eq!(fake.count(|r| matches!(r, Request::Register(_))), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_peers_are_marked_down() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        fake.stop_node(3).await;
        let Setup {
            config,
            policy,
            listener,
        } = setup(&fake, &[1]);

        let cluster = Cluster::connect(config).await.unwrap();
        assert!(!cluster.topology().peer(&ip(3)).unwrap().is_up());
        assert_eq!(sorted(&policy.endpoints()), vec![ip(1), ip(2)]);
        assert_eq!(listener.calls().last().unwrap(), "down 127.0.0.3");
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn seeds_are_tried_in_order() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        fake.stop_node(1).await;
        let Setup { config, .. } = setup(&fake, &[1, 2]);

        let cluster = Cluster::connect(config).await.unwrap();
        assert_eq!(cluster.control_connection_address(), Some(fake.address(2)));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn fails_without_reachable_seeds() {
        setup_tracing();
        let address = FakeNode::unused_address().await;
        let config = ClusterConfig {
            seeds: vec![address.ip()],
            port: address.port(),
            ..Default::default()
        };
        assert_matches!(
            Cluster::connect(config).await,
            Err(NewClusterError::NoAvailablePeers(ConnectionError::IoError(_)))
        );

        assert_matches!(
            Cluster::connect(ClusterConfig::default()).await,
            Err(NewClusterError::ConfigError(ConfigError::EmptySeedList))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn status_and_topology_events() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        let Setup {
            config,
            policy,
            listener,
        } = setup(&fake, &[1]);
        let cluster = Cluster::connect(config).await.unwrap();
        let before = listener.calls().len();

        fake.push_event(Event::StatusChange(StatusChangeEvent::Down(fake.address(3))));
        assert_eq!(new_calls(&listener, before, 1).await, vec!["down 127.0.0.3"]);
        assert!(!cluster.topology().peer(&ip(3)).unwrap().is_up());
        assert_eq!(sorted(&policy.endpoints()), vec![ip(1), ip(2)]);

        fake.push_event(Event::StatusChange(StatusChangeEvent::Up(fake.address(3))));
        assert_eq!(new_calls(&listener, before + 1, 1).await, vec!["up 127.0.0.3"]);
        assert!(cluster.topology().peer(&ip(3)).unwrap().is_up());
        assert_eq!(sorted(&policy.endpoints()), vec![ip(1), ip(2), ip(3)]);

        fake.add_node(NodeSpec::new(4, "dc2", "r2", &[200])).await;
        fake.push_event(Event::TopologyChange(TopologyChangeEvent::NewNode(
            fake.address(4),
        )));
        assert_eq!(new_calls(&listener, before + 2, 1).await, vec!["join 127.0.0.4"]);
        let joined = cluster.topology().peer(&ip(4)).cloned().unwrap();
        assert_eq!(joined.datacenter.as_deref(), Some("dc2"));
        assert_eq!(joined.tokens, vec![Token::murmur3(200)]);
        assert!(policy.endpoints().contains(&ip(4)));

        fake.update_tables(|tables| {
            for node in tables.nodes.iter_mut().filter(|node| node.index == 2) {
                node.tokens = vec![50];
            }
        });
        fake.push_event(Event::TopologyChange(TopologyChangeEvent::MovedNode(
            fake.address(2),
        )));
        assert_eq!(new_calls(&listener, before + 3, 1).await, vec!["move 127.0.0.2"]);
        assert_eq!(
            cluster.topology().peer(&ip(2)).unwrap().tokens,
            vec![Token::murmur3(50)]
        );

        fake.remove_node(4).await;
        fake.push_event(Event::TopologyChange(TopologyChangeEvent::RemovedNode(
            fake.address(4),
        )));
        assert_eq!(new_calls(&listener, before + 4, 1).await, vec!["leave 127.0.0.4"]);
        assert!(cluster.topology().peer(&ip(4)).is_none());
        assert!(!policy.endpoints().contains(&ip(4)));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn schema_events() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        let Setup {
            config, listener, ..
        } = setup(&fake, &[1]);
        let cluster = Cluster::connect(config).await.unwrap();
        let before = listener.calls().len();

        let keyspace_change = |change_type, keyspace: &str| {
            Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
                change_type,
                keyspace_name: keyspace.to_owned(),
            })
        };
        let table_change = |change_type, table: &str| {
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name: "ks2".to_owned(),
                object_name: table.to_owned(),
            })
        };

        fake.update_tables(|tables| {
            tables.keyspaces.push((
                "ks2".to_owned(),
                SIMPLE.to_owned(),
                r#"{"replication_factor":"1"}"#.to_owned(),
            ))
        });
        fake.push_event(keyspace_change(SchemaChangeType::Created, "ks2"));
        fake.push_event(table_change(SchemaChangeType::Created, "t1"));
        fake.push_event(table_change(SchemaChangeType::Created, "t2"));
        fake.push_event(table_change(SchemaChangeType::Dropped, "t1"));
        assert_eq!(
            new_calls(&listener, before, 4).await,
            vec![
                "create keyspace ks2",
                "create table ks2.t1",
                "create table ks2.t2",
                "drop table ks2.t1",
            ]
        );
        let topology = cluster.topology();
        let keyspace = topology.keyspace("ks2").unwrap();
        assert_eq!(keyspace.tables.iter().collect::<Vec<_>>(), vec!["t2"]);

        fake.push_event(keyspace_change(SchemaChangeType::Dropped, "ks2"));
        assert_eq!(
            new_calls(&listener, before + 4, 1).await,
            vec!["drop keyspace ks2"]
        );
        assert!(cluster.topology().keyspace("ks2").is_none());
        assert!(cluster.topology().keyspace("ks").is_some());
    }

    /// Checks that the topology handed to the listener already contains the change.
    struct StatusRecorder {
        seen: Mutex<Vec<Option<bool>>>,
    }

    impl EventListener for StatusRecorder {
        fn on_down(&self, topology: &TopologySnapshot, endpoint: IpAddr) {
            let up = topology.peer(&endpoint).map(|peer| peer.is_up());
            self.seen.lock().unwrap().push(up);
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn listeners_see_the_updated_topology() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        let Setup {
            config, listener, ..
        } = setup(&fake, &[1]);
        let cluster = Cluster::connect(config).await.unwrap();
        let recorder = Arc::new(StatusRecorder {
            seen: Mutex::new(Vec::new()),
        });
        cluster.add_listener(recorder.clone());
        let before = listener.calls().len();

        fake.push_event(Event::StatusChange(StatusChangeEvent::Down(fake.address(2))));
        new_calls(&listener, before, 1).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![Some(false)]);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn control_connection_is_registered_again() {
        setup_tracing();
        let fake = FakeCluster::start(tables()).await;
        let Setup {
            config, listener, ..
        } = setup(&fake, &[1]);
        let cluster = Cluster::connect(config).await.unwrap();

        fake.stop_node(1).await;
        wait_until(|| cluster.control_connection_address() == Some(fake.address(2))).await;
        assert!(cluster.is_available());
        assert_eq!(fake.node(2).count(|r| matches!(r, Request::Register(_))), 1);

        // Events now arrive through node 2.
        let before = listener.calls().len();
        fake.push_event(Event::StatusChange(StatusChangeEvent::Down(fake.address(3))));
        assert_eq!(new_calls(&listener, before, 1).await, vec!["down 127.0.0.3"]);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn cluster_becomes_unavailable() {
        setup_tracing();
        let fake = FakeCluster::start(SystemTables {
            nodes: vec![NodeSpec::new(1, "dc1", "r1", &[0])],
            ..Default::default()
        })
        .await;
        let Setup { config, .. } = setup(&fake, &[1]);
        let cluster = Cluster::connect(config).await.unwrap();

        fake.stop_node(1).await;
        wait_until(|| !cluster.is_available()).await;
        assert_eq!(cluster.control_connection_address(), None);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn stale_requests_are_swept() {
        setup_tracing();
        let fake = FakeCluster::start_with(
            SystemTables {
                nodes: vec![NodeSpec::new(1, "dc1", "r1", &[0])],
                ..Default::default()
            },
            |_, request| match request {
                Request::Query(query) if query.contents == "SELECT slow" => Some(Reply::Silence),
                _ => None,
            },
        )
        .await;
        let Setup { mut config, .. } = setup(&fake, &[1]);
        config.request_deadline = Duration::from_millis(100);
        config.sweep_interval = Duration::from_millis(20);
        let cluster = Cluster::connect(config).await.unwrap();

        let context = cluster.context();
        let (connection, _) = Connection::new(
            fake.address(1),
            context.connection_config(None),
            Arc::clone(&context.future_map),
        );
        connection.open().await.unwrap();

        let result = connection
            .query_single_page("SELECT slow")
            .await
            .map(|_| ());
        assert_matches!(
            result,
            Err(crate::errors::RequestAttemptError::RequestTimeout(deadline))
                if deadline == Duration::from_millis(100)
        );
        assert_eq!(cluster.pending_requests(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn silent_peer_does_not_block_discovery() {
        setup_tracing();
        let fake = FakeCluster::start_with(tables(), |index, request| match request {
            Request::Options if index == 2 => Some(Reply::Silence),
            _ => None,
        })
        .await;
        let Setup {
            mut config,
            policy,
            listener,
        } = setup(&fake, &[1]);
        config.request_deadline = Duration::from_millis(300);
        config.sweep_interval = Duration::from_millis(50);

        let cluster = Cluster::connect(config).await.unwrap();
        assert!(!cluster.topology().peer(&ip(2)).unwrap().is_up());
        assert!(cluster.topology().peer(&ip(3)).unwrap().is_up());
        assert_eq!(sorted(&policy.endpoints()), vec![ip(1), ip(3)]);
        assert_eq!(listener.calls().last().unwrap(), "down 127.0.0.2");
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn silent_metadata_read_fails_the_connect() {
        setup_tracing();
        let fake = FakeCluster::start_with(tables(), |_, request| match request {
            Request::Query(query) if query.contents.contains("FROM system.peers") => {
                Some(Reply::Silence)
            }
            _ => None,
        })
        .await;
        let Setup { mut config, .. } = setup(&fake, &[1]);
        config.request_deadline = Duration::from_millis(300);

        assert_matches!(
            Cluster::connect(config).await,
            Err(NewClusterError::MetadataError(MetadataError::Timeout(_)))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn requests_are_swept_while_events_are_handled() {
        setup_tracing();
        let peers_silent = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&peers_silent);
        let fake = FakeCluster::start_with(tables(), move |_, request| match request {
            Request::Query(query) if query.contents == "SELECT slow" => Some(Reply::Silence),
            Request::Query(query)
                if flag.load(Ordering::SeqCst) && query.contents.contains("FROM system.peers") =>
            {
                Some(Reply::Silence)
            }
            _ => None,
        })
        .await;
        let Setup {
            mut config,
            listener,
            ..
        } = setup(&fake, &[1]);
        config.request_deadline = Duration::from_millis(300);
        config.sweep_interval = Duration::from_millis(20);
        let cluster = Cluster::connect(config).await.unwrap();

        let context = cluster.context();
        let (connection, _) = Connection::new(
            fake.address(1),
            context.connection_config(None),
            Arc::clone(&context.future_map),
        );
        connection.open().await.unwrap();

        let peers_queries = || {
            fake.count(|r| {
                matches!(r, Request::Query(q) if q.contents.contains("FROM system.peers"))
            })
        };
        let queried = peers_queries();
        let before = listener.calls().len();
        peers_silent.store(true, Ordering::SeqCst);
        // Each of these keeps the worker waiting for a whole deadline.
        for index in 4..=6 {
            fake.push_event(Event::TopologyChange(TopologyChangeEvent::NewNode(
                fake.address(index),
            )));
        }
        wait_until(|| peers_queries() > queried).await;

        let result = connection
            .query_single_page("SELECT slow")
            .await
            .map(|_| ());
        assert_matches!(
            result,
            Err(crate::errors::RequestAttemptError::RequestTimeout(_))
        );
        assert!(listener.calls().len() < before + 3);

        assert_eq!(
            new_calls(&listener, before, 3).await,
            vec!["join 127.0.0.4", "join 127.0.0.5", "join 127.0.0.6"]
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn registration_skips_an_unresponsive_candidate() {
        setup_tracing();
        let node_2_silent = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&node_2_silent);
        let fake = FakeCluster::start_with(tables(), move |index, request| match request {
            Request::Options if index == 2 && flag.load(Ordering::SeqCst) => {
                Some(Reply::Silence)
            }
            _ => None,
        })
        .await;
        let Setup { mut config, .. } = setup(&fake, &[1]);
        config.request_deadline = Duration::from_millis(300);
        let cluster = Cluster::connect(config).await.unwrap();

        node_2_silent.store(true, Ordering::SeqCst);
        fake.stop_node(1).await;
        wait_until(|| cluster.control_connection_address() == Some(fake.address(3))).await;
        assert!(cluster.is_available());
        assert_eq!(fake.node(3).count(|r| matches!(r, Request::Register(_))), 1);
    }
}

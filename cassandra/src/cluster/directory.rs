//! The topology directory keeps the driver's view of the cluster: peers,
//! their placement in datacenters and racks, the token ring and the keyspaces.
//!
//! Readers load an immutable [`TopologySnapshot`]; every update builds a new
//! snapshot and swaps it in, so a reader never observes a peer that is present
//! in one index and missing from another.

use arc_swap::ArcSwap;
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

use super::peer::PeerRecord;
use crate::routing::locator::{ReplicaList, ReplicationStrategy, TokenRing};
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;

/// A keyspace known to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceMetadata {
    /// Keyspace name.
    pub name: String,
    /// How the keyspace places replicas.
    pub strategy: ReplicationStrategy,
    pub durable_writes: bool,
    /// Names of the tables of the keyspace.
    pub tables: BTreeSet<String>,
}

impl KeyspaceMetadata {
    /// A keyspace with no tables.
    pub fn new(name: impl Into<String>, strategy: ReplicationStrategy) -> Self {
        KeyspaceMetadata {
            name: name.into(),
            strategy,
            durable_writes: true,
            tables: BTreeSet::new(),
        }
    }
}

/// Consistent view of the cluster at one point in time.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    cluster_name: Option<String>,
    partitioner: PartitionerName,
    peers: HashMap<IpAddr, Arc<PeerRecord>>,
    datacenters: HashMap<String, Vec<IpAddr>>,
    racks: HashMap<String, HashMap<String, Vec<IpAddr>>>,
    ring: TokenRing<IpAddr>,
    keyspaces: HashMap<String, Arc<KeyspaceMetadata>>,
}

impl TopologySnapshot {
    /// Name reported by `system.local`.
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Partitioner used by the cluster.
    pub fn partitioner(&self) -> PartitionerName {
        self.partitioner
    }

    /// Looks up a peer by its address.
    pub fn peer(&self, address: &IpAddr) -> Option<&Arc<PeerRecord>> {
        self.peers.get(address)
    }

    /// All known peers, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<PeerRecord>> {
        self.peers.values()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Names of all datacenters with at least one peer.
    pub fn datacenters(&self) -> impl Iterator<Item = &str> {
        self.datacenters.keys().map(String::as_str)
    }

    /// Peers of the datacenter, in the order they were added.
    pub fn datacenter_endpoints(&self, datacenter: &str) -> &[IpAddr] {
        self.datacenters
            .get(datacenter)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of distinct racks of the datacenter.
    pub fn datacenter_rack_count(&self, datacenter: &str) -> usize {
        self.racks.get(datacenter).map_or(0, HashMap::len)
    }

    /// Peers of one rack of a datacenter. Peers without a rack are listed under `""`.
    pub fn rack_endpoints(&self, datacenter: &str, rack: &str) -> &[IpAddr] {
        self.racks
            .get(datacenter)
            .and_then(|racks| racks.get(rack))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The token ring of all peers.
    pub fn ring(&self) -> &TokenRing<IpAddr> {
        &self.ring
    }

    /// Looks up a keyspace by name.
    pub fn keyspace(&self, name: &str) -> Option<&Arc<KeyspaceMetadata>> {
        self.keyspaces.get(name)
    }

    /// All known keyspaces.
    pub fn keyspaces(&self) -> impl Iterator<Item = &Arc<KeyspaceMetadata>> {
        self.keyspaces.values()
    }

    /// Natural replicas of the token in the given keyspace, in ring order.
    /// Empty if the keyspace is unknown.
    pub fn replicas(&self, keyspace: &str, token: &Token) -> ReplicaList {
        match self.keyspaces.get(keyspace) {
            Some(ks) => ks.strategy.replicas(token, self),
            None => ReplicaList::new(),
        }
    }

    fn without_peer(&self, address: &IpAddr) -> TopologySnapshot {
        let mut next = self.clone();
        let Some(old) = next.peers.remove(address) else {
            return next;
        };

        if let Some(dc) = old.datacenter.as_deref() {
            if let Some(endpoints) = next.datacenters.get_mut(dc) {
                endpoints.retain(|e| e != address);
                if endpoints.is_empty() {
                    next.datacenters.remove(dc);
                }
            }
            if let Some(racks) = next.racks.get_mut(dc) {
                if let Some(endpoints) = racks.get_mut(old.rack_key()) {
                    endpoints.retain(|e| e != address);
                    if endpoints.is_empty() {
                        racks.remove(old.rack_key());
                    }
                }
                if racks.is_empty() {
                    next.racks.remove(dc);
                }
            }
        }
        if !old.tokens.is_empty() {
            next.ring = next.ring.without(address);
        }
        next
    }

    fn with_peer(&self, peer: Arc<PeerRecord>) -> TopologySnapshot {
        let mut next = self.without_peer(&peer.address);

        if let Some(dc) = peer.datacenter.as_deref() {
            next.datacenters
                .entry(dc.to_owned())
                .or_default()
                .push(peer.address);
            next.racks
                .entry(dc.to_owned())
                .or_default()
                .entry(peer.rack_key().to_owned())
                .or_default()
                .push(peer.address);
        }
        if !peer.tokens.is_empty() {
            let entries = next
                .ring
                .iter()
                .cloned()
                .chain(peer.tokens.iter().map(|t| (t.clone(), peer.address)));
            next.ring = TokenRing::new(entries);
        }
        next.peers.insert(peer.address, peer);
        next
    }

    fn with_status(&self, address: &IpAddr, up: bool) -> Option<TopologySnapshot> {
        let peer = self.peers.get(address)?;
        if peer.up == up {
            return None;
        }
        // Placement does not depend on the status, so the indices stay as they are.
        let mut next = self.clone();
        next.peers
            .insert(*address, Arc::new(peer.with_status(up)));
        Some(next)
    }
}

/// Shared, atomically updated topology of the cluster.
#[derive(Debug, Default)]
pub struct TopologyDirectory {
    snapshot: ArcSwap<TopologySnapshot>,
}

impl TopologyDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.load_full()
    }

    /// Records the identity of the cluster read from `system.local`.
    pub fn set_cluster_info(&self, cluster_name: Option<String>, partitioner: PartitionerName) {
        self.snapshot.rcu(|current| {
            let mut next = TopologySnapshot::clone(current);
            next.cluster_name = cluster_name.clone();
            next.partitioner = partitioner;
            next
        });
    }

    /// Adds a peer, replacing any previous record of the same address in every index.
    /// Returns the replaced record.
    pub fn add_peer(&self, peer: PeerRecord) -> Option<Arc<PeerRecord>> {
        let peer = Arc::new(peer);
        trace!(address = %peer.address, tokens = peer.tokens.len(), "Adding peer");
        let previous = self
            .snapshot
            .rcu(|current| current.with_peer(Arc::clone(&peer)));
        previous.peers.get(&peer.address).cloned()
    }

    /// Marks a known peer as up. Returns the updated record, or `None`
    /// if the peer is unknown.
    pub fn set_peer_up(&self, address: &IpAddr) -> Option<Arc<PeerRecord>> {
        self.set_status(address, true)
    }

    /// Marks a known peer as down. Returns the updated record, or `None`
    /// if the peer is unknown.
    pub fn set_peer_down(&self, address: &IpAddr) -> Option<Arc<PeerRecord>> {
        self.set_status(address, false)
    }

    fn set_status(&self, address: &IpAddr, up: bool) -> Option<Arc<PeerRecord>> {
        // The record of the attempt that got stored, not of a later update.
        let mut updated = None;
        self.snapshot.rcu(|current| match current.with_status(address, up) {
            Some(next) => {
                updated = next.peer(address).cloned();
                Arc::new(next)
            }
            None => {
                updated = current.peer(address).cloned();
                Arc::clone(current)
            }
        });
        updated
    }

    /// Removes a peer from every index at once. Returns the removed record.
    pub fn remove_peer(&self, address: &IpAddr) -> Option<Arc<PeerRecord>> {
        let previous = self.snapshot.rcu(|current| current.without_peer(address));
        previous.peers.get(address).cloned()
    }

    /// Looks up a peer in the current snapshot.
    pub fn peer(&self, address: &IpAddr) -> Option<Arc<PeerRecord>> {
        self.snapshot.load().peer(address).cloned()
    }

    /// All peers of the current snapshot.
    pub fn peers(&self) -> Vec<Arc<PeerRecord>> {
        self.snapshot.load().peers().cloned().collect()
    }

    /// Peers of a datacenter in the current snapshot.
    pub fn datacenter_endpoints(&self, datacenter: &str) -> Vec<IpAddr> {
        self.snapshot.load().datacenter_endpoints(datacenter).to_vec()
    }

    /// Peers of a rack in the current snapshot.
    pub fn rack_endpoints(&self, datacenter: &str, rack: &str) -> Vec<IpAddr> {
        self.snapshot.load().rack_endpoints(datacenter, rack).to_vec()
    }

    /// Ring entries of the current snapshot in token order.
    pub fn ring(&self) -> Vec<(Token, IpAddr)> {
        self.snapshot.load().ring().iter().cloned().collect()
    }

    /// Adds or replaces a keyspace. Tables of a replaced keyspace are kept.
    pub fn put_keyspace(&self, mut keyspace: KeyspaceMetadata) {
        self.snapshot.rcu(|current| {
            let mut next = TopologySnapshot::clone(current);
            if let Some(old) = current.keyspaces.get(&keyspace.name) {
                keyspace.tables.extend(old.tables.iter().cloned());
            }
            next.keyspaces
                .insert(keyspace.name.clone(), Arc::new(keyspace.clone()));
            next
        });
    }

    /// Drops a keyspace together with its tables.
    pub fn remove_keyspace(&self, name: &str) -> Option<Arc<KeyspaceMetadata>> {
        let previous = self.snapshot.rcu(|current| {
            let mut next = TopologySnapshot::clone(current);
            next.keyspaces.remove(name);
            next
        });
        previous.keyspaces.get(name).cloned()
    }

    /// Records a table of a known keyspace. Returns `false` if the keyspace is unknown.
    pub fn add_table(&self, keyspace: &str, table: &str) -> bool {
        self.update_tables(keyspace, |tables| {
            tables.insert(table.to_owned());
        })
    }

    /// Forgets a table of a known keyspace. Returns `false` if the keyspace is unknown.
    pub fn remove_table(&self, keyspace: &str, table: &str) -> bool {
        self.update_tables(keyspace, |tables| {
            tables.remove(table);
        })
    }

    fn update_tables(&self, keyspace: &str, update: impl Fn(&mut BTreeSet<String>)) -> bool {
        let previous = self.snapshot.rcu(|current| {
            let Some(ks) = current.keyspaces.get(keyspace) else {
                return Arc::clone(current);
            };
            let mut ks = KeyspaceMetadata::clone(ks);
            update(&mut ks.tables);
            let mut next = TopologySnapshot::clone(current);
            next.keyspaces.insert(ks.name.clone(), Arc::new(ks));
            Arc::new(next)
        });
        previous.keyspaces.contains_key(keyspace)
    }

    /// Looks up a keyspace in the current snapshot.
    pub fn keyspace(&self, name: &str) -> Option<Arc<KeyspaceMetadata>> {
        self.snapshot.load().keyspace(name).cloned()
    }

    /// Natural replicas of the token in the keyspace, per the current snapshot.
    pub fn replicas(&self, keyspace: &str, token: &Token) -> ReplicaList {
        self.snapshot.load().replicas(keyspace, token)
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.snapshot.store(Arc::new(TopologySnapshot::default()));
    }

    /// Human readable summary used in logs.
    pub(crate) fn describe(&self) -> String {
        let snapshot = self.snapshot.load();
        snapshot
            .datacenters
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(dc, endpoints)| format!("{}: {} peers", dc, endpoints.len()))
            .join(", ")
    }
}

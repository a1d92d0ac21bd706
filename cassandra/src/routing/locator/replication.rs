use itertools::Itertools;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use super::ReplicaList;
use crate::cluster::TopologySnapshot;
use crate::errors::ReplicationStrategyError;
use crate::routing::Token;

/// Placement of the replicas of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicationStrategy {
    /// The first `replication_factor` distinct owners walking the ring from the token.
    SimpleStrategy {
        /// Number of copies of each partition.
        replication_factor: usize,
    },
    /// Replicas chosen per datacenter, spread over as many racks as possible.
    NetworkTopologyStrategy {
        /// Replication factors of datacenters with given names.
        datacenter_repfactors: HashMap<String, usize>,
    },
    /// The primary owner, one replica in another datacenter and one in another rack
    /// of the primary's datacenter, then the following owners in ring order.
    OldNetworkTopologyStrategy {
        /// Number of copies of each partition.
        replication_factor: usize,
    },
    /// Data that lives on a single node; replication factor is always 1.
    LocalStrategy,
    /// A strategy the driver does not know how to evaluate. It yields no replicas.
    Other {
        /// Class name as stored in the schema.
        name: String,
        /// Strategy options.
        data: HashMap<String, String>,
    },
}

const REPLICATION_FACTOR_KEY: &str = "replication_factor";

impl ReplicationStrategy {
    /// Builds a strategy from the `strategy_class` and `strategy_options` columns
    /// of `system.schema_keyspaces`. The class is matched by its simple name, so both
    /// `SimpleStrategy` and `org.apache.cassandra.locator.SimpleStrategy` are accepted.
    pub fn from_schema(
        strategy_class: &str,
        strategy_options: &str,
    ) -> Result<Self, ReplicationStrategyError> {
        let mut options = parse_options(strategy_options)?;
        options.remove("class");

        let simple_name = strategy_class
            .rsplit_once('.')
            .map_or(strategy_class, |(_, name)| name);

        let strategy = match simple_name {
            "SimpleStrategy" => ReplicationStrategy::SimpleStrategy {
                replication_factor: replication_factor_option(&options)?,
            },
            "OldNetworkTopologyStrategy" => ReplicationStrategy::OldNetworkTopologyStrategy {
                replication_factor: replication_factor_option(&options)?,
            },
            "NetworkTopologyStrategy" => {
                let datacenter_repfactors = options
                    .into_iter()
                    .map(|(dc, value)| {
                        let rf = parse_replication_factor(&dc, &value)?;
                        Ok((dc, rf))
                    })
                    .collect::<Result<_, ReplicationStrategyError>>()?;
                ReplicationStrategy::NetworkTopologyStrategy {
                    datacenter_repfactors,
                }
            }
            "LocalStrategy" => ReplicationStrategy::LocalStrategy,
            _ => ReplicationStrategy::Other {
                name: strategy_class.to_owned(),
                data: options,
            },
        };
        Ok(strategy)
    }

    /// Computes the natural replicas of the token, in ring order.
    pub fn replicas(&self, token: &Token, topology: &TopologySnapshot) -> ReplicaList {
        match self {
            ReplicationStrategy::SimpleStrategy { replication_factor } => {
                simple_replicas(token, *replication_factor, topology)
            }
            ReplicationStrategy::LocalStrategy => simple_replicas(token, 1, topology),
            ReplicationStrategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => nts_replicas(token, datacenter_repfactors, topology),
            ReplicationStrategy::OldNetworkTopologyStrategy { replication_factor } => {
                old_nts_replicas(token, *replication_factor, topology)
            }
            ReplicationStrategy::Other { .. } => ReplicaList::new(),
        }
    }
}

fn parse_options(options: &str) -> Result<HashMap<String, String>, ReplicationStrategyError> {
    if options.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let parsed: HashMap<String, Value> = serde_json::from_str(options)
        .map_err(|e| ReplicationStrategyError::BadOptions(e.to_string()))?;

    // Options are stored as strings, but numbers show up in hand-written schemas.
    parsed
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            Value::Number(n) => Ok((key, n.to_string())),
            other => Err(ReplicationStrategyError::BadOptions(format!(
                "unexpected value {} for {}",
                other, key
            ))),
        })
        .collect()
}

fn replication_factor_option(
    options: &HashMap<String, String>,
) -> Result<usize, ReplicationStrategyError> {
    let value = options
        .get(REPLICATION_FACTOR_KEY)
        .ok_or(ReplicationStrategyError::MissingReplicationFactor)?;
    parse_replication_factor(REPLICATION_FACTOR_KEY, value)
}

fn parse_replication_factor(key: &str, value: &str) -> Result<usize, ReplicationStrategyError> {
    value
        .trim()
        .parse()
        .map_err(|_| ReplicationStrategyError::BadReplicationFactor {
            key: key.to_owned(),
            value: value.to_owned(),
        })
}

fn simple_replicas(token: &Token, replication_factor: usize, topology: &TopologySnapshot) -> ReplicaList {
    topology
        .ring()
        .ring_range(token)
        .unique()
        .take(replication_factor)
        .copied()
        .collect()
}

struct DatacenterProgress<'a> {
    wanted: usize,
    found: usize,
    rack_count: usize,
    seen_racks: HashSet<&'a str>,
    skipped: Vec<IpAddr>,
}

impl DatacenterProgress<'_> {
    fn is_sufficient(&self) -> bool {
        self.found >= self.wanted
    }
}

fn nts_replicas(
    token: &Token,
    datacenter_repfactors: &HashMap<String, usize>,
    topology: &TopologySnapshot,
) -> ReplicaList {
    let mut progress: HashMap<&str, DatacenterProgress> = datacenter_repfactors
        .iter()
        .map(|(dc, rf)| {
            let progress = DatacenterProgress {
                wanted: (*rf).min(topology.datacenter_endpoints(dc).len()),
                found: 0,
                rack_count: topology.datacenter_rack_count(dc),
                seen_racks: HashSet::new(),
                skipped: Vec::new(),
            };
            (dc.as_str(), progress)
        })
        .collect();

    let mut unsatisfied = progress.values().filter(|p| !p.is_sufficient()).count();
    let mut replicas = ReplicaList::new();

    for endpoint in topology.ring().ring_range(token) {
        if unsatisfied == 0 {
            break;
        }
        // Nodes owning several tokens come around more than once.
        if replicas.contains(endpoint) {
            continue;
        }
        let Some(peer) = topology.peer(endpoint) else {
            continue;
        };
        let Some(dc_progress) = peer
            .datacenter
            .as_deref()
            .and_then(|dc| progress.get_mut(dc))
        else {
            continue;
        };
        if dc_progress.is_sufficient() {
            continue;
        }

        let mut accept = |dc_progress: &mut DatacenterProgress, endpoint: IpAddr| {
            dc_progress.found += 1;
            replicas.push(endpoint);
            if dc_progress.is_sufficient() {
                unsatisfied -= 1;
            }
        };

        if dc_progress.seen_racks.len() == dc_progress.rack_count {
            // Every rack already holds a replica; take nodes as they come.
            accept(dc_progress, *endpoint);
        } else if dc_progress.seen_racks.contains(peer.rack_key()) {
            if !dc_progress.skipped.contains(endpoint) {
                dc_progress.skipped.push(*endpoint);
            }
        } else {
            accept(dc_progress, *endpoint);
            dc_progress.seen_racks.insert(peer.rack_key());

            if dc_progress.seen_racks.len() == dc_progress.rack_count {
                let skipped = std::mem::take(&mut dc_progress.skipped);
                for skipped_endpoint in skipped {
                    if dc_progress.is_sufficient() {
                        break;
                    }
                    accept(dc_progress, skipped_endpoint);
                }
            }
        }
    }

    replicas
}

fn old_nts_replicas(
    token: &Token,
    replication_factor: usize,
    topology: &TopologySnapshot,
) -> ReplicaList {
    let mut replicas = ReplicaList::new();
    if replication_factor == 0 {
        return replicas;
    }

    let mut walk = topology.ring().ring_range(token);
    let Some(primary) = walk.next() else {
        return replicas;
    };
    replicas.push(*primary);

    let placement = |endpoint: &IpAddr| {
        topology
            .peer(endpoint)
            .map(|peer| (peer.datacenter.as_deref(), peer.rack_key()))
            .unwrap_or((None, ""))
    };
    let (primary_dc, primary_rack) = placement(primary);

    let mut other_datacenter_taken = false;
    let mut other_rack_taken = false;
    for endpoint in walk {
        if replicas.len() >= replication_factor {
            break;
        }
        let (dc, rack) = placement(endpoint);
        if dc != primary_dc {
            if !other_datacenter_taken {
                replicas.push(*endpoint);
                other_datacenter_taken = true;
            }
        } else if rack != primary_rack && !other_rack_taken {
            replicas.push(*endpoint);
            other_rack_taken = true;
        }
    }

    for endpoint in topology.ring().ring_range(token) {
        if replicas.len() >= replication_factor {
            break;
        }
        if !replicas.contains(endpoint) {
            replicas.push(*endpoint);
        }
    }

    replicas
}

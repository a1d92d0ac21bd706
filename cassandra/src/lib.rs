//! Async driver core for [Apache Cassandra®](https://cassandra.apache.org/) speaking
//! the native protocol v2.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Cluster].\
//! A `Cluster` is discovered through a few seed nodes. It keeps a control connection
//! registered for server events and maintains the topology, the schema and the
//! routing policy's view of the cluster from then on:
//!
//! ```rust,no_run
//! use cassandra::{Cluster, ClusterConfig};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let config = ClusterConfig::new(["127.0.0.1", "127.0.0.2"])?;
//!     let cluster = Cluster::connect(config).await?;
//!     println!("Connected to {:?}", cluster.cluster_name());
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Making queries
//! Statements are executed by a [Session], created from the cluster and optionally
//! bound to a keyspace:
//! * [Simple](crate::statement::Query)
//! * [Prepared](crate::statement::PreparedStatement) (need to be [prepared](crate::Session::prepare) before use)
//!
//! ```rust,no_run
//! # use cassandra::Cluster;
//! # use std::error::Error;
//! # use std::sync::Arc;
//! # async fn check_only_compiles(cluster: &Arc<Cluster>) -> Result<(), Box<dyn Error>> {
//! let session = cluster.session(Some("ks"))?;
//! session.execute("INSERT INTO tab (a, b) VALUES (1, 'one')").await?;
//!
//! let prepared = session.prepare("SELECT a, b FROM tab").await?;
//! let result = session.execute_prepared(&prepared).await?;
//! if let Some(rows) = result.rows() {
//!     for row in &rows.rows {
//!         let a: i32 = rows.get(row, "a")?;
//!         println!("a = {a}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Routing and retries
//! Every request is sent to the endpoints chosen by the configured
//! [routing policy](crate::policies::load_balancing), trying the next one as long as
//! the [retry policy](crate::policies::retry) allows it.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use cassandra_cql;

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub(crate) mod utils;

pub use client::{ClusterConfig, Session};
pub use cluster::{Cluster, EventListener, TopologySnapshot};
pub use response::QueryResult;
pub use statement::{PreparedStatement, Query, Statement};

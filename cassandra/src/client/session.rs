//! `Session` is the main object used to execute CQL requests.\
//! It keeps at most one connection per endpoint and runs every request
//! through the cluster's routing and retry policies.

use cassandra_cql::errors::DbError;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::cluster::Cluster;
use crate::errors::{ConnectionError, ExecutionError, RequestAttemptError};
use crate::network::{Connection, VerifiedKeyspaceName};
use crate::policies::load_balancing::RoutingInfo;
use crate::policies::retry::RetryContext;
use crate::response::query_result::QueryResult;
use crate::statement::{PreparedStatement, Statement};

/// `Session` executes statements against a [`Cluster`].
///
/// Sessions are created with [`Cluster::session`]. All sessions of a cluster share
/// its topology, policies and the registry of prepared statements; each session
/// has its own connections, bound to its keyspace.
pub struct Session {
    cluster: Arc<Cluster>,
    keyspace: Option<VerifiedKeyspaceName>,
    connections: Mutex<HashMap<IpAddr, Arc<Connection>>>,
}

impl Session {
    pub(crate) fn new(cluster: Arc<Cluster>, keyspace: Option<VerifiedKeyspaceName>) -> Self {
        Session {
            cluster,
            keyspace,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The cluster this session belongs to.
    pub fn get_cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Keyspace every connection of this session is switched to.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_ref().map(VerifiedKeyspaceName::as_str)
    }

    /// Executes a statement.
    ///
    /// Endpoints are tried in the order given by the routing policy; whether a failed
    /// attempt is followed by another one is up to the retry policy. A node that no longer
    /// knows a prepared statement is given the statement again before it is resent.
    ///
    /// ```rust,no_run
    /// # use cassandra::{Cluster, ClusterConfig};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cluster = Cluster::connect(ClusterConfig::new(["127.0.0.1"])?).await?;
    /// let session = cluster.session(Some("ks"))?;
    /// let result = session.execute("SELECT a, b FROM tab").await?;
    /// println!("{} rows", result.rows().map_or(0, |rows| rows.rows.len()));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let context = self.retry_context(&statement.routing_info())?;
        self.execute_with_context(&statement, context).await
    }

    /// Executes a prepared statement with the values bound to it.
    pub async fn execute_prepared(
        &self,
        prepared: &PreparedStatement,
    ) -> Result<QueryResult, ExecutionError> {
        self.execute(prepared.clone()).await
    }

    /// Executes a statement trying the endpoints of a caller-built retry context.
    pub async fn execute_with_context(
        &self,
        statement: &Statement,
        context: RetryContext,
    ) -> Result<QueryResult, ExecutionError> {
        self.ensure_available()?;
        let recovery = match statement {
            Statement::Prepared(prepared) => Some(prepared.get_statement()),
            Statement::Query(_) => None,
        };
        self.run_with_retries(context, recovery, |connection| async move {
            match statement {
                Statement::Query(query) => connection.query(query).await,
                Statement::Prepared(prepared) => connection.execute(prepared).await,
            }
        })
        .await
    }

    /// Prepares a statement.
    ///
    /// The statement is remembered by the cluster: connections opened later prepare it
    /// right after the handshake, and the other open connections of this session are
    /// asked to prepare it in the background.
    pub async fn prepare(&self, query: &str) -> Result<PreparedStatement, ExecutionError> {
        let context = self.retry_context(&RoutingInfo::default())?;
        let (prepared, coordinator) = self
            .run_with_retries(context, None, |connection| async move {
                let prepared = connection.prepare(query).await?;
                Ok::<_, RequestAttemptError>((prepared, connection.get_connect_address()))
            })
            .await?;

        let newly_registered = self
            .cluster
            .context()
            .register_prepared(prepared.get_id().clone(), query);
        if newly_registered {
            self.prepare_on_other_connections(query, coordinator);
        }
        Ok(prepared)
    }

    /// Executes a statement, blocking the current thread until the result arrives or
    /// the cluster's request deadline passes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn execute_blocking(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, ExecutionError> {
        self.block_on(self.execute(statement))
    }

    /// Prepares a statement, blocking the current thread. See [`Session::execute_blocking`].
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn prepare_blocking(&self, query: &str) -> Result<PreparedStatement, ExecutionError> {
        self.block_on(self.prepare(query))
    }

    fn block_on<T>(
        &self,
        request: impl Future<Output = Result<T, ExecutionError>>,
    ) -> Result<T, ExecutionError> {
        let deadline = self.cluster.config().request_deadline;
        self.cluster.runtime().block_on(async {
            timeout(deadline, request)
                .await
                .map_err(|_| ExecutionError::RequestTimeout(deadline))?
        })
    }

    fn ensure_available(&self) -> Result<(), ExecutionError> {
        match self.cluster.is_available() {
            true => Ok(()),
            false => Err(ExecutionError::ClusterUnavailable),
        }
    }

    fn retry_context(&self, routing: &RoutingInfo<'_>) -> Result<RetryContext, ExecutionError> {
        self.ensure_available()?;
        let routing = RoutingInfo {
            keyspace: routing.keyspace.or(self.get_keyspace()),
            ..routing.clone()
        };
        RetryContext::new(
            Arc::clone(&self.cluster.config().retry_policy),
            self.cluster.active_endpoints(&routing),
        )
    }

    /// Runs `attempt` on the endpoints of `context` until it succeeds or the retry
    /// policy gives up. `recovery` is the text prepared again when a node answers UNPREPARED.
    async fn run_with_retries<T, F, Fut>(
        &self,
        mut context: RetryContext,
        recovery: Option<&str>,
        mut attempt: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, RequestAttemptError>>,
    {
        while let Some(endpoint) = context.current_endpoint() {
            let (error, connection) = match self.connection(endpoint).await {
                Ok(connection) => match attempt(Arc::clone(&connection)).await {
                    Ok(result) => {
                        trace!(%endpoint, "Request succeeded");
                        return Ok(result);
                    }
                    Err(error) => (error, Some(connection)),
                },
                Err(error) => (RequestAttemptError::from(error), None),
            };
            trace!(%endpoint, error = %error, "Request failed");

            let unprepared = matches!(
                error,
                RequestAttemptError::DbError(DbError::Unprepared { .. }, _)
            );
            context.set_failure(error);
            if !context.can_retry() {
                break;
            }

            if let (true, Some(statement), Some(connection)) = (unprepared, recovery, connection) {
                match connection.reprepare(statement).await {
                    Ok(_) => {
                        debug!(%endpoint, "Statement prepared again, resending");
                        continue;
                    }
                    Err(error) => {
                        debug!(%endpoint, error = %error, "Failed to prepare the statement again");
                        break;
                    }
                }
            }

            if context.next_endpoint().is_none() {
                break;
            }
        }

        Err(context
            .into_last_error()
            .map_or(ExecutionError::EmptyPlan, ExecutionError::LastAttemptError))
    }

    /// Returns an open connection to `endpoint`, opening one if needed.
    async fn connection(&self, endpoint: IpAddr) -> Result<Arc<Connection>, ConnectionError> {
        let (connection, fresh) = {
            let mut connections = self.connections.lock().unwrap();
            match connections.get(&endpoint) {
                Some(connection) if connection.is_open() => return Ok(Arc::clone(connection)),
                // Another request is opening it.
                Some(connection) if !connection.is_closed() && !self.is_stale(connection) => {
                    (Arc::clone(connection), false)
                }
                _ => {
                    let context = self.cluster.context();
                    let (connection, _) = Connection::new(
                        SocketAddr::new(endpoint, self.cluster.config().port),
                        context.connection_config(self.keyspace.clone()),
                        Arc::clone(&context.future_map),
                    );
                    let connection = Arc::new(connection);
                    if let Some(evicted) = connections.insert(endpoint, Arc::clone(&connection)) {
                        debug!(%endpoint, closed = evicted.is_closed(), "Replacing cached connection");
                        evicted.close();
                    }
                    (connection, true)
                }
            }
        };

        connection.open().await?;
        if fresh {
            self.reprepare_all(&connection).await;
        }
        Ok(connection)
    }

    fn is_stale(&self, connection: &Connection) -> bool {
        connection.created_at().elapsed() >= self.cluster.config().connection.connect_timeout
    }

    async fn reprepare_all(&self, connection: &Connection) {
        let statements = self.cluster.context().prepared_statements();
        if statements.is_empty() {
            return;
        }
        let address = connection.get_connect_address();
        trace!(%address, count = statements.len(), "Preparing known statements");
        let results = join_all(
            statements
                .iter()
                .map(|(_, statement)| connection.reprepare(statement)),
        )
        .await;
        for ((id, _), result) in statements.iter().zip(results) {
            match result {
                Ok(new_id) if new_id != *id => {
                    debug!(%address, "Node assigned another id to a known statement")
                }
                Ok(_) => {}
                Err(error) => debug!(%address, error = %error, "Failed to prepare a known statement"),
            }
        }
    }

    fn prepare_on_other_connections(&self, query: &str, coordinator: SocketAddr) {
        let others: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .filter(|connection| {
                connection.is_open() && connection.get_connect_address() != coordinator
            })
            .cloned()
            .collect();
        if others.is_empty() {
            return;
        }

        let query = query.to_owned();
        tokio::spawn(async move {
            for (connection, result) in
                others.iter().zip(join_all(others.iter().map(|c| c.prepare(&query))).await)
            {
                if let Err(error) = result {
                    debug!(
                        address = %connection.get_connect_address(),
                        error = %error,
                        "Background prepare failed"
                    );
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn cached_connection(&self, endpoint: IpAddr) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&endpoint).cloned()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cluster", &self.cluster)
            .field("keyspace", &self.get_keyspace())
            .field("connections", &self.connections.lock().unwrap().len())
            .finish()
    }
}

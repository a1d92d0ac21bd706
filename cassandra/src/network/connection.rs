use arc_swap::ArcSwapOption;
use bytes::Bytes;
use cassandra_cql::frame::frame_errors::FrameError;
use cassandra_cql::frame::request::{
    AuthResponse, Options, Prepare, Register, SerializableRequest, Startup,
};
use cassandra_cql::frame::response::authenticate::Authenticate;
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::response::{result, NonErrorResponse, Response};
use cassandra_cql::frame::server_event_type::EventType;
use cassandra_cql::frame::{self, Compression, SerializedRequest};
use futures::FutureExt;
use futures::future::RemoteHandle;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::future_map::{ConnectionId, FutureMap, TaskResponse};
use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    RequestAttemptError,
};
use crate::response::QueryResult;
use crate::statement::{Consistency, PreparedStatement, Query};

/// Used to listen for a fatal error of an opened connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// Progress of a connection through its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Nothing happened yet.
    Created = 0,
    /// TCP connect and OPTIONS in progress.
    Connecting = 1,
    /// STARTUP was sent, waiting for READY or AUTHENTICATE.
    StartupSent = 2,
    /// Exchanging authentication messages.
    Authenticating = 3,
    /// Ready to carry requests.
    Open = 4,
    /// Closed or broken; never opens again.
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::StartupSent,
            3 => ConnectionState::Authenticating,
            4 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Configuration of a single connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the TCP connect.
    pub connect_timeout: Duration,
    /// Compression to negotiate; the node must list it in SUPPORTED.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalive probes are sent. `None` leaves the OS default.
    pub tcp_keepalive_interval: Option<Duration>,
    /// Used if the node asks for authentication.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// CQL version announced in STARTUP.
    pub cql_version: String,
    /// Keyspace the connection switches to right after the handshake.
    pub keyspace: Option<VerifiedKeyspaceName>,
    /// Where pushed events go. Events are only pushed after [`Connection::register`].
    pub event_sender: Option<mpsc::Sender<Event>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            authenticator: None,
            cql_version: frame::CQL_VERSION.to_owned(),
            keyspace: None,
            event_sender: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("authenticator", &self.authenticator.is_some())
            .field("cql_version", &self.cql_version)
            .field("keyspace", &self.keyspace)
            .field("event_sender", &self.event_sender.is_some())
            .finish()
    }
}

/// A keyspace name checked to be usable in a `USE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    /// Quote the name, preserving its case.
    pub is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    /// Validates the name.
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    /// The name as given.
    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names have up to 48 alphanumeric characters or underscores.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len: usize = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ))
                }
            };
        }

        Ok(())
    }
}

/// A parsed response that is not an ERROR.
pub(crate) struct QueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
}

struct Task {
    serialized_request: SerializedRequest,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    // Dropping the handle stops the router.
    _worker_handle: RemoteHandle<()>,
}

/// A connection to one node.
///
/// Requests are multiplexed over the socket by stream id; responses are matched
/// to requests only through the shared [`FutureMap`].
pub struct Connection {
    id: ConnectionId,
    connect_address: SocketAddr,
    config: ConnectionConfig,
    future_map: Arc<FutureMap>,
    state: Arc<AtomicU8>,
    registered: AtomicBool,
    compression_active: AtomicBool,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    open_result: watch::Sender<Option<Result<(), ConnectionError>>>,
    router: StdMutex<Option<RouterHandle>>,
    error_sender: StdMutex<Option<oneshot::Sender<ConnectionError>>>,
    created_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connect_address", &self.connect_address)
            .field("state", &self.state())
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection in the [`ConnectionState::Created`] state. Nothing is sent
    /// until [`Connection::open`] is called.
    ///
    /// The returned receiver resolves when the opened connection breaks.
    pub(crate) fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
        future_map: Arc<FutureMap>,
    ) -> (Self, ErrorReceiver) {
        let (error_sender, error_receiver) = oneshot::channel();
        let (open_result, _) = watch::channel(None);
        let connection = Connection {
            id: future_map.next_connection_id(),
            connect_address,
            config,
            future_map,
            state: Arc::new(AtomicU8::new(ConnectionState::Created as u8)),
            registered: AtomicBool::new(false),
            compression_active: AtomicBool::new(false),
            keyspace: ArcSwapOption::empty(),
            open_result,
            router: StdMutex::new(None),
            error_sender: StdMutex::new(Some(error_sender)),
            created_at: Instant::now(),
        };
        (connection, error_receiver)
    }

    /// Address the connection is opened against.
    pub fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection can carry requests.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the connection was closed or broke.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether the connection receives pushed events.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Keyspace the connection is switched to, if any.
    pub fn get_keyspace(&self) -> Option<Arc<VerifiedKeyspaceName>> {
        self.keyspace.load_full()
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Performs the handshake. Only the first call does the work; concurrent
    /// and later callers get the outcome of that one.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        if self.transition(ConnectionState::Created, ConnectionState::Connecting) {
            let mut guard = HandshakeGuard {
                connection: self,
                finished: false,
            };
            let result = self.handshake().await;
            guard.finished = true;
            match &result {
                Ok(()) => debug!(address = %self.connect_address, "Connection opened"),
                Err(err) => {
                    debug!(address = %self.connect_address, error = %err, "Connection handshake failed");
                    self.shutdown(err.clone());
                }
            }
            self.open_result.send_replace(Some(result.clone()));
            return result;
        }

        let mut receiver = self.open_result.subscribe();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        match outcome {
            Ok(Some(Ok(()))) if self.is_closed() => Err(ConnectionError::Closed),
            Ok(Some(result)) => result,
            _ => Err(ConnectionError::Closed),
        }
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let stream = self.connect_tcp().await?;
        self.spawn_router(stream);

        trace!(address = %self.connect_address, "Sending OPTIONS");
        let supported = match self.send_request_unchecked(&Options).await?.response {
            NonErrorResponse::Supported(supported) => supported,
            other => return Err(ConnectionError::UnexpectedResponse(response_kind(&other))),
        };

        let mut options = HashMap::new();
        options.insert(
            frame::request::startup::CQL_VERSION_KEY.to_owned(),
            self.config.cql_version.clone(),
        );
        if let Some(compression) = self.config.compression {
            if !supported.supports_compression(&compression.to_string()) {
                return Err(ConnectionError::CompressionNotSupported(compression));
            }
            options.insert(
                frame::request::startup::COMPRESSION_KEY.to_owned(),
                compression.to_string(),
            );
        }

        if !self.transition(ConnectionState::Connecting, ConnectionState::StartupSent) {
            return Err(ConnectionError::Closed);
        }
        trace!(address = %self.connect_address, "Sending STARTUP");
        let startup = self.send_request_unchecked(&Startup { options }).await?;
        self.compression_active
            .store(self.config.compression.is_some(), Ordering::Release);

        match startup.response {
            NonErrorResponse::Ready => {}
            NonErrorResponse::Authenticate(authenticate) => {
                if !self.transition(ConnectionState::StartupSent, ConnectionState::Authenticating) {
                    return Err(ConnectionError::Closed);
                }
                self.authenticate(authenticate).await?;
            }
            other => return Err(ConnectionError::UnexpectedResponse(response_kind(&other))),
        }

        if let Some(keyspace) = &self.config.keyspace {
            self.use_keyspace_unchecked(keyspace).await?;
        }

        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != ConnectionState::Closed as u8).then_some(ConnectionState::Open as u8)
            })
            .map_err(|_| ConnectionError::Closed)?;
        Ok(())
    }

    async fn authenticate(&self, authenticate: Authenticate) -> Result<(), ConnectionError> {
        let authenticator_name = authenticate.authenticator;
        let authenticator = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| ConnectionError::MissingAuthentication(authenticator_name.clone()))?;

        debug!(address = %self.connect_address, authenticator = %authenticator_name, "Authenticating");
        let (mut response, mut session) = authenticator
            .start_authentication_session(&authenticator_name)
            .await
            .map_err(ConnectionError::AuthenticationFailed)?;

        loop {
            match self
                .send_request_unchecked(&AuthResponse { token: response })
                .await?
                .response
            {
                NonErrorResponse::AuthChallenge(challenge) => {
                    response = session
                        .evaluate_challenge(challenge.token.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                }
                NonErrorResponse::AuthSuccess(success) => {
                    session
                        .success(success.token.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                    return Ok(());
                }
                other => return Err(ConnectionError::UnexpectedResponse(response_kind(&other))),
            }
        }
    }

    async fn connect_tcp(&self) -> Result<TcpStream, ConnectionError> {
        let connect = TcpStream::connect(self.connect_address);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout(self.config.connect_timeout)),
        };
        stream.set_nodelay(self.config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = self.config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }
        Ok(stream)
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // "time" is the idle period before probing starts; "interval" separates the probes.
        let tcp_keepalive = TcpKeepalive::new()
            .with_time(tcp_keepalive_interval)
            .with_interval(Duration::from_secs(1));

        let sf = SockRef::from(stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    fn spawn_router(&self, stream: TcpStream) {
        let (submit_channel, receiver) = mpsc::channel(1024);
        let error_sender = self.error_sender.lock().unwrap().take();

        let (task, handle) = Self::router(
            self.id,
            stream,
            receiver,
            error_sender,
            Arc::clone(&self.future_map),
            Arc::clone(&self.state),
            self.config.event_sender.clone(),
            self.config.compression,
        )
        .remote_handle();
        tokio::task::spawn(task);

        *self.router.lock().unwrap() = Some(RouterHandle {
            submit_channel,
            _worker_handle: handle,
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn router(
        connection: ConnectionId,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: Option<oneshot::Sender<ConnectionError>>,
        future_map: Arc<FutureMap>,
        state: Arc<AtomicU8>,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) {
        let (read_half, write_half) = split(stream);

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            connection,
            &future_map,
            event_sender,
            compression,
        );
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), receiver);

        let result = futures::try_join!(r, w);
        state.store(ConnectionState::Closed as u8, Ordering::Release);

        let error: ConnectionError = match result {
            Ok(_) => ConnectionError::Closed,
            Err(err) => {
                warn!(connection, error = %err, "Connection broke");
                err.into()
            }
        };

        // Respond to all pending requests with the error
        future_map.fail_connection(connection, &error);

        // If someone is listening for connection errors notify them
        if let Some(error_sender) = error_sender {
            let _ = error_sender.send(error);
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        connection: ConnectionId,
        future_map: &FutureMap,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(read_error)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream {
                // Negative streams other than -1 are not used by the protocol.
                stream if stream < -1 => continue,
                -1 => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender).await?;
                    }
                }
                stream => {
                    future_map.complete(connection, stream, response);
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // Ends when the connection drops the sender half of the channel.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let req_data: &[u8] = task.serialized_request.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(|err| BrokenConnectionErrorKind::WriteError(Arc::new(err)))?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(|err| BrokenConnectionErrorKind::WriteError(Arc::new(err)))?;
        }

        Ok(())
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let event = match Self::parse_response(task_response, compression) {
            Ok(QueryResponse {
                response: NonErrorResponse::Event(event),
                ..
            }) => event,
            Ok(other) => {
                error!("Expected to receive Event response, got {:?}", other.response);
                return Err(BrokenConnectionErrorKind::CqlEventHandlingError(format!(
                    "unexpected {} on the event stream",
                    response_kind(&other.response)
                ))
                .into());
            }
            Err(err) => {
                return Err(
                    BrokenConnectionErrorKind::CqlEventHandlingError(err.to_string()).into(),
                )
            }
        };

        trace!(?event, "Received event");
        if event_sender.send(event).await.is_err() {
            debug!("Event receiver is gone, dropping event");
        }
        Ok(())
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;
        let response = response.into_non_error_response()?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
        })
    }

    /// Sends the request without looking at the handshake state.
    async fn send_request_unchecked(
        &self,
        request: &impl SerializableRequest,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let submit_channel = self
            .router
            .lock()
            .unwrap()
            .as_ref()
            .map(|router| router.submit_channel.clone())
            .ok_or(RequestAttemptError::ConnectionClosed)?;

        let compression = if self.compression_active.load(Ordering::Acquire) {
            self.config.compression
        } else {
            None
        };
        let mut serialized_request = SerializedRequest::make(request, compression, false)?;

        let (stream_id, receiver) = self.future_map.allocate(self.id)?;
        serialized_request.set_stream(stream_id);

        if submit_channel
            .send(Task { serialized_request })
            .await
            .is_err()
        {
            self.future_map.release(self.id, stream_id);
            return Err(BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into());
        }

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })??;

        Self::parse_response(task_response, self.config.compression)
    }

    /// Sends a request on the opened connection.
    pub(crate) async fn send_request(
        &self,
        request: &impl SerializableRequest,
    ) -> Result<QueryResponse, RequestAttemptError> {
        match self.state() {
            ConnectionState::Open => self.send_request_unchecked(request).await,
            ConnectionState::Closed => Err(RequestAttemptError::ConnectionClosed),
            _ => Err(RequestAttemptError::NotYetOpen),
        }
    }

    /// Executes a query.
    pub async fn query(&self, query: &Query) -> Result<QueryResult, RequestAttemptError> {
        let response = self.send_request(&query.to_request()).await?;
        self.into_query_result(response)
    }

    /// Executes an unpaged query at consistency ONE; used to read the system tables.
    pub(crate) async fn query_single_page(
        &self,
        contents: &str,
    ) -> Result<QueryResult, RequestAttemptError> {
        let mut query = Query::new(contents);
        query.set_consistency(Consistency::One);
        query.disable_paging();
        self.query(&query).await
    }

    /// Prepares a statement on this node.
    pub async fn prepare(&self, contents: &str) -> Result<PreparedStatement, RequestAttemptError> {
        let response = self
            .send_request(&Prepare {
                query: contents.to_owned(),
            })
            .await?;
        match response.response {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => Ok(
                PreparedStatement::new(prepared.id, contents, prepared.prepared_metadata),
            ),
            other => Err(RequestAttemptError::UnexpectedResponse(response_kind(&other))),
        }
    }

    /// Executes a prepared statement with its bound values.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
    ) -> Result<QueryResult, RequestAttemptError> {
        let response = self.send_request(&prepared.to_request()).await?;
        self.into_query_result(response)
    }

    /// Prepares statement text again, returning the id assigned by the node.
    pub(crate) async fn reprepare(&self, contents: &str) -> Result<Bytes, RequestAttemptError> {
        self.prepare(contents)
            .await
            .map(|prepared| prepared.get_id().clone())
    }

    /// Subscribes the connection to pushed events of the given types.
    pub async fn register(&self, event_types: &[EventType]) -> Result<(), RequestAttemptError> {
        let register = Register {
            event_types_to_register_for: event_types.to_vec(),
        };
        match self.send_request(&register).await?.response {
            NonErrorResponse::Ready => {
                self.registered.store(true, Ordering::Release);
                debug!(address = %self.connect_address, ?event_types, "Registered for events");
                Ok(())
            }
            other => Err(RequestAttemptError::UnexpectedResponse(response_kind(&other))),
        }
    }

    /// Switches the connection to another keyspace.
    pub async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), RequestAttemptError> {
        match self.state() {
            ConnectionState::Open => self.use_keyspace_unchecked(keyspace_name).await,
            ConnectionState::Closed => Err(RequestAttemptError::ConnectionClosed),
            _ => Err(RequestAttemptError::NotYetOpen),
        }
    }

    async fn use_keyspace_unchecked(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), RequestAttemptError> {
        // Keyspace names cannot be bound values.
        let contents = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };
        let response = self
            .send_request_unchecked(&Query::new(contents).to_request())
            .await?;

        match response.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace))
                if set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str()) =>
            {
                self.keyspace.store(Some(Arc::new(keyspace_name.clone())));
                Ok(())
            }
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace)) => {
                Err(RequestAttemptError::InvalidMessage(format!(
                    "Switched to keyspace {} instead of {}",
                    set_keyspace.keyspace_name,
                    keyspace_name.as_str()
                )))
            }
            other => Err(RequestAttemptError::UnexpectedResponse(response_kind(&other))),
        }
    }

    fn into_query_result(&self, response: QueryResponse) -> Result<QueryResult, RequestAttemptError> {
        match response.response {
            NonErrorResponse::Result(result) => Ok(QueryResult::new(
                result,
                response.tracing_id,
                self.connect_address,
            )),
            other => Err(RequestAttemptError::UnexpectedResponse(response_kind(&other))),
        }
    }

    /// Closes the connection, failing every request still waiting on it.
    pub fn close(&self) {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous != ConnectionState::Closed as u8 {
            debug!(address = %self.connect_address, "Closing connection");
        }
        self.shutdown(ConnectionError::Closed);
    }

    fn shutdown(&self, error: ConnectionError) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let router = self.router.lock().unwrap().take();
        drop(router);
        self.future_map.fail_connection(self.id, &error);
        self.open_result.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(Err(error.clone()));
                true
            } else {
                false
            }
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.future_map
            .fail_connection(self.id, &ConnectionError::Closed);
    }
}

/// Closes the connection if the future running the handshake is dropped
/// before the handshake finished, so waiting openers do not hang.
struct HandshakeGuard<'a> {
    connection: &'a Connection,
    finished: bool,
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(address = %self.connection.connect_address, "Handshake cancelled");
            self.connection.shutdown(ConnectionError::Closed);
        }
    }
}

fn read_error(err: FrameError) -> BrokenConnectionError {
    match err {
        FrameError::StdIoError(io_error) if io_error.kind() == ErrorKind::UnexpectedEof => {
            BrokenConnectionErrorKind::ClosedByPeer.into()
        }
        FrameError::ConnectionClosed(..) => BrokenConnectionErrorKind::ClosedByPeer.into(),
        other => BrokenConnectionErrorKind::FrameReadError(Arc::new(other)).into(),
    }
}

fn response_kind(response: &NonErrorResponse) -> &'static str {
    match response {
        NonErrorResponse::Ready => "READY",
        NonErrorResponse::Result(_) => "RESULT",
        NonErrorResponse::Authenticate(_) => "AUTHENTICATE",
        NonErrorResponse::AuthSuccess(_) => "AUTH_SUCCESS",
        NonErrorResponse::AuthChallenge(_) => "AUTH_CHALLENGE",
        NonErrorResponse::Supported(_) => "SUPPORTED",
        NonErrorResponse::Event(_) => "EVENT",
    }
}

use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use helenus_cql::frame::request::{self, options, Query, QueryParameters, SerializableRequest};
use helenus_cql::frame::response::authenticate::Authenticate;
use helenus_cql::frame::response::{self, result, Response, ResponseOpcode};
use helenus_cql::frame::types::Consistency;
use helenus_cql::frame::value::SerializedValues;
use helenus_cql::frame::{self, Compression, FrameParams, SerializedRequest};

use crate::authentication::AuthenticatorProvider;
use crate::client::execution_options::ExecutionOptions;
use crate::errors::{
    BadKeyspaceName, BadQuery, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    QueryError, UseKeyspaceError,
};
use crate::response::QueryResult;

// Threshold for the number of stream ids that were orphaned longer than
// OLD_AGE_ORPHAN_THRESHOLD ago. Reaching it breaks the connection.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(1);

/// Number of stream ids available on a single connection.
pub(crate) const MAX_STREAM_IDS: usize = i16::MAX as usize + 1;

/// Default bound on concurrently outstanding requests per connection.
pub(crate) const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Lifecycle of a single connection.
///
/// ```text
/// Connecting -> Ready -> Closing -> Closed
///                 |
///                 +----> Disconnected   (I/O failure; the pool replaces it)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

// Shared between the Connection object and its router task.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(std::sync::atomic::Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0
            .store(state as u8, std::sync::atomic::Ordering::Release);
    }

    // Moves to `to` unless the current state is one of `unless`.
    // Returns whether the transition happened.
    fn transition(&self, to: ConnectionState, unless: &[ConnectionState]) -> bool {
        self.0
            .fetch_update(
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
                |current| {
                    if unless.contains(&ConnectionState::from_u8(current)) {
                        None
                    } else {
                        Some(to as u8)
                    }
                },
            )
            .is_ok()
    }
}

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,

    state: Arc<StateCell>,
    // One permit per request that may be outstanding. Taken before the
    // request enters the write queue, so the writer never runs out of
    // stream ids because of live requests.
    in_flight: Semaphore,
    max_in_flight: usize,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request send by `Connection::send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` is cancelled (or times out), it sends
    // a notification about orphaning via the sender below.
    // Unbounded, because only unbounded channels can be pushed to
    // synchronously, which is needed in `Drop` implementations.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, QueryError> {
        let serialized_request = SerializedRequest::make(request, compression, tracing)
            .map_err(|e| {
                QueryError::BadQuery(BadQuery::Other(format!(
                    "Failed to serialize request: {}",
                    e
                )))
            })?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` (before calling `notifier.disable()`) will send a notification to
        // `Connection::router`. This notification is then used to mark a `stream_id` associated
        // with this request as orphaned and free associated resources.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        task_response
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, QueryError>>,
    request_id: RequestId,
}

// Used to notify `Connection::orphaner` about `Connection::send_request`
// future being dropped before receiving response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// A parsed response together with the extensions carried next to its body.
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        match self.response {
            Response::Error(err) => Err(err.into()),
            Response::Result(result) => Ok(QueryResult::from_result(
                result,
                self.warnings,
                self.tracing_id,
            )),
            _ => Err(QueryError::ProtocolError(
                "Unexpected server response, expected RESULT or ERROR",
            )),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) default_consistency: Consistency,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) cql_version: String,
    pub(crate) max_in_flight: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: std::time::Duration::from_secs(5),
            request_timeout: None,
            default_consistency: Default::default(),
            authenticator: None,
            cql_version: options::DEFAULT_CQL_VERSION.to_owned(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

pub(crate) type ErrorReceiver = tokio::sync::oneshot::Receiver<ConnectionError>;

enum NonErrorStartupResponse {
    Ready,
    Authenticate(Authenticate),
}

impl Connection {
    /// Opens a TCP connection and starts the router on it, but does not
    /// send any frames yet (no OPTIONS/STARTUP handshake).
    ///
    /// Returns the connection together with a receiver that resolves with
    /// the error that eventually breaks it.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(connect_address))
                .await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let max_in_flight = config.max_in_flight.clamp(1, MAX_STREAM_IDS);

        let (sender, receiver) = mpsc::channel(max_in_flight);
        let (error_sender, error_receiver) = tokio::sync::oneshot::channel();
        // Unbounded because it allows for synchronous pushes
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let shutdown = Arc::new(Notify::new());

        let (task, _worker_handle) = Self::router(
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            state.clone(),
            shutdown.clone(),
            connect_address,
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            router_handle,
            state,
            in_flight: Semaphore::new(max_in_flight),
            max_in_flight,
            shutdown,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before the first probe, which socket2
        // calls "time"; its "interval" is the gap between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    fn setup_error(request: &'static str, error: QueryError) -> ConnectionError {
        match error {
            QueryError::BrokenConnection(e) => ConnectionError::BrokenConnection(e),
            QueryError::IoError(e) => ConnectionError::IoError(e),
            other => ConnectionError::SetupRequestError {
                request,
                error: Box::new(other),
            },
        }
    }

    async fn get_options(&self) -> Result<response::Supported, ConnectionError> {
        let response = self
            .send_request(&request::Options, None, false, Some(self.config.connect_timeout))
            .await
            .map_err(|e| Self::setup_error("OPTIONS", e))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(err) => Err(Self::setup_error("OPTIONS", err.into())),
            other => {
                warn!(
                    "[{}] Unexpected {} response to OPTIONS",
                    self.connect_address,
                    other.to_response_kind()
                );
                Err(Self::setup_error(
                    "OPTIONS",
                    QueryError::ProtocolError("Unexpected response to OPTIONS, expected SUPPORTED"),
                ))
            }
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionError> {
        let response = self
            .send_request(
                &request::Startup { options },
                None,
                false,
                Some(self.config.connect_timeout),
            )
            .await
            .map_err(|e| Self::setup_error("STARTUP", e))?;

        match response.response {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            Response::Error(err) => Err(Self::setup_error("STARTUP", err.into())),
            _ => Err(Self::setup_error(
                "STARTUP",
                QueryError::ProtocolError(
                    "Unexpected response to STARTUP, expected READY or AUTHENTICATE",
                ),
            )),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionError> {
        let authenticator = &authenticate.authenticator_name;
        let provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| ConnectionError::MissingAuthentication(authenticator.clone()))?;

        let (mut response, mut auth_session) = provider
            .start_authentication_session(authenticator)
            .await
            .map_err(ConnectionError::AuthenticationFailed)?;

        loop {
            let reply = self
                .send_request(
                    &request::AuthResponse { response },
                    None,
                    false,
                    Some(self.config.connect_timeout),
                )
                .await
                .map_err(|e| Self::setup_error("AUTH_RESPONSE", e))?;

            match reply.response {
                Response::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                }
                Response::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                    return Ok(());
                }
                Response::Error(err) => {
                    return Err(Self::setup_error("AUTH_RESPONSE", err.into()));
                }
                _ => {
                    return Err(Self::setup_error(
                        "AUTH_RESPONSE",
                        QueryError::ProtocolError(
                            "Unexpected response to AUTH_RESPONSE, expected AUTH_CHALLENGE or AUTH_SUCCESS",
                        ),
                    ));
                }
            }
        }
    }

    /// Sends a QUERY with already serialized values.
    pub(crate) async fn query_with_options(
        &self,
        contents: &str,
        values: &SerializedValues,
        execution_options: &ExecutionOptions,
    ) -> Result<QueryResult, QueryError> {
        let query = Query {
            contents: Cow::Borrowed(contents),
            parameters: QueryParameters {
                consistency: execution_options
                    .determine_consistency(self.config.default_consistency),
                serial_consistency: execution_options.serial_consistency,
                timestamp: execution_options.timestamp,
                page_size: None,
                paging_state: None,
                values: Cow::Borrowed(values),
            },
        };

        self.send_request(
            &query,
            execution_options.determine_compression(self.config.compression),
            execution_options.tracing,
            execution_options.determine_request_timeout(self.config.request_timeout),
        )
        .await?
        .into_query_result()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Trying to pass keyspace_name as bound value doesn't work
        // We have to send "USE " + keyspace_name
        let query = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };

        let response = self
            .send_request(
                &Query::new(query),
                self.config.compression,
                false,
                self.config.request_timeout,
            )
            .await?;
        Self::verify_use_keyspace_result(keyspace_name, response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    let expected_keyspace_name_lowercase = keyspace_name.as_str().to_lowercase();
                    let result_keyspace_name_lowercase = set_keyspace.keyspace_name.to_lowercase();

                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase,
                        result_keyspace_name_lowercase,
                    });
                }

                Ok(())
            }
            Response::Error(err) => Err(UseKeyspaceError::RequestError(err.into())),
            _ => Err(UseKeyspaceError::RequestError(QueryError::ProtocolError(
                "Unexpected response to USE, expected RESULT SetKeyspace",
            ))),
        }
    }

    async fn acquire_in_flight_permit(&self) -> Result<SemaphorePermit<'_>, QueryError> {
        let closed = || QueryError::BrokenConnection(BrokenConnectionErrorKind::Closed.into());
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Ready => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(closed()),
            ConnectionState::Disconnected => {
                return Err(QueryError::BrokenConnection(
                    BrokenConnectionErrorKind::ChannelError.into(),
                ))
            }
        }
        self.in_flight.acquire().await.map_err(|_| closed())
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, QueryError> {
        let _permit = self.acquire_in_flight_permit().await?;

        let send = self.router_handle.send_request(request, compression, tracing);
        let task_response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| QueryError::RequestTimeout(timeout))??,
            None => send.await?,
        };

        Self::parse_response(task_response, self.config.compression)
    }

    // Decompression happens here, on the caller's side, so that a broken
    // payload fails only the request it belongs to.
    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, QueryError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Requests currently holding an in-flight permit.
    pub(crate) fn in_flight_count(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Stops accepting requests, waits up to `drain_timeout` for the
    /// outstanding ones, then shuts the socket down.
    ///
    /// Calling it again, or on a connection that is already closing, does nothing.
    pub(crate) async fn close(&self, drain_timeout: Duration) {
        if !self.state.transition(
            ConnectionState::Closing,
            &[ConnectionState::Closing, ConnectionState::Closed],
        ) {
            return;
        }

        // `max_in_flight` never exceeds MAX_STREAM_IDS, which fits in u32.
        let all_permits = self.max_in_flight as u32;
        match tokio::time::timeout(drain_timeout, self.in_flight.acquire_many(all_permits)).await
        {
            Ok(_) => trace!("[{}] All in-flight requests drained", self.connect_address),
            Err(_) => debug!(
                "[{}] {} requests still in flight after {:?}, closing anyway",
                self.connect_address,
                self.in_flight_count(),
                drain_timeout,
            ),
        }

        self.in_flight.close();
        self.shutdown.notify_one();
        self.state.set(ConnectionState::Closed);
    }

    async fn router(
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: tokio::sync::oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        state: Arc<StateCell>,
        shutdown: Arc<Notify>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // The handler map is shared by the reader, writer and orphaner futures,
        // which all run on this one task and never hold the lock across an
        // .await, so the mutex is never contended.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            node_address,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = tokio::select! {
            result = futures::future::try_join3(r, w, o) => result.map(|_| ()),
            _ = shutdown.notified() => Err(BrokenConnectionErrorKind::Closed.into()),
        };

        let error: BrokenConnectionError = match result {
            Ok(()) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        if state.transition(
            ConnectionState::Disconnected,
            &[ConnectionState::Closing, ConnectionState::Closed],
        ) {
            debug!("[{}] Connection broken: {}", node_address, error);
        }

        // Respond to all pending requests with the error
        let response_handlers: HashMap<i16, ResponseHandler> =
            lock_handlers(&handler_map).take_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler
                .response_sender
                .send(Err(QueryError::BrokenConnection(error.clone())));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved and unused.
                    continue;
                }
                Ordering::Equal => {
                    // Events are only sent to connections that REGISTERed for them.
                    trace!(
                        "[{}] Ignoring unsolicited {:?} frame on the event stream",
                        node_address,
                        response.opcode
                    );
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = lock_handlers(handler_map).lookup(params.stream);

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                Missing => {
                    // Unsolicited frame. This should not happen and indicates
                    // a bug either in the driver, or in the database
                    debug!(
                        "[{}] Received response with unexpected StreamId {}",
                        node_address, params.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
                Orphaned => {
                    // Do nothing, handler was freed because this stream_id has
                    // been marked as orphaned
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        match lock_handlers(handler_map).allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(QueryError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half
        // of the channel will be dropped, this task will return
        // and the whole worker will be stopped
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
                // Coalesce whatever is already queued into a single flush.
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // This task receives notifications from `OrphanhoodNotifier`s and tries to
    // mark streams as orphaned. It also checks count of old orphans periodically.
    // After an old orphan threshold is reached, `orphaner` returns an error
    // causing the connection to break.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = lock_handlers(handler_map).old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(old_orphan_count as u16).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    lock_handlers(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }
}

fn lock_handlers(
    handler_map: &StdMutex<ResponseHandlerMap>,
) -> MutexGuard<'_, ResponseHandlerMap> {
    handler_map
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens a connection and performs the OPTIONS/STARTUP (and, if required,
/// authentication) handshake on it.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    /* Setup connection on TCP level and prepare for sending/receiving CQL frames. */
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    /* Perform OPTIONS/SUPPORTED/STARTUP handshake. */
    let mut supported = connection.get_options().await?;

    let supported_compression = supported
        .options
        .remove(options::COMPRESSION)
        .unwrap_or_default();

    /* Prepare options that the driver opts-in in STARTUP frame. */
    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(options::CQL_VERSION),
        Cow::Owned(config.cql_version.clone()),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_NAME),
        Cow::Borrowed(options::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_VERSION),
        Cow::Borrowed(options::DEFAULT_DRIVER_VERSION),
    );

    // Optional compression.
    if let Some(compression) = &config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            // Compression is reported to be supported by the server,
            // request it from the server
            options.insert(
                Cow::Borrowed(options::COMPRESSION),
                Cow::Borrowed(compression_str),
            );
        } else {
            // Fall back to no compression
            warn!(
                "[{}] Requested compression <{}> is not supported by the server. Falling back to no compression",
                addr,
                compression_str
            );
            connection.config.compression = None;
        }
    }

    /* Send the STARTUP frame with all the requested options. */
    let startup_result = connection.startup(options).await?;
    match startup_result {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    connection.state.set(ConnectionState::Ready);
    trace!("[{}] Connection ready", addr);

    Ok((connection, error_receiver))
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    // Linear in the number of old orphans only.
    fn orphans_older_than(&self, age: std::time::Duration) -> usize {
        let minimal_age = Instant::now() - age;
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                let prev_handler = self.handlers.insert(stream_id, response_handler);
                debug_assert!(prev_handler.is_none());

                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Orphan stream_id (associated with this request_id) by moving it to
    // `orphanage_tracker`, and freeing its handler
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        self.stream_set.free(stream_id);

        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            // The stream id was orphaned: its late response arrived and
            // the id is free again.
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // A mapping `request_id` -> `stream_id` must be removed, to
            // prevent marking this `stream_id` as orphaned by some late
            // orphan notification.
            self.request_to_stream.remove(&handler.request_id);

            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Used after connection breaks, when every waiting request has to be
    // answered with an error.
    fn take_handlers(&mut self) -> HashMap<i16, ResponseHandler> {
        self.request_to_stream.clear();
        std::mem::take(&mut self.handlers)
    }
}

struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = MAX_STREAM_IDS / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        if stream_id < 0 {
            return;
        }
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names have up to 48 alphanumeric characters or underscores.
    // An underscore is accepted as the first character too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len: usize = keyspace_name.chars().count(); // Only ascii allowed so it's equal to .len()
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
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

use super::connection::{
    open_connection, Connection, ConnectionConfig, ConnectionState, ErrorReceiver,
    VerifiedKeyspaceName,
};

use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, QueryError, UseKeyspaceError,
};

use arc_swap::ArcSwap;
use futures::{future::RemoteHandle, stream::FuturesUnordered, Future, FutureExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, trace, warn};

/// How the pool picks a connection for the next request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancing {
    /// Cycle through all ready connections of all nodes.
    #[default]
    RoundRobin,
    /// Pick the connection with the fewest outstanding requests;
    /// ties are broken randomly.
    LeastBusy,
}

/// Backoff applied when (re)opening connections fails.
///
/// Each refill round that sees a failed connection attempt multiplies the
/// delay before the next round, up to `max_delay`. After `max_attempts`
/// consecutive failed rounds the pool stops reconnecting to that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff that never gives up.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size: NonZeroUsize,
    pub(crate) reconnect_policy: ReconnectPolicy,
    pub(crate) load_balancing: LoadBalancing,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            pool_size: NonZeroUsize::MIN,
            reconnect_policy: Default::default(),
            load_balancing: Default::default(),
        }
    }
}

enum MaybePoolConnections {
    // The pool is being filled for the first time
    Initializing,

    // The pool is empty because either initial filling failed or all connections
    // became broken; will be asynchronously refilled (unless the reconnect
    // policy gave up). Contains an error from the last connection attempt.
    Broken(ConnectionError),

    // The pool has some connections which are usable (or will be removed soon)
    Ready(Vec<Arc<Connection>>),

    // The pool was closed and will never hand out connections again
    Closed,
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => write!(
                f,
                "[{}]",
                conns
                    .iter()
                    .map(|conn| conn.get_connect_address().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            MaybePoolConnections::Closed => write!(f, "Closed"),
        }
    }
}

/// Connections to a single node, kept at `pool_size` by a background
/// `PoolRefiller`.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    request_sender: mpsc::Sender<RefillerRequest>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    address: SocketAddr,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        pool_config: &PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let (request_sender, request_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());

        let refiller = PoolRefiller::new(
            address,
            pool_config.clone(),
            current_keyspace,
            pool_updated_notify.clone(),
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller.run(request_receiver).remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            request_sender,
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            address,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn is_connected(&self) -> bool {
        let maybe_conns = self.conns.load();
        match maybe_conns.as_ref() {
            MaybePoolConnections::Initializing
            | MaybePoolConnections::Broken(_)
            | MaybePoolConnections::Closed => false,
            // Here we use the assumption that the Ready vector is always non-empty.
            MaybePoolConnections::Ready(_) => true,
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();
        let closed = || {
            UseKeyspaceError::RequestError(QueryError::ConnectionPoolError(
                ConnectionPoolError::Closed,
            ))
        };

        self.request_sender
            .send(RefillerRequest::UseKeyspace {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| closed())?;

        response_receiver.await.map_err(|_| closed())?
    }

    // Waits until the pool becomes initialized.
    // The pool is considered initialized either if the first connection has been
    // established or after first filling ends, whichever comes first.
    pub(crate) async fn wait_until_initialized(&self) {
        // First, register for the notification
        // so that we don't miss it
        let notified = self.pool_updated_notify.notified();

        if let MaybePoolConnections::Initializing = **self.conns.load() {
            // If the pool is not initialized yet, wait until we get a notification
            notified.await;
        }
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        let conns = self.conns.load_full();
        match &*conns {
            MaybePoolConnections::Ready(conns) => Ok(conns.clone()),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Closed => Err(ConnectionPoolError::Closed),
        }
    }

    /// Stops the refiller and drains every connection of this node.
    pub(crate) async fn close(&self, drain_timeout: Duration) {
        let (response_sender, response_receiver) = oneshot::channel();
        if self
            .request_sender
            .send(RefillerRequest::Close { response_sender })
            .await
            .is_err()
        {
            trace!("[{}] Pool already closed", self.address);
            return;
        }

        let Ok(conns) = response_receiver.await else {
            return;
        };

        debug!(
            "[{}] Closing {} pooled connections",
            self.address,
            conns.len()
        );
        futures::future::join_all(conns.iter().map(|conn| conn.close(drain_timeout))).await;
    }
}

// A simple exponential strategy for pool fill backoffs.
struct RefillDelayStrategy {
    policy: ReconnectPolicy,
    current_delay: Duration,
    consecutive_failures: u32,
}

impl RefillDelayStrategy {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_delay: policy.min_delay,
            consecutive_failures: 0,
            policy,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = self.policy.min_delay;
        self.consecutive_failures = 0;
    }

    fn on_fill_error(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = std::cmp::min(
            self.policy.max_delay,
            self.current_delay.saturating_mul(self.policy.multiplier),
        );
    }

    fn is_exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.consecutive_failures >= max)
    }
}

enum RefillerRequest {
    UseKeyspace {
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    },
    // Answered with the connections that were open, which the caller drains.
    Close {
        response_sender: oneshot::Sender<Vec<Arc<Connection>>>,
    },
}

struct PoolRefiller {
    pool_config: PoolConfig,
    address: SocketAddr,

    // `shared_conns` is updated only after `conns` change
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Arc<Connection>>,

    // Set to true if there was an error since the last refill,
    // set to false when refilling starts.
    had_error_since_last_refill: bool,

    refill_delay_strategy: RefillDelayStrategy,

    // Set once the reconnect policy ran out of attempts. Cleared when a
    // connection is lost again, which starts a new series of attempts.
    gave_up: bool,

    // Receives information about connections becoming ready, i.e. newly connected
    // or after its keyspace was correctly set.
    ready_connections:
        FuturesUnordered<Pin<Box<dyn Future<Output = OpenedConnectionEvent> + Send + 'static>>>,

    // Receives information about breaking connections
    connection_errors:
        FuturesUnordered<Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send + 'static>>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    // Signaled when the connection pool is updated
    pool_updated_notify: Arc<Notify>,
}

impl PoolRefiller {
    fn new(
        address: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
    ) -> Self {
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(MaybePoolConnections::Initializing)));
        let refill_delay_strategy =
            RefillDelayStrategy::new(pool_config.reconnect_policy.clone());

        Self {
            pool_config,
            address,

            shared_conns,
            conns: Vec::new(),

            had_error_since_last_refill: false,
            refill_delay_strategy,
            gave_up: false,

            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),

            current_keyspace,

            pool_updated_notify,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    // The main loop of the pool refiller
    async fn run(mut self, mut request_receiver: mpsc::Receiver<RefillerRequest>) {
        debug!("[{}] Started asynchronous pool worker", self.address);

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!("[{}] Got error for connection {:p}: {:?}", self.address, Arc::as_ptr(&conn), evt.error);
                        self.remove_connection(conn, evt.error);
                    }
                }

                req = request_receiver.recv() => {
                    match req {
                        Some(RefillerRequest::UseKeyspace { keyspace_name, response_sender }) => {
                            debug!("[{}] Requested keyspace change: {}", self.address, keyspace_name.as_str());
                            self.use_keyspace(keyspace_name, response_sender);
                        }
                        Some(RefillerRequest::Close { response_sender }) => {
                            debug!("[{}] Pool close requested, stopping asynchronous pool worker", self.address);
                            self.shared_conns.store(Arc::new(MaybePoolConnections::Closed));
                            self.pool_updated_notify.notify_waiters();
                            // Connections still being opened are dropped here.
                            let _ = response_sender.send(std::mem::take(&mut self.conns));
                            return;
                        }
                        None => {
                            // The request channel is dropped.
                            // This means that the corresponding pool is dropped.
                            // We can stop here.
                            trace!("[{}] Request channel dropped, stopping asynchronous pool worker", self.address);
                            return;
                        }
                    }
                }
            }
            trace!("[{}] Pool has {} connections", self.address, self.conns.len());

            // Schedule refilling here
            if !refill_scheduled && !self.gave_up && self.need_filling() {
                if self.had_error_since_last_refill {
                    self.refill_delay_strategy.on_fill_error();
                } else {
                    self.refill_delay_strategy.on_successful_fill();
                }

                if self.refill_delay_strategy.is_exhausted() {
                    error!(
                        "[{}] Giving up reconnecting after {} failed attempts, {} of {} connections open",
                        self.address,
                        self.refill_delay_strategy.consecutive_failures,
                        self.conns.len(),
                        self.pool_config.pool_size,
                    );
                    self.gave_up = true;
                    continue;
                }

                let delay = self.refill_delay_strategy.get_delay();
                debug!(
                    "[{}] Scheduling next refill in {} ms",
                    self.address,
                    delay.as_millis(),
                );

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn is_full(&self) -> bool {
        self.conns.len() >= self.pool_config.pool_size.get()
    }

    fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn need_filling(&self) -> bool {
        !self.is_filling() && !self.is_full()
    }

    // Begins opening a number of connections in order to fill the connection pool.
    // Futures which open the connections are pushed to the `ready_connections`
    // FuturesUnordered structure, and their results are processed in the main loop.
    fn start_filling(&mut self) {
        if self.is_empty() {
            // If the pool is empty, it might mean that the node is not alive.
            // It is more likely than not that the next connection attempt will
            // fail, so there is no use in opening more than one connection now.
            trace!("[{}] Will open the first connection to the node", self.address);
            self.start_opening_connection();
            return;
        }

        let to_open_count = self
            .pool_config
            .pool_size
            .get()
            .saturating_sub(self.conns.len());
        trace!("[{}] Will open {} connections", self.address, to_open_count);
        for _ in 0..to_open_count {
            self.start_opening_connection();
        }
    }

    // Handles a newly opened connection and decides what to do with it.
    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                // Set the `had_error_since_last_refill` flag so that
                // the next refill will be delayed more than this one.
                self.had_error_since_last_refill = true;
                debug!("[{}] Failed to open connection: {:?}", self.address, err);

                // If all connection attempts in this fill attempt failed
                // and the pool is empty, report this error.
                if !self.is_filling() && self.is_empty() {
                    self.update_shared_conns(Some(err));
                }
            }
            Ok((connection, error_receiver)) => {
                // Before the connection can be put to the pool, we need
                // to make sure that it uses appropriate keyspace
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        // Asynchronously start setting keyspace for this
                        // connection. It will be received on the ready
                        // connections channel and will travel through
                        // this logic again, to be finally put into
                        // the conns.
                        self.start_setting_keyspace_for_connection(
                            connection,
                            error_receiver,
                            keyspace.clone(),
                        );
                        return;
                    }
                }

                if self.is_full() {
                    // The pool was filled while this one was in flight.
                    trace!(
                        "[{}] Dropping excess connection, pool already has {} connections",
                        self.address,
                        self.conns.len()
                    );
                    return;
                }

                let conn = Arc::new(connection);
                trace!(
                    "[{}] Adding connection {:p} to the pool, now there are {}",
                    self.address,
                    Arc::as_ptr(&conn),
                    self.conns.len() + 1,
                );

                self.connection_errors
                    .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                self.conns.push(conn);

                self.update_shared_conns(None);
            }
        }
    }

    // Starts opening a new connection in the background. The result of connecting
    // will be available on `ready_connections`.
    fn start_opening_connection(&self) {
        let cfg = self.pool_config.connection_config.clone();
        let address = self.address;

        let fut = async move {
            let result = open_connection(address, &cfg).await;
            OpenedConnectionEvent {
                result,
                keyspace_name: None,
            }
        }
        .boxed();
        self.ready_connections.push(fut);
    }

    // Updates `shared_conns` based on `conns`.
    // `last_error` must not be `None` if there is a possibility of the pool
    // being empty.
    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.is_empty() {
            let last_error = last_error.unwrap_or_else(|| {
                ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
            });
            Arc::new(MaybePoolConnections::Broken(last_error))
        } else {
            Arc::new(MaybePoolConnections::Ready(self.conns.clone()))
        };

        // Make the connection list available
        self.shared_conns.store(new_conns);

        // Notify potential waiters
        self.pool_updated_notify.notify_waiters();
    }

    // Removes given connection from the pool.
    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        let maybe_idx = self
            .conns
            .iter()
            .position(|other_conn| Arc::ptr_eq(&connection, other_conn));

        match maybe_idx {
            Some(idx) => {
                self.conns.swap_remove(idx);
                trace!(
                    "[{}] Connection {:p} removed from the pool, {} left",
                    self.address,
                    ptr,
                    self.conns.len(),
                );
                // A fresh outage gets the full number of reconnect attempts.
                self.gave_up = false;
                self.update_shared_conns(Some(last_error));
            }
            None => {
                trace!("[{}] Connection {:p} was already removed", self.address, ptr);
            }
        }
    }

    // Sets current keyspace for available connections.
    // Connections which are being currently opened and future connections
    // will have this keyspace set when they appear on `ready_connections`.
    // Sends response to the `response_sender` when all current connections
    // have their keyspace set.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns = self.conns.clone();
        let address = self.address;
        let connect_timeout = self.pool_config.connection_config.connect_timeout;

        let fut = async move {
            let use_keyspace_futures: Vec<_> = conns
                .iter()
                .map(|conn| conn.use_keyspace(&keyspace_name))
                .collect();

            if use_keyspace_futures.is_empty() {
                return Ok(());
            }

            let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> = tokio::time::timeout(
                connect_timeout,
                futures::future::join_all(use_keyspace_futures),
            )
            .await
            .map_err(|_| UseKeyspaceError::RequestTimeout(connect_timeout))?;

            use_keyspace_result(use_keyspace_results.into_iter())
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!("[{}] Successfully changed current keyspace", address),
                Err(err) => warn!("[{}] Failed to change keyspace: {:?}", address, err),
            }
            let _ = response_sender.send(res);
        });
    }

    // Requires that the event is for a successful connection
    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
        keyspace_name: VerifiedKeyspaceName,
    ) {
        self.ready_connections.push(
            async move {
                let result = connection.use_keyspace(&keyspace_name).await;
                if let Err(err) = result {
                    warn!(
                        "[{}] Failed to set keyspace for new connection: {}",
                        connection.get_connect_address().ip(),
                        err,
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }
}

// If there was at least one Ok and the rest were broken connection errors we can return Ok:
// the keyspace name is correct and will be used on the broken connection after reconnecting.
// If there were only broken connection errors, return one of them.
// Any other error means something is wrong and is returned right away.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut was_ok: bool = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) if is_connection_failure(&err) => broken_conn_error = Some(err),
            Err(err) => return Err(err),
        }
    }

    match (was_ok, broken_conn_error) {
        (false, Some(err)) => Err(err),
        _ => Ok(()),
    }
}

fn is_connection_failure(err: &UseKeyspaceError) -> bool {
    matches!(err, UseKeyspaceError::RequestError(query_error) if query_error.is_connection_error())
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}

/// All node pools of a session plus the connection selection policy.
pub(crate) struct ConnectionPool {
    nodes: Vec<NodeConnectionPool>,
    load_balancing: LoadBalancing,
    round_robin_counter: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Starts a pool per node and waits until each has finished its first fill.
    pub(crate) async fn new(addresses: &[SocketAddr], pool_config: &PoolConfig) -> Self {
        let nodes: Vec<NodeConnectionPool> = addresses
            .iter()
            .map(|address| NodeConnectionPool::new(*address, pool_config, None))
            .collect();

        futures::future::join_all(nodes.iter().map(NodeConnectionPool::wait_until_initialized))
            .await;

        Self {
            nodes,
            load_balancing: pool_config.load_balancing,
            round_robin_counter: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.nodes.iter().any(NodeConnectionPool::is_connected)
    }

    /// The error explaining why no node has a usable connection, if that is the case.
    pub(crate) fn last_connection_error(&self) -> Option<ConnectionError> {
        self.nodes
            .iter()
            .find_map(|node| match node.get_working_connections() {
                Err(ConnectionPoolError::Broken {
                    last_connection_error,
                }) => Some(last_connection_error),
                _ => None,
            })
    }

    /// Picks a ready connection according to the load balancing policy.
    pub(crate) fn connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        if self.is_closed() {
            return Err(ConnectionPoolError::Closed);
        }

        let mut last_error = None;
        let mut candidates: Vec<Arc<Connection>> = Vec::new();
        for node in &self.nodes {
            match node.get_working_connections() {
                Ok(conns) => candidates.extend(conns.into_iter().filter(|c| c.is_ready())),
                Err(err) => last_error = Some(err),
            }
        }

        let idx = match self.load_balancing {
            LoadBalancing::RoundRobin => {
                round_robin_index(&self.round_robin_counter, candidates.len())
            }
            LoadBalancing::LeastBusy => {
                least_busy_index(candidates.iter().map(|conn| conn.in_flight_count()))
            }
        };

        match idx {
            Some(idx) => {
                let conn = candidates.swap_remove(idx);
                trace!(
                    connection = %conn.get_connect_address(),
                    in_flight = conn.in_flight_count(),
                    "Selected connection"
                );
                Ok(conn)
            }
            None => Err(last_error.unwrap_or(ConnectionPoolError::Broken {
                last_connection_error: ConnectionError::BrokenConnection(
                    BrokenConnectionErrorKind::ChannelError.into(),
                ),
            })),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let results = futures::future::join_all(
            self.nodes
                .iter()
                .map(|node| node.use_keyspace(keyspace_name.clone())),
        )
        .await;

        use_keyspace_result(results.into_iter())
    }

    pub(crate) fn connection_states(&self) -> Vec<(SocketAddr, ConnectionState)> {
        self.nodes
            .iter()
            .flat_map(|node| node.get_working_connections().unwrap_or_default())
            .map(|conn| (conn.get_connect_address(), conn.state()))
            .collect()
    }

    /// Closes every node pool. Only the first call does any work.
    pub(crate) async fn close(&self, drain_timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        futures::future::join_all(self.nodes.iter().map(|node| {
            debug!("[{}] Closing node pool", node.address());
            node.close(drain_timeout)
        }))
        .await;
    }
}

fn round_robin_index(counter: &AtomicUsize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(counter.fetch_add(1, Ordering::Relaxed) % len)
}

// Index of the smallest load; a random one among equals.
fn least_busy_index(loads: impl Iterator<Item = usize>) -> Option<usize> {
    let mut min_load = usize::MAX;
    let mut least_busy: Vec<usize> = Vec::new();
    for (idx, load) in loads.enumerate() {
        if load < min_load {
            min_load = load;
            least_busy.clear();
        }
        if load == min_load {
            least_busy.push(idx);
        }
    }

    match least_busy.len() {
        0 => None,
        1 => Some(least_busy[0]),
        n => Some(least_busy[rand::rng().random_range(0..n)]),
    }
}

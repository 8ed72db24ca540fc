//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL statements.

use std::borrow::Borrow;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use helenus_cql::frame::value::{SerializedValues, ValueList};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::execution_options::ExecutionOptions;
use super::Compression;
use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, NewSessionError, QueryError,
    UseKeyspaceError,
};
use crate::network::{
    ConnectionConfig, ConnectionPool, ConnectionState, LoadBalancing, PoolConfig,
    ReconnectPolicy, VerifiedKeyspaceName, DEFAULT_MAX_IN_FLIGHT,
};
use crate::response::QueryResult;
use crate::statement::bind_markers;
use crate::statement::Consistency;

/// Port used when a known node is given without one.
pub const DEFAULT_PORT: u16 = 9042;

/// Describes a database server known on `Session` startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, with or without a port.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup.
    /// Each node can be represented as a hostname or an IP address.
    pub known_nodes: Vec<KnownNode>,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,

    /// Whether the keyspace name is case-sensitive.
    /// This is used to determine how the keyspace name is sent to the server:
    /// - if case-insensitive, it is sent as-is,
    /// - if case-sensitive, it is enclosed in double quotes.
    pub keyspace_case_sensitive: bool,

    /// Custom authenticator provider to create an authenticator instance
    /// upon session creation.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// CQL version announced in STARTUP.
    pub cql_version: String,

    /// Timeout for establishing connections to a node, including the
    /// STARTUP handshake.
    pub connect_timeout: Duration,

    /// Time a request may wait for its response. `None` waits forever.
    /// Can be overridden per call with [`ExecutionOptions::request_timeout`].
    pub request_timeout: Option<Duration>,

    /// Number of connections kept open to every node.
    pub pool_size: NonZeroUsize,

    /// Backoff and retry bound for reopening lost connections.
    pub reconnect_policy: ReconnectPolicy,

    /// How a connection is chosen for each request.
    pub load_balancing: LoadBalancing,

    /// Consistency used by queries that do not set one.
    pub default_consistency: Consistency,

    /// Upper bound on outstanding requests per connection.
    /// Callers wait for a free slot once it is reached.
    pub max_in_flight: usize,

    /// How long [`Session::close`] waits for in-flight requests.
    pub drain_timeout: Duration,

    /// Timeout of resolving a single hostname from `known_nodes`.
    pub hostname_resolution_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Pool size: 1 connection per node
    /// * Load balancing: round-robin
    /// * Consistency: `LOCAL_ONE`
    ///
    /// # Example
    /// ```
    /// # use helenus::client::session::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            cql_version: helenus_cql::frame::request::options::DEFAULT_CQL_VERSION.to_owned(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
            pool_size: NonZeroUsize::MIN,
            reconnect_policy: ReconnectPolicy::default(),
            load_balancing: LoadBalancing::default(),
            default_consistency: Consistency::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: Duration::from_secs(5),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    /// # Example
    /// ```
    /// # use helenus::client::session::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1");
    /// config.add_known_node("db1.example.com:9042");
    /// ```
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of known database server with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    /// Adds a list of known database servers with IP addresses
    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            default_consistency: self.default_consistency,
            authenticator: self.authenticator.clone(),
            cql_version: self.cql_version.clone(),
            max_in_flight: self.max_in_flight,
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connection_config: self.connection_config(),
            pool_size: self.pool_size,
            reconnect_policy: self.reconnect_policy.clone(),
            load_balancing: self.load_balancing,
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `Session` manages connections to the cluster and allows to execute CQL statements.
///
/// It is cheap to share: wrap it in an [`Arc`] to use it from many tasks,
/// which is also what [`Session::query_detached`] needs.
pub struct Session {
    pool: ConnectionPool,
    keyspace_name: ArcSwapOption<String>,
    drain_timeout: Duration,
    // Runtime the session was connected on; detached queries run there.
    runtime: Handle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connections", &self.pool.connection_states())
            .field("keyspace_name", &self.keyspace_name)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl Session {
    /// Estabilishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](crate::client::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly
    /// # Arguments
    /// * `config` - Connection configuration - known nodes, Compression, etc.
    ///   Must contain at least one known node.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::error::Error;
    /// # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
    /// use helenus::client::session::{Session, SessionConfig};
    ///
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1:9042");
    ///
    /// let session: Session = Session::connect(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: SessionConfig) -> Result<Self, NewSessionError> {
        // Ensure there is at least one known node
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        // Fail before opening anything if the keyspace name is bad.
        let keyspace = config
            .used_keyspace
            .clone()
            .map(|name| VerifiedKeyspaceName::new(name, config.keyspace_case_sensitive))
            .transpose()?;

        let (addresses, unresolved) =
            resolve_known_nodes(&config.known_nodes, config.hostname_resolution_timeout).await;
        if addresses.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(unresolved));
        }

        let pool = ConnectionPool::new(&addresses, &config.pool_config()).await;
        if !pool.is_connected() {
            let last_error = pool.last_connection_error().unwrap_or_else(|| {
                ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
            });
            return Err(NewSessionError::NoConnections(last_error));
        }

        let session = Session {
            pool,
            keyspace_name: ArcSwapOption::default(),
            drain_timeout: config.drain_timeout,
            runtime: Handle::current(),
        };

        if let Some(keyspace) = keyspace {
            session.use_verified_keyspace(keyspace).await?;
        }

        debug!(nodes = addresses.len(), "Session connected");
        Ok(session)
    }

    /// Executes a CQL statement with positional `?` values and the session's defaults.
    ///
    /// Values are always sent as typed values next to the statement text,
    /// never spliced into it.
    ///
    /// # Example
    /// ```rust
    /// # use helenus::client::session::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// session
    ///     .query("INSERT INTO cql_test (id, foo) VALUES (?, ?)", ("foobar", 7_i32))
    ///     .await?;
    ///
    /// let rows = session
    ///     .query("SELECT id, foo FROM cql_test WHERE id = ?", ("foobar",))
    ///     .await?
    ///     .rows()?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query(
        &self,
        cql: impl AsRef<str>,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        self.query_with_options(cql, values, &ExecutionOptions::default())
            .await
    }

    /// Like [`Session::query`], with per-call compression, consistency and timeout.
    ///
    /// A statement that produces no rows (DDL, `INSERT`, `USE`) yields a
    /// [`QueryResult`] whose `rows` is `None`; a `SELECT` always yields
    /// `Some`, possibly empty.
    pub async fn query_with_options(
        &self,
        cql: impl AsRef<str>,
        values: impl ValueList,
        options: &ExecutionOptions,
    ) -> Result<QueryResult, QueryError> {
        let values = values.serialized()?;
        self.run_query(cql.as_ref(), &values, options).await
    }

    /// Fire-and-forget execution.
    ///
    /// The statement runs on a task spawned on the runtime the session was
    /// connected on, so this may be called from any thread. A failure is
    /// logged at `warn` level and otherwise discarded. Nothing is raised to
    /// the caller. The returned handle can be awaited to know when the
    /// statement finished, or dropped.
    pub fn query_detached(
        self: &Arc<Self>,
        cql: impl Into<String>,
        values: impl ValueList,
        options: ExecutionOptions,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let cql = cql.into();
        let values = values.serialized().map(|values| values.into_owned());

        self.runtime.spawn(async move {
            let result = match values {
                Ok(values) => session.run_query(&cql, &values, &options).await,
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(_) => trace!(statement = cql.as_str(), "Detached query finished"),
                Err(err) => warn!(
                    statement = cql.as_str(),
                    error = %err,
                    kind = err.name(),
                    "Detached query failed"
                ),
            }
        })
    }

    async fn run_query(
        &self,
        cql: &str,
        values: &SerializedValues,
        options: &ExecutionOptions,
    ) -> Result<QueryResult, QueryError> {
        if self.pool.is_closed() {
            return Err(QueryError::SessionClosed);
        }

        let contents = bind_markers::prepare_statement(cql, values.len() as usize)?;

        let connection = self.pool.connection().map_err(|err| match err {
            ConnectionPoolError::Closed => QueryError::SessionClosed,
            err => QueryError::ConnectionPoolError(err),
        })?;

        trace!(
            connection = %connection.get_connect_address(),
            statement = cql,
            "Sending query"
        );

        match connection
            .query_with_options(&contents, values, options)
            .await
        {
            // Lost a race with close().
            Err(QueryError::BrokenConnection(_)) if self.pool.is_closed() => {
                Err(QueryError::SessionClosed)
            }
            result => result,
        }
    }

    /// Sends `USE <keyspace_name>` request on all connections\
    /// This allows to write `SELECT * FROM table` instead of `SELECT * FROM keyspace.table`\
    ///
    /// Note that even failed `use_keyspace` can change currently used keyspace - the request is sent on all connections and
    /// can overwrite previously used keyspace.
    ///
    /// Call only one `use_keyspace` at a time.\
    /// Trying to do two `use_keyspace` requests simultaneously with different names
    /// can end with some connections using one keyspace and the rest using the other.
    ///
    /// # Arguments
    ///
    /// * `keyspace_name` - keyspace name to use,
    ///   keyspace names can have up to 48 alphanumeric characters and contain underscores
    /// * `case_sensitive` - if set to true the generated query will put keyspace name in quotes
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        // Trying to pass keyspace as bound value in "USE ?" doesn't work
        // So we have to create a string for query: "USE " + new_keyspace
        // To avoid any possible CQL injections it's good to verify that the name is valid
        let verified_ks_name = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)?;
        self.use_verified_keyspace(verified_ks_name).await
    }

    async fn use_verified_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        if self.pool.is_closed() {
            return Err(UseKeyspaceError::RequestError(QueryError::SessionClosed));
        }

        self.keyspace_name
            .store(Some(Arc::new(keyspace_name.as_str().to_owned())));
        self.pool.use_keyspace(keyspace_name).await
    }

    /// Name of the keyspace set with [`Session::use_keyspace`] or at connect time.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Address and state of every pooled connection.
    pub fn connection_states(&self) -> Vec<(SocketAddr, ConnectionState)> {
        self.pool.connection_states()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Stops reconnecting, waits up to the configured drain timeout for
    /// outstanding requests and closes every connection.
    ///
    /// Safe to call more than once; later calls return immediately. After
    /// it returns, every query fails with [`QueryError::SessionClosed`].
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        debug!("Closing session");
        self.pool.close(self.drain_timeout).await;
    }
}

/// Resolves every known node; returns the addresses and the hostnames that
/// could not be resolved.
async fn resolve_known_nodes(
    known_nodes: &[KnownNode],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut addresses = Vec::with_capacity(known_nodes.len());
    let mut unresolved = Vec::new();

    for node in known_nodes {
        match node {
            KnownNode::Address(address) => addresses.push(*address),
            KnownNode::Hostname(hostname) => {
                match resolve_hostname(hostname, hostname_resolution_timeout).await {
                    Ok(address) => addresses.push(address),
                    Err(err) => {
                        warn!("Failed to resolve hostname {}: {}", hostname, err);
                        unresolved.push(hostname.clone());
                    }
                }
            }
        }
    }

    addresses.sort_unstable();
    addresses.dedup();
    (addresses, unresolved)
}

async fn lookup_host_with_timeout(
    host: impl tokio::net::ToSocketAddrs,
    timeout: Option<Duration>,
) -> std::io::Result<Vec<SocketAddr>> {
    let lookup = async {
        tokio::net::lookup_host(host)
            .await
            .map(|addrs| addrs.collect::<Vec<_>>())
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("hostname lookup timed out after {:?}", timeout),
                )
            })?,
        None => lookup.await,
    }
}

// Prefers an IPv4 address when the name resolves to several.
async fn resolve_hostname(
    hostname: &str,
    timeout: Option<Duration>,
) -> std::io::Result<SocketAddr> {
    // `lookup_host` wants "hostname:port"; retry with the default port if
    // the plain form fails for any reason other than a timeout.
    let addrs = match lookup_host_with_timeout(hostname, timeout).await {
        Ok(addrs) => addrs,
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(e),
        Err(e) => lookup_host_with_timeout((hostname, DEFAULT_PORT), timeout)
            .await
            .or(Err(e))?,
    };

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or(addrs.last())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", hostname),
            )
        })
}

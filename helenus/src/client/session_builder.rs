//! Builder for [`Session`](super::session::Session).

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use super::session::{Session, SessionConfig};
use super::{Compression, LoadBalancing, ReconnectPolicy};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewSessionError;
use crate::statement::Consistency;

/// Fluent front-end to [`SessionConfig`].
///
/// Every setter consumes and returns the builder; [`SessionBuilder::build`]
/// borrows it, so one builder can open several sessions.
///
/// ```
/// # use std::num::NonZeroUsize;
/// # use std::time::Duration;
/// # use helenus::{Compression, Consistency, LoadBalancing, Session, SessionBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_nodes(["10.0.0.1", "10.0.0.2:19042"])
///     .user("cassandra", "cassandra")
///     .use_keyspace("cql_test", false)
///     .compression(Some(Compression::Lz4))
///     .pool_size(NonZeroUsize::new(4).unwrap())
///     .load_balancing(LoadBalancing::LeastBusy)
///     .default_consistency(Consistency::Quorum)
///     .request_timeout(Some(Duration::from_secs(10)))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// `host` or `host:port`; the port defaults to 9042.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl std::borrow::Borrow<SocketAddr>>,
    ) -> Self {
        self.config.add_known_nodes_addr(node_addrs);
        self
    }

    /// Answers a `PasswordAuthenticator` challenge with these credentials.
    /// Replaces any provider set with [`SessionBuilder::authenticator_provider`].
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Custom SASL exchange; see [`crate::authentication`].
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Requests frame compression in STARTUP. A node that does not list the
    /// algorithm in SUPPORTED gets plain frames and a warning is logged.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        if interval <= Duration::from_secs(1) {
            tracing::warn!(
                "Setting the TCP keepalive interval to low values ({:?}) is not recommended as it can have a negative impact on performance. Consider setting it above 1 second.",
                interval
            );
        }

        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Keyspace every connection switches to before serving requests.
    /// The name is validated when the session is built.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    pub fn cql_version(mut self, version: impl Into<String>) -> Self {
        self.config.cql_version = version.into();
        self
    }

    /// Bounds the TCP connect plus the STARTUP handshake.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// `None` waits for responses forever.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn pool_size(mut self, size: NonZeroUsize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn load_balancing(mut self, load_balancing: LoadBalancing) -> Self {
        self.config.load_balancing = load_balancing;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect_policy = policy;
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Per-connection cap on outstanding requests. Callers past the cap
    /// wait for a slot.
    ///
    /// # Panics
    /// Panics when `max` is zero.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        assert!(max > 0, "max_in_flight must be positive");
        self.config.max_in_flight = max;
        self
    }

    /// How long [`Session::close`] waits for outstanding requests.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn hostname_resolution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.hostname_resolution_timeout = timeout;
        self
    }

    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

/// Creates a [`SessionBuilder`] with default configuration, same as [`SessionBuilder::new`]
impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

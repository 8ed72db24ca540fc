mod mock_cql;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use helenus::{ReconnectPolicy, SessionBuilder};

pub(crate) use mock_node::{MockNode, MockNodeConfig};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn unique_keyspace_name() -> String {
    let cnt = UNIQUE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let name = format!(
        "test_rust_{}_{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs(),
        cnt
    );
    println!("Unique name: {}", name);
    name
}

/// Reconnects quickly so failure tests do not sit in backoff.
pub(crate) fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy {
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        multiplier: 2,
        max_attempts,
    }
}

pub(crate) fn builder_for(node: &MockNode) -> SessionBuilder {
    SessionBuilder::new()
        .known_node_addr(node.addr())
        .reconnect_policy(fast_reconnect(Some(10)))
}

/// Polls `check` until it yields `Some`, panicking after `timeout`.
pub(crate) async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

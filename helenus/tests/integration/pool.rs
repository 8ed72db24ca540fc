use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;
use helenus::{ConnectionState, LoadBalancing, QueryError, Session};

use crate::utils::{builder_for, fast_reconnect, setup_tracing, wait_for, MockNode};

const CREATE_KS: &str = "CREATE KEYSPACE IF NOT EXISTS ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}";

fn all_ready(session: &Session) -> bool {
    let states = session.connection_states();
    !states.is_empty()
        && states
            .iter()
            .all(|(_, state)| *state == ConnectionState::Ready)
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn pool_opens_requested_connections() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .pool_size(NonZeroUsize::new(3).unwrap())
        .build()
        .await
        .unwrap();

    wait_for(Duration::from_secs(5), || async {
        (session.connection_states().len() == 3).then_some(())
    })
    .await;
    assert!(all_ready(&session));
    assert!(session
        .connection_states()
        .iter()
        .all(|(addr, _)| *addr == node.addr()));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn in_flight_request_fails_when_connection_is_lost() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(builder_for(&node).build().await.unwrap());
    node.set_response_delay(Some(Duration::from_millis(500)));

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.query(CREATE_KS, ()).await }
    });
    wait_for(Duration::from_secs(2), || async {
        (!node.received_queries().is_empty()).then_some(())
    })
    .await;

    node.drop_connections();
    let err = in_flight.await.unwrap().unwrap_err();
    assert_matches!(err, QueryError::BrokenConnection(_));
    assert_eq!(err.name(), "ConnectionError");

    // Not retried behind the caller's back.
    assert_eq!(node.received_queries().len(), 1);

    // The pool reconnects on its own.
    node.set_response_delay(None);
    wait_for(Duration::from_secs(5), || async {
        session.query(CREATE_KS, ()).await.ok()
    })
    .await;
    assert!(node.accepted_connections() >= 2);
    assert!(all_ready(&session));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn reconnect_gives_up_after_max_attempts() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .reconnect_policy(fast_reconnect(Some(3)))
        .build()
        .await
        .unwrap();
    session.query(CREATE_KS, ()).await.unwrap();

    node.set_refusing(true);
    let accepted_before = node.accepted_connections();
    node.drop_connections();

    // Backoff rounds of at most 20ms each; leave plenty of room for all of them.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let attempts = node.accepted_connections() - accepted_before;
    assert!((1..=3).contains(&attempts), "{attempts} reconnection attempts");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        node.accepted_connections() - accepted_before,
        attempts,
        "pool kept reconnecting after giving up"
    );

    let err = session.query(CREATE_KS, ()).await.unwrap_err();
    assert!(err.is_connection_error(), "{err:?}");
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn unbounded_reconnect_survives_an_outage() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .reconnect_policy(fast_reconnect(None))
        .build()
        .await
        .unwrap();

    node.set_refusing(true);
    node.drop_connections();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = session.query(CREATE_KS, ()).await.unwrap_err();
    assert!(err.is_connection_error(), "{err:?}");

    node.set_refusing(false);
    wait_for(Duration::from_secs(5), || async {
        session.query(CREATE_KS, ()).await.ok()
    })
    .await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn in_flight_requests_are_capped() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).max_in_flight(2).build().await.unwrap();
    node.set_response_delay(Some(Duration::from_millis(50)));

    let results = join_all((0..10).map(|_| session.query(CREATE_KS, ()))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(node.received_queries().len(), 10);
    assert!(node.max_outstanding() <= 2, "{}", node.max_outstanding());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn request_timeout_is_a_connection_error() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .request_timeout(Some(Duration::from_millis(50)))
        .build()
        .await
        .unwrap();
    node.set_response_delay(Some(Duration::from_millis(500)));

    let err = session.query(CREATE_KS, ()).await.unwrap_err();
    assert_matches!(err, QueryError::RequestTimeout(_));
    assert!(err.is_connection_error());

    // The late response lands on an orphaned stream and is dropped.
    node.set_response_delay(None);
    tokio::time::sleep(Duration::from_millis(600)).await;
    session.query(CREATE_KS, ()).await.unwrap();
    assert!(all_ready(&session));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn least_busy_balancing_spreads_load() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .pool_size(NonZeroUsize::new(2).unwrap())
        .max_in_flight(1)
        .load_balancing(LoadBalancing::LeastBusy)
        .build()
        .await
        .unwrap();
    wait_for(Duration::from_secs(5), || async {
        (session.connection_states().len() == 2).then_some(())
    })
    .await;
    node.set_response_delay(Some(Duration::from_millis(100)));

    let results = join_all((0..2).map(|_| session.query(CREATE_KS, ()))).await;
    assert!(results.iter().all(Result::is_ok));
    // One request per connection, both answered concurrently.
    assert_eq!(node.max_outstanding(), 2);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn round_robin_uses_every_connection() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .pool_size(NonZeroUsize::new(2).unwrap())
        .max_in_flight(1)
        .load_balancing(LoadBalancing::RoundRobin)
        .build()
        .await
        .unwrap();
    wait_for(Duration::from_secs(5), || async {
        (session.connection_states().len() == 2).then_some(())
    })
    .await;
    node.set_response_delay(Some(Duration::from_millis(100)));

    let results = join_all((0..2).map(|_| session.query(CREATE_KS, ()))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(node.max_outstanding(), 2);
}

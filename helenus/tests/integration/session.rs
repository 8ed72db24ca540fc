use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use helenus::errors::{NewSessionError, UseKeyspaceError};
use helenus::{Consistency, ExecutionOptions, QueryError, SessionBuilder};
use tokio::net::TcpListener;

use crate::utils::{builder_for, fast_reconnect, setup_tracing, wait_for, MockNode};

const CREATE_KS: &str = "CREATE KEYSPACE IF NOT EXISTS ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}";

#[tokio::test]
#[ntest::timeout(10000)]
async fn unreachable_node_fails_to_connect() {
    setup_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = SessionBuilder::new()
        .known_node_addr(addr)
        .reconnect_policy(fast_reconnect(Some(1)))
        .build()
        .await
        .unwrap_err();
    assert_matches!(err, NewSessionError::NoConnections(_));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn use_keyspace_at_connect_and_later() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).build().await.unwrap();
    session.query(CREATE_KS, ()).await.unwrap();
    session
        .query("CREATE TABLE ks.t (k int PRIMARY KEY, v int)", ())
        .await
        .unwrap();

    let err = session.use_keyspace("missing_ks", false).await.unwrap_err();
    assert_matches!(err, UseKeyspaceError::RequestError(QueryError::DbError(..)));

    let err = session.use_keyspace("bad-name", false).await.unwrap_err();
    assert_matches!(err, UseKeyspaceError::BadKeyspaceName(_));

    session.use_keyspace("ks", false).await.unwrap();
    assert_eq!(session.get_keyspace().unwrap().as_str(), "ks");
    session
        .query("INSERT INTO t (k, v) VALUES (?, ?)", (1_i32, 2_i32))
        .await
        .unwrap();

    let other = builder_for(&node)
        .use_keyspace("ks", false)
        .build()
        .await
        .unwrap();
    let count = other
        .query("SELECT COUNT(*) FROM t", ())
        .await
        .unwrap()
        .single_row()
        .unwrap();
    assert_eq!(count.get_value("count").and_then(|v| v.as_bigint()), Some(1));

    let err = builder_for(&node)
        .use_keyspace("missing_ks", false)
        .build()
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NewSessionError::UseKeyspaceError(_) | NewSessionError::NoConnections(_)
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn value_count_mismatch_is_rejected_locally() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).build().await.unwrap();
    let sent_before = node.received_queries().len();

    let err = session
        .query("SELECT v FROM ks.t WHERE k = ? AND v = ?", (1_i32,))
        .await
        .unwrap_err();
    assert_matches!(err, QueryError::BadQuery(_));
    assert_eq!(err.name(), "InvalidRequestException");

    let err = session
        .query("SELECT v FROM ks.t WHERE k = :k", (1_i32,))
        .await
        .unwrap_err();
    assert_matches!(err, QueryError::BadQuery(_));

    assert_eq!(node.received_queries().len(), sent_before);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn consistency_reaches_the_node() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node)
        .default_consistency(Consistency::Quorum)
        .build()
        .await
        .unwrap();

    session.query(CREATE_KS, ()).await.unwrap();
    assert_eq!(
        node.received_queries().last().unwrap().consistency,
        Consistency::Quorum
    );

    let options = ExecutionOptions::new().with_consistency(Consistency::One);
    session
        .query_with_options(CREATE_KS, (), &options)
        .await
        .unwrap();
    assert_eq!(
        node.received_queries().last().unwrap().consistency,
        Consistency::One
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn close_is_idempotent() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).build().await.unwrap();
    session.query(CREATE_KS, ()).await.unwrap();

    session.close().await;
    assert!(session.is_closed());
    session.close().await;

    let err = session.query(CREATE_KS, ()).await.unwrap_err();
    assert_matches!(err, QueryError::SessionClosed);
    assert_eq!(err.name(), "ConnectionError");

    let err = session.use_keyspace("ks", false).await.unwrap_err();
    assert_matches!(err, UseKeyspaceError::RequestError(QueryError::SessionClosed));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn close_drains_outstanding_requests() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(
        builder_for(&node)
            .drain_timeout(Duration::from_secs(2))
            .build()
            .await
            .unwrap(),
    );
    node.set_response_delay(Some(Duration::from_millis(200)));

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.query(CREATE_KS, ()).await }
    });
    wait_for(Duration::from_secs(2), || async {
        (!node.received_queries().is_empty()).then_some(())
    })
    .await;

    session.close().await;
    in_flight.await.unwrap().unwrap();
    assert_matches!(
        session.query(CREATE_KS, ()).await,
        Err(QueryError::SessionClosed)
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn close_gives_up_after_drain_timeout() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(
        builder_for(&node)
            .drain_timeout(Duration::from_millis(50))
            .request_timeout(None)
            .build()
            .await
            .unwrap(),
    );
    node.set_response_delay(Some(Duration::from_secs(60)));

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.query(CREATE_KS, ()).await }
    });
    wait_for(Duration::from_secs(2), || async {
        (!node.received_queries().is_empty()).then_some(())
    })
    .await;

    session.close().await;
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(err.is_connection_error(), "{err:?}");
}

use assert_matches::assert_matches;
use helenus::{Compression, ConnectionState, ExecutionOptions, QueryError, Session};

use crate::utils::{builder_for, setup_tracing, MockNode, MockNodeConfig};

async fn session_with_table(node: &MockNode, compression: Option<Compression>) -> Session {
    let session = builder_for(node)
        .compression(compression)
        .build()
        .await
        .unwrap();
    session
        .query(
            "CREATE KEYSPACE IF NOT EXISTS ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}",
            (),
        )
        .await
        .unwrap();
    session
        .query("CREATE TABLE IF NOT EXISTS ks.t (k text PRIMARY KEY, v text)", ())
        .await
        .unwrap();
    session
}

async fn roundtrip(session: &Session, options: &ExecutionOptions, text: &str) -> String {
    session
        .query_with_options(
            "INSERT INTO ks.t (k, v) VALUES (?, ?)",
            ("key", text),
            options,
        )
        .await
        .unwrap();
    session
        .query_with_options("SELECT v FROM ks.t WHERE k = ?", ("key",), options)
        .await
        .unwrap()
        .first_row()
        .unwrap()
        .get_value("v")
        .and_then(|v| v.as_text())
        .cloned()
        .unwrap()
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn compression_is_transparent() {
    setup_tracing();
    let node = MockNode::start().await;
    let large_text = "a".repeat(64 * 1024);

    for compression in [
        None,
        Some(Compression::Lz4),
        Some(Compression::Snappy),
        Some(Compression::Gzip),
    ] {
        let session = session_with_table(&node, compression).await;
        let received = roundtrip(&session, &ExecutionOptions::default(), &large_text).await;
        assert_eq!(received, large_text);

        let last = node.received_queries().pop().unwrap();
        assert_eq!(last.compressed, compression.is_some(), "{:?}", compression);
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn compression_can_be_turned_off_per_call() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = session_with_table(&node, Some(Compression::Snappy)).await;

    let options = ExecutionOptions::new().with_compression(false);
    let received = roundtrip(&session, &options, "plain").await;
    assert_eq!(received, "plain");
    assert!(!node.received_queries().last().unwrap().compressed);

    let received = roundtrip(&session, &ExecutionOptions::default(), "packed").await;
    assert_eq!(received, "packed");
    assert!(node.received_queries().last().unwrap().compressed);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn unsupported_compression_falls_back_to_plain_frames() {
    setup_tracing();
    let node = MockNode::start_with(MockNodeConfig {
        compression: vec![Compression::Lz4],
        ..Default::default()
    })
    .await;
    let session = session_with_table(&node, Some(Compression::Gzip)).await;

    let received = roundtrip(&session, &ExecutionOptions::default(), "text").await;
    assert_eq!(received, "text");
    assert!(node.received_queries().iter().all(|q| !q.compressed));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn corrupt_compressed_response_fails_only_its_request() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = session_with_table(&node, Some(Compression::Lz4)).await;
    roundtrip(&session, &ExecutionOptions::default(), "before").await;

    node.corrupt_next_compressed_response();
    let err = session
        .query("SELECT v FROM ks.t WHERE k = ?", ("key",))
        .await
        .unwrap_err();
    assert_matches!(err, QueryError::InvalidMessage(_));
    assert_eq!(err.name(), "ProtocolError");

    assert!(session
        .connection_states()
        .iter()
        .all(|(_, state)| *state == ConnectionState::Ready));
    let received = roundtrip(&session, &ExecutionOptions::default(), "after").await;
    assert_eq!(received, "after");
}

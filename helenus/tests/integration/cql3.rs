use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use helenus::value::CqlTimestamp;
use helenus::{ConnectionState, CqlValue, ExecutionOptions, QueryError, Session};

use crate::utils::{builder_for, setup_tracing, unique_keyspace_name, wait_for, MockNode};

// 2012-03-01T00:00:00Z and one day later.
const MARCH_1ST: i64 = 1_330_560_000_000;
const MARCH_2ND: i64 = 1_330_646_400_000;

async fn create_keyspace(session: &Session) -> String {
    let ks = unique_keyspace_name();
    let result = session
        .query(
            format!(
                "CREATE KEYSPACE {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                ks
            ),
            (),
        )
        .await
        .unwrap();
    assert!(result.rows.is_none());

    session.use_keyspace(ks.clone(), false).await.unwrap();
    ks
}

/// Session with a keyspace, a static column family and one row: `foobar -> bar`.
async fn static_column_family(node: &MockNode) -> Session {
    let session = builder_for(node).build().await.unwrap();
    create_keyspace(&session).await;

    let result = session
        .query("CREATE TABLE cql_test (id text PRIMARY KEY, foo text)", ())
        .await
        .unwrap();
    assert!(result.rows.is_none());

    session
        .query(
            "INSERT INTO cql_test (id, foo) VALUES (?, ?)",
            ("foobar", "baz"),
        )
        .await
        .unwrap()
        .result_not_rows()
        .unwrap();
    session
        .query("UPDATE cql_test SET foo=? WHERE id=?", ("bar", "foobar"))
        .await
        .unwrap()
        .result_not_rows()
        .unwrap();

    session
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn ddl_produces_no_rows() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).build().await.unwrap();

    let ks = create_keyspace(&session).await;
    assert_eq!(session.get_keyspace().as_deref(), Some(&ks));

    let result = session
        .query("CREATE TABLE cql_test (id text PRIMARY KEY, foo text)", ())
        .await
        .unwrap();
    assert!(!result.has_rows());
    assert!(result.col_specs.is_empty());

    let result = session.query("DROP TABLE cql_test", ()).await.unwrap();
    assert!(result.rows.is_none());

    let result = session
        .query(format!("DROP KEYSPACE {}", ks), ())
        .await
        .unwrap();
    assert!(result.rows.is_none());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn select_from_static_column_family() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;

    let rows = session
        .query("SELECT foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap()
        .rows()
        .unwrap();

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.key, Some(CqlValue::Text("foobar".to_owned())));
    assert_eq!(row.count(), 1);
    assert_eq!(row.get_value("foo").and_then(|v| v.as_text()).unwrap(), "bar");
    assert_eq!(row.get_by_index(0).unwrap().name, "foo");
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn repeated_select_returns_identical_rows() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;

    let select = "SELECT foo FROM cql_test WHERE id=?";
    let first = session.query(select, ("foobar",)).await.unwrap();
    let second = session.query(select, ("foobar",)).await.unwrap();
    assert!(first.rows.as_ref().is_some_and(|rows| !rows.is_empty()));
    assert_eq!(first.rows, second.rows);

    let count = "SELECT COUNT(*) FROM cql_test";
    let first = session.query(count, ()).await.unwrap();
    let second = session.query(count, ()).await.unwrap();
    assert_eq!(first.rows, second.rows);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn quoted_marker_binds_a_value() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;

    // The value itself starts with a quote; it must travel as a bound value.
    let rows = session
        .query("SELECT foo FROM cql_test WHERE id='?'", ("'foobar",))
        .await
        .unwrap()
        .rows()
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, Some(CqlValue::Text("'foobar".to_owned())));
    assert_eq!(rows[0].count(), 0);

    let sent = node.received_queries();
    let last = sent.last().unwrap();
    assert_eq!(last.contents, "SELECT foo FROM cql_test WHERE id=?");
    assert_eq!(last.values, 1);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn count_with_and_without_compression() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;
    for id in ["a", "b"] {
        session
            .query("INSERT INTO cql_test (id, foo) VALUES (?, ?)", (id, "x"))
            .await
            .unwrap();
    }

    let plain = session
        .query("SELECT COUNT(*) FROM cql_test", ())
        .await
        .unwrap()
        .single_row()
        .unwrap();
    assert_eq!(plain.get_value("count").and_then(|v| v.as_bigint()), Some(3));

    let gzip_session = builder_for(&node)
        .compression(Some(helenus::Compression::Gzip))
        .use_keyspace(session.get_keyspace().unwrap().as_str(), false)
        .build()
        .await
        .unwrap();
    let compressed = gzip_session
        .query("SELECT COUNT(*) FROM cql_test", ())
        .await
        .unwrap()
        .single_row()
        .unwrap();
    assert_eq!(compressed, plain);
    assert!(node.received_queries().last().unwrap().compressed);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn syntax_error_keeps_connection_usable() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;

    let err = session
        .query("SELECT foo FROM cql_test WHERE id='?", ("foobar",))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "InvalidRequestException");
    assert!(!err.to_string().is_empty());

    let err = session.query("SELECT 1 FRM", ()).await.unwrap_err();
    assert_matches!(err, QueryError::DbError(..));
    assert_eq!(err.name(), "InvalidRequestException");

    assert!(session
        .connection_states()
        .iter()
        .all(|(_, state)| *state == ConnectionState::Ready));

    // Same connection, next request.
    session
        .query("SELECT foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn deleted_column_stays_as_ghost() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = static_column_family(&node).await;

    session
        .query("DELETE foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap();

    let row = session
        .query("SELECT id, foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap()
        .first_row()
        .unwrap();

    assert_eq!(row.count(), 2);
    assert_eq!(row.get_value("id").and_then(|v| v.as_text()).unwrap(), "foobar");
    assert!(row.get("foo").unwrap().is_null());
    assert_eq!(row.get_value("foo"), None);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn detached_update_is_applied() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(static_column_family(&node).await);

    let handle = session.query_detached(
        "UPDATE cql_test SET foo=? WHERE id=?",
        ("qux", "foobar"),
        ExecutionOptions::default(),
    );
    handle.await.unwrap();

    let row = session
        .query("SELECT foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap()
        .first_row()
        .unwrap();
    assert_eq!(row.get_value("foo").and_then(|v| v.as_text()).unwrap(), "qux");
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn detached_query_from_a_thread_outside_the_runtime() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(static_column_family(&node).await);

    let handle = std::thread::spawn({
        let session = session.clone();
        move || {
            session.query_detached(
                "UPDATE cql_test SET foo=? WHERE id=?",
                ("from_thread", "foobar"),
                ExecutionOptions::default(),
            )
        }
    })
    .join()
    .expect("query_detached panicked outside the runtime");
    handle.await.unwrap();

    let row = session
        .query("SELECT foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap()
        .first_row()
        .unwrap();
    assert_eq!(
        row.get_value("foo").and_then(|v| v.as_text()).unwrap(),
        "from_thread"
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn failing_detached_query_does_not_disturb_others() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = Arc::new(static_column_family(&node).await);
    node.set_response_delay(Some(Duration::from_millis(50)));

    let failing = session.query_detached("SELEC nonsense", (), ExecutionOptions::default());
    let row = session
        .query("SELECT foo FROM cql_test WHERE id=?", ("foobar",))
        .await
        .unwrap()
        .first_row()
        .unwrap();
    assert_eq!(row.get_value("foo").and_then(|v| v.as_text()).unwrap(), "bar");

    // The failure is swallowed by the task.
    failing.await.unwrap();
    wait_for(Duration::from_secs(2), || async {
        node.received_queries()
            .iter()
            .any(|q| q.contents == "SELEC nonsense")
            .then_some(())
    })
    .await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn dynamic_column_family() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder_for(&node).build().await.unwrap();
    create_keyspace(&session).await;

    session
        .query(
            "CREATE TABLE dynamic_test (userid int, url text, ts timestamp, PRIMARY KEY (userid, url))",
            (),
        )
        .await
        .unwrap();

    let insert = "INSERT INTO dynamic_test (userid, url, ts) VALUES (?, ?, ?)";
    session
        .query(insert, (10_i32, "www.foo.com", CqlTimestamp(MARCH_1ST)))
        .await
        .unwrap();
    session
        .query(insert, (10_i32, "www.bar.com", CqlTimestamp(MARCH_2ND)))
        .await
        .unwrap();
    session
        .query(insert, (11_i32, "www.baz.com", CqlTimestamp(MARCH_2ND)))
        .await
        .unwrap();

    let rows = session
        .query("SELECT url, ts FROM dynamic_test WHERE userid=?", (10_i32,))
        .await
        .unwrap()
        .rows()
        .unwrap();
    assert_eq!(rows.len(), 2);
    let first_seen = rows
        .iter()
        .find(|row| row.get_value("url").and_then(|v| v.as_text()).unwrap() == "www.foo.com")
        .unwrap();
    assert_eq!(
        first_seen.get_value("ts").and_then(|v| v.as_cql_timestamp()),
        Some(CqlTimestamp(MARCH_1ST))
    );

    let row = session
        .query(
            "SELECT * FROM dynamic_test WHERE userid=? AND url=?",
            (10_i32, "www.foo.com"),
        )
        .await
        .unwrap()
        .single_row()
        .unwrap();
    assert_eq!(row.key, None);
    assert_eq!(row.count(), 3);
    assert_eq!(row.get_value("userid").and_then(|v| v.as_int()), Some(10));

    session.query("DROP TABLE dynamic_test", ()).await.unwrap();
}

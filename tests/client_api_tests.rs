/// Client API tests
///
/// Remote connections, statements, cursors and large objects driven
/// end to end through an in-process transport and the memory driver.
/// Run with: cargo test --test client_api_tests

mod common;

use rustmemodb_remote::core::{ErrorCode, ErrorKind, Value};
use rustmemodb_remote::driver::{Isolation, ScrollMode};
use rustmemodb_remote::{
    Dispatcher, LocalTransport, RemoteConnection, RemoteStatement, ResourceConfig, ServerConfig,
};
use std::sync::Arc;

async fn connect(dispatcher: &Arc<Dispatcher>, resource: &str) -> RemoteConnection {
    let transport = Arc::new(LocalTransport::new(dispatcher.clone()));
    RemoteConnection::connect(transport, resource, Default::default())
        .await
        .unwrap()
}

fn paged_config(name: &str, packet_size: usize) -> ServerConfig {
    ServerConfig::new().resource(
        ResourceConfig::new(name, &format!("memory:{}", name)).row_packet_size(packet_size),
    )
}

async fn seed_users(stmt: &RemoteStatement, count: i64) {
    stmt.execute_update("CREATE TABLE users (id INTEGER, name TEXT)")
        .await
        .unwrap();
    for i in 1..=count {
        stmt.execute_update(&format!("INSERT INTO users VALUES ({}, 'user{}')", i, i))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_forward_cursor_reads_every_packet() {
    let (dispatcher, _) = common::dispatcher(paged_config("forward", 3));
    let mut conn = connect(&dispatcher, "forward").await;
    let stmt = conn.create_statement().await.unwrap();
    seed_users(&stmt, 7).await;

    let mut rows = stmt.execute_query("SELECT id, name FROM users ORDER BY id").await.unwrap();
    assert!(!rows.is_scrollable());
    assert_eq!(rows.column_count(), 2);
    assert_eq!(rows.find_column("name").unwrap(), 2);

    let mut seen = Vec::new();
    while rows.next().await.unwrap() {
        seen.push(rows.get_i64(1).unwrap().unwrap());
        assert_eq!(
            rows.get_by_label::<String>("name").unwrap(),
            Some(format!("user{}", seen.len()))
        );
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
    assert!(rows.is_complete());
    assert!(!rows.next().await.unwrap());

    // The server dropped the drained holder: only root and statement remain.
    let session = dispatcher.session(conn.session_id()).unwrap();
    assert_eq!(session.registry().len(), 2);

    rows.close().await.unwrap();
    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_forward_cursor_rejects_backward_moves() {
    let (dispatcher, _) = common::dispatcher(paged_config("forward_only", 2));
    let mut conn = connect(&dispatcher, "forward_only").await;
    let stmt = conn.create_statement().await.unwrap();
    seed_users(&stmt, 5).await;

    let mut rows = stmt.execute_query("SELECT id FROM users").await.unwrap();
    assert!(rows.next().await.unwrap());
    let err = rows.previous().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unsupported);
    assert!(rows.first().await.is_err());

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_scrollable_cursor_keeps_history() {
    let (dispatcher, _) = common::dispatcher(paged_config("scroll", 3));
    let mut conn = connect(&dispatcher, "scroll").await;
    let setup = conn.create_statement().await.unwrap();
    seed_users(&setup, 7).await;

    let stmt = conn.create_statement_with(ScrollMode::Scrollable).await.unwrap();
    let mut rows = stmt.execute_query("SELECT id FROM users ORDER BY id").await.unwrap();
    assert!(rows.is_scrollable());

    assert!(rows.last().await.unwrap());
    assert_eq!(rows.row(), 7);
    assert_eq!(rows.get_i64(1).unwrap(), Some(7));
    assert_eq!(rows.fetched_rows(), 7);

    assert!(rows.previous().await.unwrap());
    assert_eq!(rows.get_i64(1).unwrap(), Some(6));

    assert!(rows.absolute(-3).await.unwrap());
    assert_eq!(rows.get_i64(1).unwrap(), Some(5));

    assert!(rows.first().await.unwrap());
    assert_eq!(rows.get_i64(1).unwrap(), Some(1));

    assert!(rows.relative(2).await.unwrap());
    assert_eq!(rows.get_i64(1).unwrap(), Some(3));

    assert!(!rows.relative(10).await.unwrap());
    assert!(rows.is_after_last());

    rows.before_first().unwrap();
    assert!(rows.is_before_first());
    assert!(rows.next().await.unwrap());
    assert_eq!(rows.row(), 1);

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_closing_a_cursor_early_releases_the_holder() {
    let (dispatcher, _) = common::dispatcher(paged_config("early_close", 2));
    let mut conn = connect(&dispatcher, "early_close").await;
    let stmt = conn.create_statement().await.unwrap();
    seed_users(&stmt, 10).await;

    let mut rows = stmt.execute_query("SELECT id FROM users").await.unwrap();
    assert!(rows.next().await.unwrap());
    let session = dispatcher.session(conn.session_id()).unwrap();
    assert_eq!(session.registry().len(), 3);

    rows.close().await.unwrap();
    assert!(rows.is_closed());
    assert_eq!(session.registry().len(), 2);
    assert_eq!(rows.next().await.unwrap_err().code(), ErrorCode::Closed);

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_prepared_statement_and_update_counts() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:prepared").await;
    let setup = conn.create_statement().await.unwrap();
    setup
        .execute_update("CREATE TABLE items (id INTEGER, label TEXT, price FLOAT)")
        .await
        .unwrap();

    let insert = conn
        .prepare_statement("INSERT INTO items VALUES (?, ?, ?)")
        .await
        .unwrap();
    for (id, label) in [(1, "pen"), (2, "ink")] {
        insert.set_parameter(1, id as i64).await.unwrap();
        insert.set_parameter(2, label).await.unwrap();
        insert.set_parameter(3, 2.5).await.unwrap();
        assert_eq!(insert.execute_prepared_update().await.unwrap(), 1);
    }

    let query = conn
        .prepare_statement("SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    query.set_parameter(1, 2i64).await.unwrap();
    let mut rows = query.execute_prepared_query().await.unwrap();
    assert!(rows.next().await.unwrap());
    assert_eq!(rows.get_string(1).unwrap().as_deref(), Some("ink"));
    assert!(!rows.next().await.unwrap());

    assert_eq!(
        setup.execute_update("UPDATE items SET price = 3.0").await.unwrap(),
        2
    );

    assert!(setup.execute("SELECT id FROM items").await.unwrap());
    let mut result = setup.result_set().await.unwrap().expect("a result set");
    assert!(result.next().await.unwrap());
    assert!(setup.result_set().await.unwrap().is_none());

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_batches_and_generated_keys() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:batches").await;
    let stmt = conn.create_statement().await.unwrap();
    stmt.execute_update("CREATE TABLE events (id INTEGER, kind TEXT)")
        .await
        .unwrap();

    stmt.add_batch("INSERT INTO events VALUES (1, 'open')").await.unwrap();
    stmt.add_batch("INSERT INTO events VALUES (2, 'read'), (3, 'close')")
        .await
        .unwrap();
    assert_eq!(stmt.execute_batch().await.unwrap(), vec![1, 2]);

    stmt.execute_update("INSERT INTO events VALUES (42, 'late')")
        .await
        .unwrap();
    let mut keys = stmt.generated_keys().await.unwrap();
    assert!(keys.next().await.unwrap());
    assert_eq!(keys.get_i64(1).unwrap(), Some(42));

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_statement_limits_are_cached_on_the_client() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:limits").await;
    let mut stmt = conn.create_statement().await.unwrap();
    assert_eq!(stmt.max_rows(), 0);
    assert_eq!(stmt.query_timeout(), 0);

    stmt.set_max_rows(2).await.unwrap();
    stmt.set_query_timeout(30).await.unwrap();
    assert_eq!(stmt.max_rows(), 2);
    assert_eq!(stmt.query_timeout(), 30);

    seed_users(&stmt, 4).await;
    let mut rows = stmt.execute_query("SELECT id FROM users").await.unwrap();
    let mut count = 0;
    while rows.next().await.unwrap() {
        count += 1;
    }
    assert_eq!(count, 2);

    stmt.close().await.unwrap();
    assert_eq!(
        stmt.execute_update("DELETE FROM users").await.unwrap_err().code(),
        ErrorCode::Closed
    );
    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_transactions_and_savepoints() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:txn").await;
    let stmt = conn.create_statement().await.unwrap();
    stmt.execute_update("CREATE TABLE ledger (id INTEGER)").await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    assert!(!conn.auto_commit().await.unwrap());

    stmt.execute_update("INSERT INTO ledger VALUES (1)").await.unwrap();
    let savepoint = conn.set_savepoint(Some("before_two")).await.unwrap();
    assert_eq!(savepoint.name(), Some("before_two"));
    stmt.execute_update("INSERT INTO ledger VALUES (2)").await.unwrap();

    conn.rollback_to_savepoint(&savepoint).await.unwrap();
    conn.release_savepoint(savepoint).await.unwrap();
    conn.commit().await.unwrap();

    stmt.execute_update("INSERT INTO ledger VALUES (3)").await.unwrap();
    conn.rollback().await.unwrap();

    let mut rows = stmt.execute_query("SELECT id FROM ledger").await.unwrap();
    let mut ids = Vec::new();
    while rows.next().await.unwrap() {
        ids.push(rows.get_i64(1).unwrap().unwrap());
    }
    assert_eq!(ids, vec![1]);

    conn.set_transaction_isolation(Isolation::Serializable).await.unwrap();
    assert_eq!(conn.transaction_isolation().await.unwrap(), Isolation::Serializable);
    conn.set_read_only(true).await.unwrap();
    assert!(conn.is_read_only().await.unwrap());

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_metadata_lists_tables_and_columns() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:meta").await;
    let stmt = conn.create_statement().await.unwrap();
    stmt.execute_update("CREATE TABLE users (id INTEGER NOT NULL, name TEXT)")
        .await
        .unwrap();
    stmt.execute_update("CREATE TABLE orders (id INTEGER)").await.unwrap();

    let meta = conn.metadata().await.unwrap();
    assert_eq!(meta.product_name(), "rustmemodb");
    assert_eq!(meta.driver_name(), "memory");

    let mut tables = meta.tables(Some("us%")).await.unwrap();
    assert!(tables.next().await.unwrap());
    assert_eq!(tables.get_string(1).unwrap().as_deref(), Some("users"));
    assert!(!tables.next().await.unwrap());

    let mut columns = meta.columns("users").await.unwrap();
    let mut names = Vec::new();
    while columns.next().await.unwrap() {
        names.push(columns.get_by_label::<String>("column_name").unwrap().unwrap());
    }
    assert_eq!(names, vec!["id", "name"]);

    meta.close().await.unwrap();
    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_large_objects() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:lobs").await;

    let blob = conn.create_blob().await.unwrap();
    assert_eq!(blob.write(0, &[1, 2, 3, 4]).await.unwrap(), 4);
    assert_eq!(blob.write(2, &[9, 9, 9]).await.unwrap(), 3);
    assert_eq!(blob.length().await.unwrap(), 5);
    assert_eq!(blob.read(1, 3).await.unwrap(), vec![2, 9, 9]);
    blob.truncate(2).await.unwrap();
    assert_eq!(blob.read(0, 100).await.unwrap(), vec![1, 2]);
    blob.free().await.unwrap();

    let clob = conn.create_clob().await.unwrap();
    clob.write_str(0, "hello world").await.unwrap();
    assert_eq!(clob.read_string(6, 5).await.unwrap(), "world");
    let err = clob.write(0, &[0xff, 0xfe]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_connection_level_calls() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:misc").await;

    assert!(conn.is_valid().await.unwrap());
    assert_eq!(
        conn.native_sql("SELECT 1").await.unwrap(),
        "SELECT 1".to_string()
    );
    conn.ping().await.unwrap();

    let call = conn.prepare_call("{call SELECT 40 + 2 AS answer}").await.unwrap();
    call.register_out_parameter(1, rustmemodb_remote::DataType::Integer)
        .await
        .unwrap();
    assert!(call.execute_prepared().await.unwrap());
    assert_eq!(call.out_parameter(1).await.unwrap(), Value::Integer(42));

    conn.close().await.unwrap();
    assert!(conn.is_closed());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_closed_session_is_unknown() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:closed").await;
    let stmt = conn.create_statement().await.unwrap();
    assert_eq!(dispatcher.session_count(), 1);

    conn.close().await.unwrap();
    assert_eq!(dispatcher.session_count(), 0);

    let err = stmt.execute_update("CREATE TABLE t (id INTEGER)").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.code(), ErrorCode::UnknownSession);

    // Closing twice is harmless.
    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_denied_sql_is_rejected_before_execution() {
    let config = ServerConfig::new().resource(
        ResourceConfig::new("guarded", "memory:guarded").deny("(?i)^\\s*drop\\s"),
    );
    let (dispatcher, _) = common::dispatcher(config);
    let mut conn = connect(&dispatcher, "guarded").await;
    let stmt = conn.create_statement().await.unwrap();
    stmt.execute_update("CREATE TABLE keep (id INTEGER)").await.unwrap();

    let err = stmt.execute_update("DROP TABLE keep").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Rejected);
    assert_eq!(err.kind(), ErrorKind::Execution);

    let mut rows = stmt.execute_query("SELECT id FROM keep").await.unwrap();
    assert!(!rows.next().await.unwrap());

    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_database_errors_keep_their_sql_state() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let mut conn = connect(&dispatcher, "memory:errors").await;
    let stmt = conn.create_statement().await.unwrap();

    let err = stmt.execute_query("SELECT * FROM missing").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Database);
    match err {
        rustmemodb_remote::ProxyError::Remote(remote) => {
            assert_eq!(remote.sql_state.as_deref(), Some("42P01"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    // The statement is still usable after a failure.
    stmt.execute_update("CREATE TABLE present (id INTEGER)").await.unwrap();
    conn.close().await.unwrap();
    dispatcher.shutdown().await;
}

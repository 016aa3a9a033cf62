/// Session lifecycle tests
///
/// Connect, cascade on close, pooling, serialization of commands and
/// dispatcher shutdown.
/// Run with: cargo test --test session_lifecycle_tests

mod common;

use rustmemodb_remote::core::{ErrorCode, ErrorKind};
use rustmemodb_remote::{
    Command, Dispatcher, LocalTransport, RemoteConnection, ResourceConfig, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;

async fn connect(dispatcher: &Arc<Dispatcher>, resource: &str) -> RemoteConnection {
    let transport = Arc::new(LocalTransport::new(dispatcher.clone()));
    RemoteConnection::connect(transport, resource, Default::default())
        .await
        .unwrap()
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn test_connect_by_name_locator_and_defaults() {
    let config = ServerConfig::new()
        .resource(ResourceConfig::new("sales", common::LOCATOR).row_packet_size(7))
        .defaults(ResourceConfig::default().row_packet_size(11));
    let (dispatcher, stats) = common::dispatcher(config);

    let by_name = connect(&dispatcher, "sales").await;
    assert_eq!(by_name.flags().row_packet_size, 7);

    let by_locator = connect(&dispatcher, common::LOCATOR).await;
    assert_eq!(by_locator.flags().row_packet_size, 7);

    let unnamed = connect(&dispatcher, "scripted:other").await;
    assert_eq!(unnamed.flags().row_packet_size, 11);
    assert_eq!(unnamed.flags().charset, "UTF-8");

    assert_eq!(stats.opened(), 3);
    assert_eq!(dispatcher.session_count(), 3);
    dispatcher.shutdown().await;
    assert_eq!(stats.closed(), 3);
}

#[tokio::test]
async fn test_unknown_locator_is_a_configuration_error() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let transport = Arc::new(LocalTransport::new(dispatcher.clone()));

    let err = RemoteConnection::connect(transport, "jdbc:nowhere", Default::default())
        .await
        .err()
        .expect("no driver accepts the locator");
    assert_eq!(err.code(), ErrorCode::Config);
    assert_eq!(dispatcher.session_count(), 0);
}

#[tokio::test]
async fn test_closing_the_root_closes_every_object() {
    let config = ServerConfig::new()
        .resource(ResourceConfig::new("cascade", common::LOCATOR).row_packet_size(3));
    let (dispatcher, stats) = common::dispatcher(config);
    let mut conn = connect(&dispatcher, "cascade").await;

    let stmt = conn.create_statement().await.unwrap();
    let mut rows = stmt.execute_query("ROWS 10").await.unwrap();
    assert!(rows.next().await.unwrap());
    let _blob = conn.create_blob().await.unwrap();

    let session = dispatcher.session(conn.session_id()).unwrap();
    // root, statement, cursor holder, blob
    assert_eq!(session.registry().len(), 4);

    conn.close().await.unwrap();
    assert!(session.is_empty());
    assert_eq!(dispatcher.session_count(), 0);
    assert_eq!(stats.closed(), 1);
    eventually(|| stats.result_sets_closed() == 1).await;

    // Fetching the rest now fails: the session is gone.
    let mut exhausted = true;
    for _ in 0..10 {
        match rows.next().await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                assert_eq!(err.code(), ErrorCode::UnknownSession);
                exhausted = false;
                break;
            }
        }
    }
    assert!(!exhausted);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_commands_on_one_session_are_serialized() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let conn = connect(&dispatcher, common::LOCATOR).await;
    let stmt = conn.create_statement().await.unwrap();
    let canceller = stmt.canceller();

    let blocked = tokio::spawn(async move { stmt.execute_update("BLOCK").await });
    let session = dispatcher.session(conn.session_id()).unwrap();
    eventually(|| session.is_active()).await;

    // A second command waits for the first one.
    let waited = tokio::time::timeout(Duration::from_millis(100), conn.ping()).await;
    assert!(waited.is_err());

    canceller.cancel().await.unwrap();
    let err = blocked.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    conn.ping().await.unwrap();
    assert!(!session.is_active());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_independent_sessions_run_concurrently() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let blocked_conn = connect(&dispatcher, common::LOCATOR).await;
    let other = connect(&dispatcher, common::LOCATOR).await;

    let stmt = blocked_conn.create_statement().await.unwrap();
    let canceller = stmt.canceller();
    let blocked = tokio::spawn(async move { stmt.execute_query("BLOCK").await.map(|_| ()) });
    let session = dispatcher.session(blocked_conn.session_id()).unwrap();
    eventually(|| session.is_active()).await;

    let other_stmt = other.create_statement().await.unwrap();
    let mut rows = tokio::time::timeout(Duration::from_secs(1), other_stmt.execute_query("ROWS 2"))
        .await
        .expect("other session is not blocked")
        .unwrap();
    assert!(rows.next().await.unwrap());

    canceller.cancel().await.unwrap();
    assert!(blocked.await.unwrap().unwrap_err().is_cancelled());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_pooled_connections_are_reused() {
    let config = ServerConfig::new()
        .resource(ResourceConfig::new("pooled", common::LOCATOR).pooled(1, 2));
    let (dispatcher, stats) = common::dispatcher(config);

    let mut first = connect(&dispatcher, "pooled").await;
    let mut second = connect(&dispatcher, "pooled").await;
    assert_eq!(stats.opened(), 2);

    first.set_auto_commit(false).await.unwrap();
    first.close().await.unwrap();
    second.close().await.unwrap();
    assert_eq!(stats.closed(), 0);

    let pools = dispatcher.pool_stats().await;
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].0, "pooled");
    assert_eq!(pools[0].1.available_connections, 2);

    // A reused connection comes back reset.
    let third = connect(&dispatcher, "pooled").await;
    assert!(third.auto_commit().await.unwrap());
    assert_eq!(stats.opened(), 2);

    dispatcher.shutdown().await;
    assert_eq!(stats.closed(), 2);
}

#[tokio::test]
async fn test_session_statistics() {
    let config = ServerConfig::new()
        .resource(ResourceConfig::new("counted", common::LOCATOR).command_stats(true));
    let (dispatcher, _) = common::dispatcher(config);
    let conn = connect(&dispatcher, "counted").await;

    let stmt = conn.create_statement().await.unwrap();
    stmt.execute_update("COUNT 3").await.unwrap();
    stmt.execute_update("COUNT 4").await.unwrap();
    conn.ping().await.unwrap();

    let stats = dispatcher.session_stats();
    assert_eq!(stats.len(), 1);
    let session = &stats[0];
    assert_eq!(session.id, conn.session_id());
    assert_eq!(session.resource, "counted");
    assert_eq!(session.objects, 2);
    assert_eq!(session.commands, 4);
    assert_eq!(session.per_command.get("execute_update"), Some(&2));
    assert!(!session.active);
    assert!(session.to_string().contains("counted"));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_protocol_errors() {
    let (dispatcher, _) = common::dispatcher(ServerConfig::default());
    let conn = connect(&dispatcher, common::LOCATOR).await;
    let session_id = conn.session_id();

    let err = dispatcher
        .execute(session_id, None, Command::Commit, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedCommand);

    let root = dispatcher.session(session_id).unwrap().root().uid;
    let err = dispatcher
        .execute(session_id, Some(root), Command::NextPacket, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotApplicable);
    assert_eq!(err.kind(), ErrorKind::Target);

    let err = dispatcher
        .execute(
            rustmemodb_remote::SessionId::new(),
            Some(root),
            Command::Ping,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
    let (dispatcher, stats) = common::dispatcher(ServerConfig::default());
    let _a = connect(&dispatcher, common::LOCATOR).await;
    let _b = connect(&dispatcher, common::LOCATOR).await;

    dispatcher.shutdown().await;
    assert!(dispatcher.is_shut_down());
    assert_eq!(dispatcher.session_count(), 0);
    assert_eq!(stats.closed(), 2);

    let transport = Arc::new(LocalTransport::new(dispatcher.clone()));
    let err = RemoteConnection::connect(transport, common::LOCATOR, Default::default())
        .await
        .err()
        .expect("connect after shutdown fails");
    assert_eq!(err.code(), ErrorCode::Closed);

    // Idempotent.
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_configuration_file_drives_the_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.json");
    std::fs::write(
        &path,
        r#"{
            "bind": "127.0.0.1:0",
            "reclaim_period_ms": 0,
            "resources": [
                { "name": "filed", "locator": "scripted:filed", "row_packet_size": 4, "charset": "ISO-8859-1" }
            ]
        }"#,
    )
    .unwrap();

    let config = ServerConfig::from_json_file(&path).unwrap();
    assert_eq!(config.reclaim_period(), None);
    let (dispatcher, _) = common::dispatcher(config);

    let conn = connect(&dispatcher, "filed").await;
    assert_eq!(conn.flags().row_packet_size, 4);
    assert_eq!(conn.flags().charset, "ISO-8859-1");

    assert!(ServerConfig::from_json_file(dir.path().join("missing.json")).is_err());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_sessions() {
    let (dispatcher, stats) = common::dispatcher(ServerConfig::default());

    let clients = (0..16).map(|i| {
        let dispatcher = dispatcher.clone();
        async move {
            let mut conn = connect(&dispatcher, common::LOCATOR).await;
            let stmt = conn.create_statement().await?;
            let count = stmt.execute_update(&format!("COUNT {}", i)).await?;
            conn.close().await?;
            Ok::<u64, rustmemodb_remote::ProxyError>(count)
        }
    });
    let counts: Vec<u64> = futures::future::try_join_all(clients).await.unwrap();

    assert_eq!(counts, (0..16).collect::<Vec<u64>>());
    assert_eq!(stats.opened(), 16);
    assert_eq!(stats.closed(), 16);
    assert_eq!(dispatcher.session_count(), 0);
    dispatcher.shutdown().await;
}

/// Cursor pagination tests
///
/// Server-side packet production and background prefetch.
/// Run with: cargo test --test pagination_tests

mod common;

use common::{ScriptStats, ScriptedResultSet};
use rustmemodb_remote::core::{ErrorKind, Value};
use rustmemodb_remote::pagination::{CursorHolder, HolderPhase, PaginationSettings};
use rustmemodb_remote::worker::{Submission, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};

fn settings(packet_size: usize) -> PaginationSettings {
    PaginationSettings {
        packet_size,
        wait_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_seven_rows_in_packets_of_three() {
    let stats = Arc::new(ScriptStats::default());
    let (columns, first, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(7, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();

    assert_eq!(columns.len(), 2);
    assert_eq!(first.row_count(), 3);
    assert!(!first.last_part());
    assert_eq!(first.value(0, 0), Some(Value::Integer(0)));

    let holder = holder.expect("rows remain after the first packet");
    let second = holder.next_packet().await.unwrap();
    assert_eq!(second.row_count(), 3);
    assert!(!second.last_part());
    assert_eq!(second.value(0, 0), Some(Value::Integer(3)));

    let third = holder.next_packet().await.unwrap();
    assert_eq!(third.row_count(), 1);
    assert!(third.last_part());
    assert_eq!(third.value(0, 1), Some(Value::Text("row-6".into())));

    assert_eq!(holder.phase(), HolderPhase::Closed);
    assert_eq!(holder.stats().packets_delivered, 3);
    assert_eq!(holder.stats().rows_delivered, 7);
    assert_eq!(stats.rows_served(), 7);
    assert_eq!(stats.result_sets_closed(), 1);
}

#[tokio::test]
async fn test_exact_multiple_flags_the_packet_with_the_final_row() {
    let stats = Arc::new(ScriptStats::default());
    let (_, first, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(6, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();

    assert!(!first.last_part());
    let second = holder.unwrap().next_packet().await.unwrap();
    assert_eq!(second.row_count(), 3);
    assert!(second.last_part());
}

#[tokio::test]
async fn test_small_result_needs_no_holder() {
    let stats = Arc::new(ScriptStats::default());
    let (_, first, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(2, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();

    assert!(holder.is_none());
    assert_eq!(first.row_count(), 2);
    assert!(first.last_part());
    assert_eq!(stats.result_sets_closed(), 1);
}

#[tokio::test]
async fn test_empty_result_is_one_empty_last_packet() {
    let stats = Arc::new(ScriptStats::default());
    let (_, first, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(0, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();

    assert!(holder.is_none());
    assert!(first.is_empty());
    assert!(first.last_part());
}

#[tokio::test]
async fn test_population_error_surfaces_on_next_request() {
    let stats = Arc::new(ScriptStats::default());
    let (_, first, holder) = CursorHolder::open(
        ScriptedResultSet::failing(5, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();
    assert_eq!(first.row_count(), 3);

    let holder = holder.unwrap();
    let err = holder.next_packet().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("unreadable"));
    assert_eq!(holder.phase(), HolderPhase::Closed);

    let err = holder.next_packet().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Pagination);
    assert_eq!(stats.result_sets_closed(), 1);
}

#[tokio::test]
async fn test_failure_in_first_packet_is_returned_by_open() {
    let stats = Arc::new(ScriptStats::default());
    let result = CursorHolder::open(
        ScriptedResultSet::failing(1, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(stats.result_sets_closed(), 1);
}

#[tokio::test]
async fn test_saturated_pool_populates_inline() {
    let workers = WorkerPool::new(1);
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let blocker = match workers.try_spawn(async move {
        let _ = release_rx.await;
    }) {
        Submission::Spawned(handle) => handle,
        Submission::Saturated(_) => panic!("first task must get the only permit"),
    };

    let stats = Arc::new(ScriptStats::default());
    let (_, _, holder) = CursorHolder::open(ScriptedResultSet::boxed(10, &stats), &settings(3), workers.clone())
        .await
        .unwrap();

    // Ran on the caller, so the packet is already buffered.
    let holder = holder.unwrap();
    assert_eq!(holder.phase(), HolderPhase::Ready);
    assert_eq!(workers.stats().inline, 1);

    release_tx.send(()).unwrap();
    blocker.await.unwrap();

    let second = holder.next_packet().await.unwrap();
    assert_eq!(second.row_count(), 3);
}

#[tokio::test]
async fn test_prefetch_runs_ahead_of_requests() {
    let stats = Arc::new(ScriptStats::default());
    let (_, _, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(9, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();
    let holder = holder.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while holder.phase() != HolderPhase::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("background population finishes");

    // First packet, second packet, plus the lookahead row.
    assert_eq!(stats.rows_served(), 7);
}

#[tokio::test]
async fn test_closed_holder_rejects_requests() {
    let stats = Arc::new(ScriptStats::default());
    let (_, _, holder) = CursorHolder::open(
        ScriptedResultSet::boxed(20, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();
    let holder = holder.unwrap();

    holder.close().await;
    assert_eq!(holder.phase(), HolderPhase::Closed);
    let err = holder.next_packet().await.unwrap_err();
    assert!(err.to_string().contains("closed"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.result_sets_closed() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("source released after close");
}

#[tokio::test]
async fn test_close_during_population_releases_the_source() {
    let stats = Arc::new(ScriptStats::default());
    let gate = Arc::new(Semaphore::new(0));
    // Rows 0..3 plus the lookahead row are read inline; row 4 blocks.
    let (_, _, holder) = CursorHolder::open(
        ScriptedResultSet::gated(20, 4, &gate, &stats),
        &settings(3),
        WorkerPool::new(4),
    )
    .await
    .unwrap();
    let holder = holder.unwrap();
    assert_eq!(holder.phase(), HolderPhase::Populating);
    tokio::time::sleep(Duration::from_millis(20)).await;

    holder.close().await;
    assert_eq!(holder.phase(), HolderPhase::Closed);
    assert_eq!(stats.result_sets_closed(), 0);

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.result_sets_closed() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("population released the source after close");
    assert!(holder.next_packet().await.is_err());
    assert_eq!(stats.result_sets_closed(), 1);
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-backed SQLite tests covering behavior that needs more than one connection.

use std::sync::Arc;
use std::time::Duration;

use shardstore::codec::{DataBlob, EncodingType};
use shardstore::config::{BackendKind, StoreConfig};
use shardstore::persistence::{self, ExecutionRecord, ShardStore, SqliteStore, TaskQueue, TaskRecord};
use shardstore::retry::{RetryPolicy, retry_transient};
use tempfile::TempDir;

fn config_for(dir: &TempDir, lock_timeout: Duration) -> StoreConfig {
    let path = dir.path().join("shards.db");
    let mut config = StoreConfig::new(format!("sqlite:{}", path.display())).unwrap();
    config.lock_timeout = lock_timeout;
    config.max_connections = 4;
    config
}

fn execution(next_event_id: i64) -> ExecutionRecord {
    ExecutionRecord {
        shard_id: 1,
        domain_id: "domain".to_string(),
        workflow_id: "wf".to_string(),
        run_id: "run-1".to_string(),
        next_event_id,
        last_write_version: 1,
        data: DataBlob::new(b"{}".to_vec(), EncodingType::Json),
    }
}

async fn seeded_store(dir: &TempDir, lock_timeout: Duration) -> SqliteStore {
    let store = SqliteStore::connect(&config_for(dir, lock_timeout))
        .await
        .unwrap();
    let mut tx = store.begin(1).await.unwrap();
    tx.insert_execution(&execution(1)).await.unwrap();
    tx.commit().await.unwrap();
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_contended_write_lock_is_lock_contention() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, Duration::from_millis(100)).await;
    let key = execution(1).key();

    let mut holder = store.begin(1).await.unwrap();
    holder.write_lock_execution(&key).await.unwrap();

    let mut contender = store.begin(1).await.unwrap();
    let err = contender.write_lock_execution(&key).await.unwrap_err();
    assert_eq!(err.error_code(), "LOCK_CONTENTION");
    assert!(err.is_retryable());
    contender.rollback().await.unwrap();

    holder.commit().await.unwrap();

    let mut tx = store.begin(1).await.unwrap();
    assert_eq!(tx.write_lock_execution(&key).await.unwrap(), 1);
    tx.commit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_read_lock_excludes_writer() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, Duration::from_millis(100)).await;
    let key = execution(1).key();

    let mut reader = store.begin(1).await.unwrap();
    assert_eq!(reader.read_lock_execution(&key).await.unwrap(), 1);

    let mut writer = store.begin(1).await.unwrap();
    let err = writer.write_lock_execution(&key).await.unwrap_err();
    assert_eq!(err.error_code(), "LOCK_CONTENTION");
    writer.rollback().await.unwrap();

    // The reader still sees the value it locked.
    assert_eq!(reader.read_lock_execution(&key).await.unwrap(), 1);
    reader.commit().await.unwrap();
    assert_eq!(store.get_execution(&key).await.unwrap().next_event_id, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_write_lock_excludes_reader() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, Duration::from_millis(100)).await;
    let key = execution(1).key();

    let mut writer = store.begin(1).await.unwrap();
    writer.write_lock_execution(&key).await.unwrap();

    let mut reader = store.begin(1).await.unwrap();
    let err = reader.read_lock_execution(&key).await.unwrap_err();
    assert_eq!(err.error_code(), "LOCK_CONTENTION");
    reader.rollback().await.unwrap();

    writer.update_execution(&execution(3)).await.unwrap();
    writer.commit().await.unwrap();

    let mut reader = store.begin(1).await.unwrap();
    assert_eq!(reader.read_lock_execution(&key).await.unwrap(), 3);
    reader.commit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_transient_outlasts_lock_holder() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(seeded_store(&dir, Duration::from_millis(50)).await);
    let key = execution(1).key();

    let mut holder = store.begin(1).await.unwrap();
    holder.write_lock_execution(&key).await.unwrap();
    holder.update_execution(&execution(4)).await.unwrap();

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        holder.commit().await
    });

    let policy = RetryPolicy {
        max_retries: 20,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
    };
    let observed = retry_transient("advance_workflow", &policy, || {
        let store = store.clone();
        let key = key.clone();
        async move {
            let mut tx = store.begin(1).await?;
            let next_event_id = tx.write_lock_execution(&key).await?;
            tx.update_execution(&execution(next_event_id + 1)).await?;
            tx.commit().await?;
            Ok(next_event_id)
        }
    })
    .await
    .unwrap();

    release.await.unwrap().unwrap();
    assert_eq!(observed, 4);
    assert_eq!(store.get_execution(&key).await.unwrap().next_event_id, 5);
}

#[tokio::test]
async fn test_connect_dispatches_on_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, Duration::from_millis(500));

    let store = persistence::connect(&config).await.unwrap();
    assert_eq!(store.backend(), BackendKind::Sqlite);
    store.health_check().await.unwrap();

    let task = TaskRecord::new(1, 10, DataBlob::new(b"t".to_vec(), EncodingType::Json));
    let mut tx = store.begin(1).await.unwrap();
    tx.insert_tasks(&TaskQueue::Replication, std::slice::from_ref(&task))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    drop(store);

    let reopened = persistence::connect(&config).await.unwrap();
    assert_eq!(
        reopened.count_tasks(&TaskQueue::Replication, 1).await.unwrap(),
        1
    );
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for shardstore.
//!
//! [`ShardStore`] is the pool-level handle: snapshot reads, transaction creation and
//! single-statement queue maintenance. [`ShardTransaction`] is one open database
//! transaction bound to a shard; every write and every lock goes through it, and the
//! locks it takes are released when it commits, rolls back or is dropped.

pub mod postgres;
pub(crate) mod sql;
pub mod sqlite;

pub use self::postgres::{PostgresStore, PostgresTransaction};
pub use self::sqlite::{SqliteStore, SqliteTransaction};

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::codec::{CloseStatus, DataBlob, WorkflowState};
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Result, StoreError};

use self::sql::QueueTable;

// ============================================================================
// Keys
// ============================================================================

/// Identifies one run of a workflow inside a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    /// Owning shard.
    pub shard_id: i32,
    /// Domain (namespace) id.
    pub domain_id: String,
    /// Caller-chosen workflow id.
    pub workflow_id: String,
    /// Run id, unique per workflow id.
    pub run_id: String,
}

impl ExecutionKey {
    /// Build a key from its parts.
    pub fn new(
        shard_id: i32,
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            shard_id,
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// The workflow this run belongs to.
    pub fn workflow(&self) -> WorkflowKey {
        WorkflowKey {
            shard_id: self.shard_id,
            domain_id: self.domain_id.clone(),
            workflow_id: self.workflow_id.clone(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard={} domain={} workflow={} run={}",
            self.shard_id, self.domain_id, self.workflow_id, self.run_id
        )
    }
}

/// Identifies a workflow id inside a shard, independent of run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowKey {
    /// Owning shard.
    pub shard_id: i32,
    /// Domain (namespace) id.
    pub domain_id: String,
    /// Caller-chosen workflow id.
    pub workflow_id: String,
}

impl WorkflowKey {
    /// Build a key from its parts.
    pub fn new(shard_id: i32, domain_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            shard_id,
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
        }
    }

    /// Key of a specific run of this workflow.
    pub fn run(&self, run_id: impl Into<String>) -> ExecutionKey {
        ExecutionKey {
            shard_id: self.shard_id,
            domain_id: self.domain_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard={} domain={} workflow={}",
            self.shard_id, self.domain_id, self.workflow_id
        )
    }
}

// ============================================================================
// Records
// ============================================================================

/// Mutable state of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Owning shard.
    pub shard_id: i32,
    /// Domain (namespace) id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Id the next history event will get. Never decreases.
    pub next_event_id: i64,
    /// Failover version of the last write.
    pub last_write_version: i64,
    /// Serialized execution state.
    pub data: DataBlob,
}

impl ExecutionRecord {
    /// Primary key of this row.
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(
            self.shard_id,
            self.domain_id.clone(),
            self.workflow_id.clone(),
            self.run_id.clone(),
        )
    }
}

/// Pointer from a workflow id to its current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentExecutionRecord {
    /// Owning shard.
    pub shard_id: i32,
    /// Domain (namespace) id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run currently designated for this workflow id.
    pub run_id: String,
    /// Request id that created the run, for start deduplication.
    pub create_request_id: String,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// Close status; [`CloseStatus::None`] while running.
    pub close_status: CloseStatus,
    /// Failover version the run started at.
    pub start_version: i64,
    /// Failover version of the last write.
    pub last_write_version: i64,
}

impl CurrentExecutionRecord {
    /// Primary key of this row.
    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(
            self.shard_id,
            self.domain_id.clone(),
            self.workflow_id.clone(),
        )
    }

    /// Key of the run this pointer names.
    pub fn run_key(&self) -> ExecutionKey {
        self.key().run(self.run_id.clone())
    }

    /// Whether the pointed-at run is still open.
    pub fn is_running(&self) -> bool {
        self.close_status == CloseStatus::None
    }
}

// ============================================================================
// Task Queues
// ============================================================================

/// Id-ordered task queue selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskQueue {
    /// Work for other services (matching, history of other shards).
    Transfer,
    /// Outbound replication to other clusters.
    Replication,
    /// Work addressed to one remote cluster.
    CrossCluster {
        /// Destination cluster name.
        target_cluster: String,
    },
    /// Replication tasks a remote cluster rejected.
    ReplicationDlq {
        /// Cluster the failed tasks came from.
        source_cluster: String,
    },
}

impl TaskQueue {
    /// Cross-cluster queue for `target_cluster`.
    pub fn cross_cluster(target_cluster: impl Into<String>) -> Self {
        Self::CrossCluster {
            target_cluster: target_cluster.into(),
        }
    }

    /// Replication DLQ for `source_cluster`.
    pub fn replication_dlq(source_cluster: impl Into<String>) -> Self {
        Self::ReplicationDlq {
            source_cluster: source_cluster.into(),
        }
    }

    /// Table name, for logs.
    pub fn name(&self) -> &'static str {
        self.table().name
    }

    pub(crate) fn table(&self) -> QueueTable {
        match self {
            Self::Transfer => sql::TRANSFER_TASKS,
            Self::Replication => sql::REPLICATION_TASKS,
            Self::CrossCluster { .. } => sql::CROSS_CLUSTER_TASKS,
            Self::ReplicationDlq { .. } => sql::REPLICATION_TASKS_DLQ,
        }
    }

    pub(crate) fn scope(&self) -> Option<&str> {
        match self {
            Self::Transfer | Self::Replication => None,
            Self::CrossCluster { target_cluster } => Some(target_cluster),
            Self::ReplicationDlq { source_cluster } => Some(source_cluster),
        }
    }
}

/// One id-ordered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Owning shard.
    pub shard_id: i32,
    /// Shard-local sequence number.
    pub task_id: i64,
    /// Serialized task.
    pub data: DataBlob,
}

impl TaskRecord {
    /// Build a task row.
    pub fn new(shard_id: i32, task_id: i64, data: DataBlob) -> Self {
        Self {
            shard_id,
            task_id,
            data,
        }
    }
}

/// Half-open id range `(min_task_id, max_task_id]` within a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRange {
    /// Shard to scan.
    pub shard_id: i32,
    /// Exclusive lower bound.
    pub min_task_id: i64,
    /// Inclusive upper bound.
    pub max_task_id: i64,
}

impl TaskRange {
    /// Build a range.
    pub fn new(shard_id: i32, min_task_id: i64, max_task_id: i64) -> Self {
        Self {
            shard_id,
            min_task_id,
            max_task_id,
        }
    }

    /// Continue after the last row of a page.
    pub fn after(self, last_task_id: i64) -> Self {
        Self {
            min_task_id: last_task_id,
            ..self
        }
    }
}

/// Position in the timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerTaskKey {
    /// When the timer fires.
    pub visibility_timestamp: DateTime<Utc>,
    /// Tie-breaker among timers with the same timestamp.
    pub task_id: i64,
}

impl TimerTaskKey {
    /// Build a key.
    pub fn new(visibility_timestamp: DateTime<Utc>, task_id: i64) -> Self {
        Self {
            visibility_timestamp,
            task_id,
        }
    }
}

/// One timer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTaskRecord {
    /// Owning shard.
    pub shard_id: i32,
    /// When the timer fires. Stored at microsecond resolution.
    pub visibility_timestamp: DateTime<Utc>,
    /// Tie-breaker among timers with the same timestamp.
    pub task_id: i64,
    /// Serialized task.
    pub data: DataBlob,
}

impl TimerTaskRecord {
    /// Build a timer row.
    pub fn new(
        shard_id: i32,
        visibility_timestamp: DateTime<Utc>,
        task_id: i64,
        data: DataBlob,
    ) -> Self {
        Self {
            shard_id,
            visibility_timestamp,
            task_id,
            data,
        }
    }

    /// Queue position of this timer.
    pub fn key(&self) -> TimerTaskKey {
        TimerTaskKey::new(self.visibility_timestamp, self.task_id)
    }
}

/// Timer scan window: strictly after `min`, up to and including `max_visibility_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRange {
    /// Shard to scan.
    pub shard_id: i32,
    /// Exclusive lower bound.
    pub min: TimerTaskKey,
    /// Inclusive upper bound on the timestamp.
    pub max_visibility_timestamp: DateTime<Utc>,
}

impl TimerRange {
    /// Build a range.
    pub fn new(shard_id: i32, min: TimerTaskKey, max_visibility_timestamp: DateTime<Utc>) -> Self {
        Self {
            shard_id,
            min,
            max_visibility_timestamp,
        }
    }
}

// ============================================================================
// Argument checks
// ============================================================================

pub(crate) fn ensure_shard(expected: i32, actual: i32) -> Result<()> {
    if expected != actual {
        return Err(StoreError::ShardMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn page_limit(page_size: u32) -> Result<i64> {
    if page_size == 0 {
        return Err(StoreError::validation(
            "page_size",
            "must be greater than zero",
        ));
    }
    Ok(i64::from(page_size))
}

/// Rows per statement so a multi-row insert stays under the bind parameter cap.
pub(crate) fn insert_chunk_rows(max_params: usize, columns: usize) -> usize {
    (max_params / columns).max(1)
}

// ============================================================================
// Store Traits
// ============================================================================

/// Pool-level handle to one backend.
///
/// Snapshot reads run outside any transaction. The provided maintenance
/// operations each open, use and commit a transaction of their own.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Engine behind this store.
    fn backend(&self) -> BackendKind;

    /// Open a transaction owned by `shard_id`.
    async fn begin(&self, shard_id: i32) -> Result<Box<dyn ShardTransaction>>;

    /// Round-trip a trivial statement.
    async fn health_check(&self) -> Result<()>;

    /// Read one run.
    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord>;

    /// Page through runs in workflow id order, starting after `after_workflow_id`.
    ///
    /// Several runs of one workflow id may straddle a page boundary; the next page
    /// starts strictly after the last workflow id returned.
    async fn list_executions(
        &self,
        shard_id: i32,
        after_workflow_id: &str,
        page_size: u32,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Read the current-run pointer without locking it.
    async fn get_current_execution(&self, key: &WorkflowKey) -> Result<CurrentExecutionRecord>;

    /// Buffered events of a run, in append order.
    async fn get_buffered_events(&self, key: &ExecutionKey) -> Result<Vec<DataBlob>>;

    /// Tasks with ids in `range`, ascending, at most `page_size`.
    async fn select_tasks(
        &self,
        queue: &TaskQueue,
        range: &TaskRange,
        page_size: u32,
    ) -> Result<Vec<TaskRecord>>;

    /// Timers in `range` ordered by `(visibility_timestamp, task_id)`, at most `page_size`.
    async fn select_timer_tasks(
        &self,
        range: &TimerRange,
        page_size: u32,
    ) -> Result<Vec<TimerTaskRecord>>;

    /// Number of rows in one queue for one shard.
    async fn count_tasks(&self, queue: &TaskQueue, shard_id: i32) -> Result<i64>;

    /// Delete one task; missing ids are ignored.
    async fn delete_task(&self, queue: &TaskQueue, shard_id: i32, task_id: i64) -> Result<()> {
        let mut tx = self.begin(shard_id).await?;
        tx.delete_task(queue, shard_id, task_id).await?;
        tx.commit().await
    }

    /// Delete tasks in `range`, or only the lowest `batch_size` of them.
    async fn range_delete_tasks(
        &self,
        queue: &TaskQueue,
        range: &TaskRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64> {
        let mut tx = self.begin(range.shard_id).await?;
        let deleted = tx.range_delete_tasks(queue, range, batch_size).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Delete one timer; missing timers are ignored.
    async fn delete_timer_task(&self, shard_id: i32, key: &TimerTaskKey) -> Result<()> {
        let mut tx = self.begin(shard_id).await?;
        tx.delete_timer_task(shard_id, key).await?;
        tx.commit().await
    }

    /// Delete timers in `range`, or only the first `batch_size` of them.
    async fn range_delete_timer_tasks(
        &self,
        range: &TimerRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64> {
        let mut tx = self.begin(range.shard_id).await?;
        let deleted = tx.range_delete_timer_tasks(range, batch_size).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Drain `range` in bounded batches, one transaction per batch.
    ///
    /// Stops when a batch deletes fewer than `batch_size` rows. Returns the total.
    async fn purge_tasks(
        &self,
        queue: &TaskQueue,
        range: &TaskRange,
        batch_size: NonZeroU32,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut batches = 0u32;
        loop {
            let deleted = self.range_delete_tasks(queue, range, Some(batch_size)).await?;
            total += deleted;
            batches += 1;
            if deleted < u64::from(batch_size.get()) {
                break;
            }
        }

        info!(
            queue = queue.name(),
            shard_id = range.shard_id,
            min_task_id = range.min_task_id,
            max_task_id = range.max_task_id,
            batches,
            deleted = total,
            "Purged task range"
        );

        Ok(total)
    }

    // ------------------------------------------------------------------------
    // Replication DLQ
    // ------------------------------------------------------------------------

    /// Park a rejected replication task.
    async fn insert_dlq_task(&self, source_cluster: &str, task: &TaskRecord) -> Result<()> {
        let queue = TaskQueue::replication_dlq(source_cluster);
        let mut tx = self.begin(task.shard_id).await?;
        tx.insert_tasks(&queue, std::slice::from_ref(task)).await?;
        tx.commit().await
    }

    /// DLQ messages for `(source_cluster, shard)` with ids in `range`.
    async fn select_dlq_tasks(
        &self,
        source_cluster: &str,
        range: &TaskRange,
        page_size: u32,
    ) -> Result<Vec<TaskRecord>> {
        self.select_tasks(&TaskQueue::replication_dlq(source_cluster), range, page_size)
            .await
    }

    /// Number of DLQ messages for `(source_cluster, shard)`.
    async fn get_dlq_size(&self, source_cluster: &str, shard_id: i32) -> Result<i64> {
        self.count_tasks(&TaskQueue::replication_dlq(source_cluster), shard_id)
            .await
    }

    /// Remove one DLQ message; missing ids are ignored.
    async fn delete_dlq_message(
        &self,
        source_cluster: &str,
        shard_id: i32,
        task_id: i64,
    ) -> Result<()> {
        self.delete_task(&TaskQueue::replication_dlq(source_cluster), shard_id, task_id)
            .await
    }

    /// Remove DLQ messages in `range`, optionally bounded to `batch_size` rows.
    async fn range_delete_dlq_messages(
        &self,
        source_cluster: &str,
        range: &TaskRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64> {
        self.range_delete_tasks(&TaskQueue::replication_dlq(source_cluster), range, batch_size)
            .await
    }
}

/// One open transaction bound to a shard.
///
/// Every record or key passed in must belong to the transaction's shard, otherwise
/// the call fails with [`StoreError::ShardMismatch`] before touching the database.
/// Dropping the handle without calling [`commit`](Self::commit) rolls back.
#[async_trait]
pub trait ShardTransaction: Send {
    /// Shard this transaction was opened for.
    fn shard_id(&self) -> i32;

    // ------------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------------

    /// Insert a run. An existing key fails with [`StoreError::Conflict`].
    async fn insert_execution(&mut self, record: &ExecutionRecord) -> Result<()>;

    /// Overwrite the mutable columns of a run.
    ///
    /// Fails with [`StoreError::NotFound`] for a missing run and with
    /// [`StoreError::Conflict`] if `next_event_id` would move backwards.
    async fn update_execution(&mut self, record: &ExecutionRecord) -> Result<()>;

    /// Read a run inside the transaction.
    async fn get_execution(&mut self, key: &ExecutionKey) -> Result<ExecutionRecord>;

    /// Delete a run; missing runs are ignored.
    async fn delete_execution(&mut self, key: &ExecutionKey) -> Result<()>;

    /// Shared lock on a run. Returns its `next_event_id`.
    async fn read_lock_execution(&mut self, key: &ExecutionKey) -> Result<i64>;

    /// Exclusive lock on a run. Returns its `next_event_id`.
    async fn write_lock_execution(&mut self, key: &ExecutionKey) -> Result<i64>;

    // ------------------------------------------------------------------------
    // Current executions
    // ------------------------------------------------------------------------

    /// Create the current-run pointer. An existing pointer fails with [`StoreError::Conflict`].
    ///
    /// The named run must exist; otherwise [`StoreError::NotFound`]. This and the
    /// other pointer writes lock that run for the rest of the transaction.
    async fn insert_current_execution(&mut self, record: &CurrentExecutionRecord) -> Result<()>;

    /// Overwrite the pointer unconditionally. The named run must exist.
    async fn update_current_execution(&mut self, record: &CurrentExecutionRecord) -> Result<()>;

    /// Overwrite the pointer only while it still names `expected_run_id`. The newly
    /// named run must exist.
    async fn compare_and_swap_current_execution(
        &mut self,
        record: &CurrentExecutionRecord,
        expected_run_id: &str,
    ) -> Result<()>;

    /// Read the pointer inside the transaction.
    async fn get_current_execution(&mut self, key: &WorkflowKey) -> Result<CurrentExecutionRecord>;

    /// Delete the pointer if it still names `run_id`.
    async fn delete_current_execution(&mut self, key: &WorkflowKey, run_id: &str) -> Result<()>;

    /// Exclusive lock on the pointer.
    async fn lock_current_execution(&mut self, key: &WorkflowKey) -> Result<CurrentExecutionRecord>;

    /// Exclusive lock on the pointer joined with its run.
    ///
    /// `last_write_version` in the result is the run's, not the pointer's.
    async fn lock_current_execution_join_execution(
        &mut self,
        key: &WorkflowKey,
    ) -> Result<Vec<CurrentExecutionRecord>>;

    /// [`lock_current_execution_join_execution`](Self::lock_current_execution_join_execution)
    /// expecting exactly one row.
    async fn lock_current_execution_with_run(
        &mut self,
        key: &WorkflowKey,
    ) -> Result<CurrentExecutionRecord> {
        let mut rows = self.lock_current_execution_join_execution(key).await?;
        match rows.len() {
            0 => Err(StoreError::not_found("current execution", key)),
            1 => Ok(rows.remove(0)),
            n => Err(StoreError::conflict(
                "lock_current_execution_with_run",
                format!("{} rows matched {}", n, key),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Buffered events
    // ------------------------------------------------------------------------

    /// Append events to a run's buffer.
    async fn insert_buffered_events(&mut self, key: &ExecutionKey, events: &[DataBlob]) -> Result<()>;

    /// Read a run's buffer in append order.
    async fn get_buffered_events(&mut self, key: &ExecutionKey) -> Result<Vec<DataBlob>>;

    /// Clear a run's buffer.
    async fn delete_buffered_events(&mut self, key: &ExecutionKey) -> Result<()>;

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Insert a batch of tasks. All rows become visible on commit or none do.
    async fn insert_tasks(&mut self, queue: &TaskQueue, tasks: &[TaskRecord]) -> Result<()>;

    /// Tasks with ids in `range`, ascending, at most `page_size`.
    async fn select_tasks(
        &mut self,
        queue: &TaskQueue,
        range: &TaskRange,
        page_size: u32,
    ) -> Result<Vec<TaskRecord>>;

    /// Delete one task; missing ids are ignored.
    async fn delete_task(&mut self, queue: &TaskQueue, shard_id: i32, task_id: i64) -> Result<()>;

    /// Delete tasks in `range`, or only the lowest `batch_size` of them.
    async fn range_delete_tasks(
        &mut self,
        queue: &TaskQueue,
        range: &TaskRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64>;

    /// Insert a batch of timers.
    async fn insert_timer_tasks(&mut self, timers: &[TimerTaskRecord]) -> Result<()>;

    /// Timers in `range`, at most `page_size`.
    async fn select_timer_tasks(
        &mut self,
        range: &TimerRange,
        page_size: u32,
    ) -> Result<Vec<TimerTaskRecord>>;

    /// Delete one timer; missing timers are ignored.
    async fn delete_timer_task(&mut self, shard_id: i32, key: &TimerTaskKey) -> Result<()>;

    /// Delete timers in `range`, or only the first `batch_size` of them.
    async fn range_delete_timer_tasks(
        &mut self,
        range: &TimerRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64>;

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Make every write visible and release all locks.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write and release all locks.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Connect to the backend named by `config.database_url`.
///
/// Applies migrations first when `config.run_migrations` is set.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ShardStore>> {
    let store: Arc<dyn ShardStore> = match config.backend {
        BackendKind::Postgres => Arc::new(PostgresStore::connect(config).await?),
        BackendKind::Sqlite => Arc::new(SqliteStore::connect(config).await?),
    };

    info!(
        backend = ?config.backend,
        max_connections = config.max_connections,
        "Connected to shard store"
    );

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_display() {
        let key = ExecutionKey::new(3, "dom", "wf-1", "run-a");
        assert_eq!(key.to_string(), "shard=3 domain=dom workflow=wf-1 run=run-a");
        assert_eq!(key.workflow().to_string(), "shard=3 domain=dom workflow=wf-1");
        assert_eq!(key.workflow().run("run-a"), key);
    }

    #[test]
    fn test_queue_tables() {
        assert_eq!(TaskQueue::Transfer.name(), "transfer_tasks");
        assert_eq!(TaskQueue::Replication.scope(), None);
        assert_eq!(TaskQueue::cross_cluster("west").scope(), Some("west"));
        assert_eq!(
            TaskQueue::replication_dlq("east").name(),
            "replication_tasks_dlq"
        );
    }

    #[test]
    fn test_page_limit_rejects_zero() {
        assert_eq!(page_limit(25).unwrap(), 25);
        let err = page_limit(0).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_ensure_shard() {
        assert!(ensure_shard(7, 7).is_ok());
        assert!(matches!(
            ensure_shard(7, 8),
            Err(StoreError::ShardMismatch {
                expected: 7,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_insert_chunk_rows() {
        assert_eq!(insert_chunk_rows(32_766, 5), 6553);
        assert_eq!(insert_chunk_rows(3, 5), 1);
    }

    #[test]
    fn test_task_range_after() {
        let range = TaskRange::new(1, 0, 500).after(120);
        assert_eq!(range.min_task_id, 120);
        assert_eq!(range.max_task_id, 500);
    }

    #[test]
    fn test_current_execution_is_running() {
        let mut record = CurrentExecutionRecord {
            shard_id: 1,
            domain_id: "d".to_string(),
            workflow_id: "w".to_string(),
            run_id: "r".to_string(),
            create_request_id: "req".to_string(),
            state: WorkflowState::Running,
            close_status: CloseStatus::None,
            start_version: 1,
            last_write_version: 1,
        };
        assert!(record.is_running());

        // Liveness follows the close status alone.
        record.state = WorkflowState::Zombie;
        assert!(record.is_running());

        record.state = WorkflowState::Completed;
        record.close_status = CloseStatus::ContinuedAsNew;
        assert!(!record.is_running());

        assert_eq!(record.run_key(), ExecutionKey::new(1, "d", "w", "r"));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed shard store.
//!
//! SQLite locks the whole database rather than rows. Both read and write locks are
//! a no-op `UPDATE ... RETURNING` on the target row, which takes the RESERVED lock
//! and excludes every other lock holder until the transaction ends. In WAL mode a
//! SHARED lock would not keep a writer out, so read locks are exclusive here.
//! Waiting is bounded by `busy_timeout`; an expired wait surfaces as
//! [`StoreError::LockContention`].

use std::num::NonZeroU32;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::codec::{
    BlobRow, CurrentExecutionRow, DataBlob, ExecutionRow, TaskRow, from_sqlite_timestamp,
    to_sqlite_timestamp,
};
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Result, StoreError, db_err};
use crate::migrations;

use super::sql::{self, Dialect};
use super::{
    CurrentExecutionRecord, ExecutionKey, ExecutionRecord, ShardStore, ShardTransaction,
    TaskQueue, TaskRange, TaskRecord, TimerRange, TimerTaskKey, TimerTaskRecord, WorkflowKey,
    ensure_shard, insert_chunk_rows, page_limit,
};

const DIALECT: Dialect = Dialect::Sqlite;

fn stmt(sql: &str) -> String {
    DIALECT.render(sql).into_owned()
}

/// SQLite-backed shard store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool configured from `config`.
    ///
    /// In-memory databases live and die with their connection, so they get a
    /// single connection that is never recycled.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let in_memory = config.database_url.contains(":memory:")
            || config.database_url.contains("mode=memory");

        let mut options = config
            .database_url
            .parse::<SqliteConnectOptions>()
            .map_err(db_err("connect"))?
            .create_if_missing(true)
            .busy_timeout(config.lock_timeout);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_err("connect"))?;

        if config.run_migrations {
            migrations::run_sqlite(&pool).await?;
        }

        Ok(Self::new(pool))
    }

    /// Create and initialize a SQLite store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects through [`SqliteStore::connect`] with default settings
    ///   (WAL, `busy_timeout`, five connections)
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/shards.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let mut config = StoreConfig::new(format!("sqlite:{}", path.to_string_lossy()))
            .map_err(|e| StoreError::validation("path", e.to_string()))?;
        config.max_connections = 5;
        config.run_migrations = true;

        let store = Self::connect(&config).await?;

        info!(path = %path.display(), "Opened SQLite shard store");

        Ok(store)
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open SQLite transaction bound to one shard.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    shard_id: i32,
}

/// Timer row; SQLite keeps the timestamp as integer microseconds.
#[derive(sqlx::FromRow)]
struct TimerRow {
    visibility_timestamp: i64,
    task_id: i64,
    data: Vec<u8>,
    data_encoding: String,
}

impl TimerRow {
    fn into_record(self, shard_id: i32) -> Result<TimerTaskRecord> {
        Ok(TimerTaskRecord {
            shard_id,
            visibility_timestamp: from_sqlite_timestamp(self.visibility_timestamp)?,
            task_id: self.task_id,
            data: DataBlob::from_columns(self.data, &self.data_encoding)?,
        })
    }
}

// ============================================================================
// Execution Operations
// ============================================================================

async fn insert_execution(conn: &mut SqliteConnection, record: &ExecutionRecord) -> Result<()> {
    sqlx::query(&stmt(sql::INSERT_EXECUTION))
        .bind(record.shard_id)
        .bind(&record.domain_id)
        .bind(&record.workflow_id)
        .bind(&record.run_id)
        .bind(record.next_event_id)
        .bind(record.last_write_version)
        .bind(&record.data.data)
        .bind(record.data.encoding.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_err("insert_execution"))?;

    Ok(())
}

async fn update_execution(conn: &mut SqliteConnection, record: &ExecutionRecord) -> Result<()> {
    let result = sqlx::query(&stmt(sql::UPDATE_EXECUTION))
        .bind(record.shard_id)
        .bind(&record.domain_id)
        .bind(&record.workflow_id)
        .bind(&record.run_id)
        .bind(record.next_event_id)
        .bind(record.last_write_version)
        .bind(&record.data.data)
        .bind(record.data.encoding.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_err("update_execution"))?;

    if result.rows_affected() == 0 {
        let key = record.key();
        let stored: Option<i64> = sqlx::query_scalar(&stmt(sql::GET_NEXT_EVENT_ID))
            .bind(key.shard_id)
            .bind(&key.domain_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err("update_execution"))?;

        return Err(match stored {
            None => StoreError::not_found("execution", &key),
            Some(stored) => {
                warn!(
                    execution = %key,
                    stored_next_event_id = stored,
                    next_event_id = record.next_event_id,
                    "Rejected next_event_id regression"
                );
                StoreError::conflict(
                    "update_execution",
                    format!(
                        "next_event_id would move backwards from {} to {}",
                        stored, record.next_event_id
                    ),
                )
            }
        });
    }

    Ok(())
}

async fn get_execution(conn: &mut SqliteConnection, key: &ExecutionKey) -> Result<ExecutionRecord> {
    let row = sqlx::query_as::<_, ExecutionRow>(&stmt(sql::GET_EXECUTION))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("get_execution"))?
        .ok_or_else(|| StoreError::not_found("execution", key))?;

    ExecutionRecord::try_from(row)
}

async fn list_executions(
    conn: &mut SqliteConnection,
    shard_id: i32,
    after_workflow_id: &str,
    page_size: u32,
) -> Result<Vec<ExecutionRecord>> {
    let limit = page_limit(page_size)?;
    let rows = sqlx::query_as::<_, ExecutionRow>(&stmt(sql::LIST_EXECUTIONS))
        .bind(shard_id)
        .bind(after_workflow_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("list_executions"))?;

    rows.into_iter().map(ExecutionRecord::try_from).collect()
}

async fn delete_execution(conn: &mut SqliteConnection, key: &ExecutionKey) -> Result<()> {
    sqlx::query(&stmt(sql::DELETE_EXECUTION))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_execution"))?;

    Ok(())
}

async fn lock_execution(
    conn: &mut SqliteConnection,
    key: &ExecutionKey,
    statement: &str,
    operation: &'static str,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(&stmt(statement))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err(operation))?
        .ok_or_else(|| StoreError::not_found("execution", key))
}

/// Lock the run a pointer names for the rest of the transaction; a pointer must
/// never name a run that does not exist.
async fn lock_pointed_run(
    conn: &mut SqliteConnection,
    record: &CurrentExecutionRecord,
    operation: &'static str,
) -> Result<()> {
    lock_execution(conn, &record.run_key(), sql::read_lock_execution(DIALECT), operation)
        .await
        .inspect_err(|e| {
            if matches!(e, StoreError::NotFound { .. }) {
                warn!(
                    workflow = %record.key(),
                    run_id = %record.run_id,
                    operation,
                    "Current execution would name a missing run"
                );
            }
        })
        .map(|_| ())
}

// ============================================================================
// Current Execution Operations
// ============================================================================

async fn insert_current_execution(
    conn: &mut SqliteConnection,
    record: &CurrentExecutionRecord,
) -> Result<()> {
    sqlx::query(&stmt(sql::INSERT_CURRENT_EXECUTION))
        .bind(record.shard_id)
        .bind(&record.domain_id)
        .bind(&record.workflow_id)
        .bind(&record.run_id)
        .bind(&record.create_request_id)
        .bind(record.state.as_i32())
        .bind(record.close_status.as_i32())
        .bind(record.start_version)
        .bind(record.last_write_version)
        .execute(&mut *conn)
        .await
        .map_err(db_err("insert_current_execution"))?;

    Ok(())
}

async fn update_current_execution(
    conn: &mut SqliteConnection,
    record: &CurrentExecutionRecord,
    expected_run_id: Option<&str>,
) -> Result<u64> {
    let statement = stmt(match expected_run_id {
        Some(_) => sql::COMPARE_AND_SWAP_CURRENT_EXECUTION,
        None => sql::UPDATE_CURRENT_EXECUTION,
    });

    let mut query = sqlx::query(&statement)
        .bind(record.shard_id)
        .bind(&record.domain_id)
        .bind(&record.workflow_id)
        .bind(&record.run_id)
        .bind(&record.create_request_id)
        .bind(record.state.as_i32())
        .bind(record.close_status.as_i32())
        .bind(record.start_version)
        .bind(record.last_write_version);
    if let Some(expected) = expected_run_id {
        query = query.bind(expected);
    }

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(db_err("update_current_execution"))?;

    Ok(result.rows_affected())
}

async fn get_current_execution(
    conn: &mut SqliteConnection,
    key: &WorkflowKey,
    statement: &str,
    operation: &'static str,
) -> Result<CurrentExecutionRecord> {
    let row = sqlx::query_as::<_, CurrentExecutionRow>(&stmt(statement))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err(operation))?
        .ok_or_else(|| StoreError::not_found("current execution", key))?;

    CurrentExecutionRecord::try_from(row)
}

async fn delete_current_execution(
    conn: &mut SqliteConnection,
    key: &WorkflowKey,
    run_id: &str,
) -> Result<()> {
    sqlx::query(&stmt(sql::DELETE_CURRENT_EXECUTION))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(run_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_current_execution"))?;

    Ok(())
}

async fn lock_current_execution_join_execution(
    conn: &mut SqliteConnection,
    key: &WorkflowKey,
) -> Result<Vec<CurrentExecutionRecord>> {
    // Take the write lock before reading the join.
    sqlx::query(&stmt(sql::TOUCH_CURRENT_EXECUTION))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("lock_current_execution_join_execution"))?;

    let rows = sqlx::query_as::<_, CurrentExecutionRow>(&stmt(
        sql::lock_current_execution_join_execution(DIALECT),
    ))
    .bind(key.shard_id)
    .bind(&key.domain_id)
    .bind(&key.workflow_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("lock_current_execution_join_execution"))?;

    rows.into_iter()
        .map(CurrentExecutionRecord::try_from)
        .collect()
}

// ============================================================================
// Buffered Event Operations
// ============================================================================

async fn insert_buffered_events(
    conn: &mut SqliteConnection,
    key: &ExecutionKey,
    events: &[DataBlob],
) -> Result<()> {
    let chunk = insert_chunk_rows(
        DIALECT.max_bind_params(),
        sql::BUFFERED_EVENT_INSERT_COLUMNS,
    );
    let mut batch_tx = conn.begin().await.map_err(db_err("insert_buffered_events"))?;
    for batch in events.chunks(chunk) {
        let mut builder = QueryBuilder::<Sqlite>::new(sql::INSERT_BUFFERED_EVENTS_PREFIX);
        builder.push_values(batch, |mut row, event| {
            row.push_bind(key.shard_id)
                .push_bind(&key.domain_id)
                .push_bind(&key.workflow_id)
                .push_bind(&key.run_id)
                .push_bind(&event.data)
                .push_bind(event.encoding.as_str());
        });
        builder
            .build()
            .execute(&mut *batch_tx)
            .await
            .map_err(db_err("insert_buffered_events"))?;
    }
    batch_tx.commit().await.map_err(db_err("insert_buffered_events"))?;

    Ok(())
}

async fn get_buffered_events(
    conn: &mut SqliteConnection,
    key: &ExecutionKey,
) -> Result<Vec<DataBlob>> {
    let rows = sqlx::query_as::<_, BlobRow>(&stmt(sql::GET_BUFFERED_EVENTS))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("get_buffered_events"))?;

    rows.into_iter().map(DataBlob::try_from).collect()
}

async fn delete_buffered_events(conn: &mut SqliteConnection, key: &ExecutionKey) -> Result<()> {
    sqlx::query(&stmt(sql::DELETE_BUFFERED_EVENTS))
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_buffered_events"))?;

    Ok(())
}

// ============================================================================
// Task Queue Operations
// ============================================================================

async fn insert_tasks(
    conn: &mut SqliteConnection,
    queue: &TaskQueue,
    tasks: &[TaskRecord],
) -> Result<()> {
    let table = queue.table();
    let scope = queue.scope();
    let chunk = insert_chunk_rows(DIALECT.max_bind_params(), table.insert_columns());

    // A savepoint keeps a multi-statement batch all-or-nothing even if the caller
    // commits after an error.
    let mut batch_tx = conn.begin().await.map_err(db_err("insert_tasks"))?;
    for batch in tasks.chunks(chunk) {
        let mut builder = QueryBuilder::<Sqlite>::new(table.insert_prefix());
        builder.push_values(batch, |mut row, task| {
            row.push_bind(task.shard_id);
            if let Some(scope) = scope {
                row.push_bind(scope);
            }
            row.push_bind(task.task_id)
                .push_bind(&task.data.data)
                .push_bind(task.data.encoding.as_str());
        });
        builder
            .build()
            .execute(&mut *batch_tx)
            .await
            .map_err(db_err("insert_tasks"))?;
    }
    batch_tx.commit().await.map_err(db_err("insert_tasks"))?;

    Ok(())
}

async fn select_tasks(
    conn: &mut SqliteConnection,
    queue: &TaskQueue,
    range: &TaskRange,
    page_size: u32,
) -> Result<Vec<TaskRecord>> {
    let limit = page_limit(page_size)?;
    let statement = stmt(&queue.table().select_range());

    let mut query = sqlx::query_as::<_, TaskRow>(&statement).bind(range.shard_id);
    if let Some(scope) = queue.scope() {
        query = query.bind(scope);
    }
    let rows = query
        .bind(range.min_task_id)
        .bind(range.max_task_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("select_tasks"))?;

    rows.into_iter()
        .map(|row| row.into_record(range.shard_id))
        .collect()
}

async fn count_tasks(conn: &mut SqliteConnection, queue: &TaskQueue, shard_id: i32) -> Result<i64> {
    let statement = stmt(&queue.table().count());

    let mut query = sqlx::query_scalar::<_, i64>(&statement).bind(shard_id);
    if let Some(scope) = queue.scope() {
        query = query.bind(scope);
    }

    query
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("count_tasks"))
}

async fn delete_task(
    conn: &mut SqliteConnection,
    queue: &TaskQueue,
    shard_id: i32,
    task_id: i64,
) -> Result<()> {
    let statement = stmt(&queue.table().delete_one());

    let mut query = sqlx::query(&statement).bind(shard_id);
    if let Some(scope) = queue.scope() {
        query = query.bind(scope);
    }
    query
        .bind(task_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_task"))?;

    Ok(())
}

async fn range_delete_tasks(
    conn: &mut SqliteConnection,
    queue: &TaskQueue,
    range: &TaskRange,
    batch_size: Option<NonZeroU32>,
) -> Result<u64> {
    let table = queue.table();
    let statement = stmt(&match batch_size {
        Some(_) => table.delete_range_batch(),
        None => table.delete_range(),
    });

    let mut query = sqlx::query(&statement).bind(range.shard_id);
    if let Some(scope) = queue.scope() {
        query = query.bind(scope);
    }
    query = query.bind(range.min_task_id).bind(range.max_task_id);
    if let Some(limit) = batch_size {
        query = query.bind(i64::from(limit.get()));
    }

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(db_err("range_delete_tasks"))?;

    debug!(
        queue = queue.name(),
        shard_id = range.shard_id,
        deleted = result.rows_affected(),
        "Range deleted tasks"
    );

    Ok(result.rows_affected())
}

// ============================================================================
// Timer Operations
// ============================================================================

async fn insert_timer_tasks(conn: &mut SqliteConnection, timers: &[TimerTaskRecord]) -> Result<()> {
    let chunk = insert_chunk_rows(DIALECT.max_bind_params(), sql::TIMER_INSERT_COLUMNS);
    let mut batch_tx = conn.begin().await.map_err(db_err("insert_timer_tasks"))?;
    for batch in timers.chunks(chunk) {
        let mut builder = QueryBuilder::<Sqlite>::new(sql::INSERT_TIMER_TASKS_PREFIX);
        builder.push_values(batch, |mut row, timer| {
            row.push_bind(timer.shard_id)
                .push_bind(to_sqlite_timestamp(timer.visibility_timestamp))
                .push_bind(timer.task_id)
                .push_bind(&timer.data.data)
                .push_bind(timer.data.encoding.as_str());
        });
        builder
            .build()
            .execute(&mut *batch_tx)
            .await
            .map_err(db_err("insert_timer_tasks"))?;
    }
    batch_tx.commit().await.map_err(db_err("insert_timer_tasks"))?;

    Ok(())
}

async fn select_timer_tasks(
    conn: &mut SqliteConnection,
    range: &TimerRange,
    page_size: u32,
) -> Result<Vec<TimerTaskRecord>> {
    let limit = page_limit(page_size)?;
    let rows = sqlx::query_as::<_, TimerRow>(&stmt(sql::SELECT_TIMER_TASKS))
        .bind(range.shard_id)
        .bind(to_sqlite_timestamp(range.min.visibility_timestamp))
        .bind(range.min.task_id)
        .bind(to_sqlite_timestamp(range.max_visibility_timestamp))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("select_timer_tasks"))?;

    rows.into_iter()
        .map(|row| row.into_record(range.shard_id))
        .collect()
}

async fn delete_timer_task(
    conn: &mut SqliteConnection,
    shard_id: i32,
    key: &TimerTaskKey,
) -> Result<()> {
    sqlx::query(&stmt(sql::DELETE_TIMER_TASK))
        .bind(shard_id)
        .bind(to_sqlite_timestamp(key.visibility_timestamp))
        .bind(key.task_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_timer_task"))?;

    Ok(())
}

async fn range_delete_timer_tasks(
    conn: &mut SqliteConnection,
    range: &TimerRange,
    batch_size: Option<NonZeroU32>,
) -> Result<u64> {
    let statement = stmt(match batch_size {
        Some(_) => sql::DELETE_TIMER_TASK_RANGE_BATCH,
        None => sql::DELETE_TIMER_TASK_RANGE,
    });

    let mut query = sqlx::query(&statement)
        .bind(range.shard_id)
        .bind(to_sqlite_timestamp(range.min.visibility_timestamp))
        .bind(range.min.task_id)
        .bind(to_sqlite_timestamp(range.max_visibility_timestamp));
    if let Some(limit) = batch_size {
        query = query.bind(i64::from(limit.get()));
    }

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(db_err("range_delete_timer_tasks"))?;

    debug!(
        shard_id = range.shard_id,
        deleted = result.rows_affected(),
        "Range deleted timer tasks"
    );

    Ok(result.rows_affected())
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait]
impl ShardStore for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn begin(&self, shard_id: i32) -> Result<Box<dyn ShardTransaction>> {
        let tx = self.pool.begin().await.map_err(db_err("begin"))?;
        Ok(Box::new(SqliteTransaction { tx, shard_id }))
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("health_check"))?;
        Ok(())
    }

    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        get_execution(&mut conn, key).await
    }

    async fn list_executions(
        &self,
        shard_id: i32,
        after_workflow_id: &str,
        page_size: u32,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        list_executions(&mut conn, shard_id, after_workflow_id, page_size).await
    }

    async fn get_current_execution(&self, key: &WorkflowKey) -> Result<CurrentExecutionRecord> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        get_current_execution(
            &mut conn,
            key,
            sql::GET_CURRENT_EXECUTION,
            "get_current_execution",
        )
        .await
    }

    async fn get_buffered_events(&self, key: &ExecutionKey) -> Result<Vec<DataBlob>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        get_buffered_events(&mut conn, key).await
    }

    async fn select_tasks(
        &self,
        queue: &TaskQueue,
        range: &TaskRange,
        page_size: u32,
    ) -> Result<Vec<TaskRecord>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        select_tasks(&mut conn, queue, range, page_size).await
    }

    async fn select_timer_tasks(
        &self,
        range: &TimerRange,
        page_size: u32,
    ) -> Result<Vec<TimerTaskRecord>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        select_timer_tasks(&mut conn, range, page_size).await
    }

    async fn count_tasks(&self, queue: &TaskQueue, shard_id: i32) -> Result<i64> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire"))?;
        count_tasks(&mut conn, queue, shard_id).await
    }
}

#[async_trait]
impl ShardTransaction for SqliteTransaction {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    async fn insert_execution(&mut self, record: &ExecutionRecord) -> Result<()> {
        ensure_shard(self.shard_id, record.shard_id)?;
        insert_execution(&mut self.tx, record).await
    }

    async fn update_execution(&mut self, record: &ExecutionRecord) -> Result<()> {
        ensure_shard(self.shard_id, record.shard_id)?;
        update_execution(&mut self.tx, record).await
    }

    async fn get_execution(&mut self, key: &ExecutionKey) -> Result<ExecutionRecord> {
        ensure_shard(self.shard_id, key.shard_id)?;
        get_execution(&mut self.tx, key).await
    }

    async fn delete_execution(&mut self, key: &ExecutionKey) -> Result<()> {
        ensure_shard(self.shard_id, key.shard_id)?;
        delete_execution(&mut self.tx, key).await
    }

    async fn read_lock_execution(&mut self, key: &ExecutionKey) -> Result<i64> {
        ensure_shard(self.shard_id, key.shard_id)?;
        lock_execution(
            &mut self.tx,
            key,
            sql::read_lock_execution(DIALECT),
            "read_lock_execution",
        )
        .await
    }

    async fn write_lock_execution(&mut self, key: &ExecutionKey) -> Result<i64> {
        ensure_shard(self.shard_id, key.shard_id)?;
        lock_execution(
            &mut self.tx,
            key,
            sql::write_lock_execution(DIALECT),
            "write_lock_execution",
        )
        .await
    }

    async fn insert_current_execution(&mut self, record: &CurrentExecutionRecord) -> Result<()> {
        ensure_shard(self.shard_id, record.shard_id)?;
        lock_pointed_run(&mut self.tx, record, "insert_current_execution").await?;
        insert_current_execution(&mut self.tx, record).await
    }

    async fn update_current_execution(&mut self, record: &CurrentExecutionRecord) -> Result<()> {
        ensure_shard(self.shard_id, record.shard_id)?;
        lock_pointed_run(&mut self.tx, record, "update_current_execution").await?;
        if update_current_execution(&mut self.tx, record, None).await? == 0 {
            return Err(StoreError::not_found("current execution", record.key()));
        }
        Ok(())
    }

    async fn compare_and_swap_current_execution(
        &mut self,
        record: &CurrentExecutionRecord,
        expected_run_id: &str,
    ) -> Result<()> {
        ensure_shard(self.shard_id, record.shard_id)?;
        lock_pointed_run(&mut self.tx, record, "compare_and_swap_current_execution").await?;
        if update_current_execution(&mut self.tx, record, Some(expected_run_id)).await? == 0 {
            warn!(
                workflow = %record.key(),
                expected_run_id,
                "Current execution moved on before compare-and-swap"
            );
            return Err(StoreError::conflict(
                "compare_and_swap_current_execution",
                format!("{} no longer points at run {}", record.key(), expected_run_id),
            ));
        }
        Ok(())
    }

    async fn get_current_execution(&mut self, key: &WorkflowKey) -> Result<CurrentExecutionRecord> {
        ensure_shard(self.shard_id, key.shard_id)?;
        get_current_execution(
            &mut self.tx,
            key,
            sql::GET_CURRENT_EXECUTION,
            "get_current_execution",
        )
        .await
    }

    async fn delete_current_execution(&mut self, key: &WorkflowKey, run_id: &str) -> Result<()> {
        ensure_shard(self.shard_id, key.shard_id)?;
        delete_current_execution(&mut self.tx, key, run_id).await
    }

    async fn lock_current_execution(&mut self, key: &WorkflowKey) -> Result<CurrentExecutionRecord> {
        ensure_shard(self.shard_id, key.shard_id)?;
        get_current_execution(
            &mut self.tx,
            key,
            sql::lock_current_execution(DIALECT),
            "lock_current_execution",
        )
        .await
    }

    async fn lock_current_execution_join_execution(
        &mut self,
        key: &WorkflowKey,
    ) -> Result<Vec<CurrentExecutionRecord>> {
        ensure_shard(self.shard_id, key.shard_id)?;
        lock_current_execution_join_execution(&mut self.tx, key).await
    }

    async fn insert_buffered_events(&mut self, key: &ExecutionKey, events: &[DataBlob]) -> Result<()> {
        ensure_shard(self.shard_id, key.shard_id)?;
        insert_buffered_events(&mut self.tx, key, events).await
    }

    async fn get_buffered_events(&mut self, key: &ExecutionKey) -> Result<Vec<DataBlob>> {
        ensure_shard(self.shard_id, key.shard_id)?;
        get_buffered_events(&mut self.tx, key).await
    }

    async fn delete_buffered_events(&mut self, key: &ExecutionKey) -> Result<()> {
        ensure_shard(self.shard_id, key.shard_id)?;
        delete_buffered_events(&mut self.tx, key).await
    }

    async fn insert_tasks(&mut self, queue: &TaskQueue, tasks: &[TaskRecord]) -> Result<()> {
        for task in tasks {
            ensure_shard(self.shard_id, task.shard_id)?;
        }
        insert_tasks(&mut self.tx, queue, tasks).await
    }

    async fn select_tasks(
        &mut self,
        queue: &TaskQueue,
        range: &TaskRange,
        page_size: u32,
    ) -> Result<Vec<TaskRecord>> {
        ensure_shard(self.shard_id, range.shard_id)?;
        select_tasks(&mut self.tx, queue, range, page_size).await
    }

    async fn delete_task(&mut self, queue: &TaskQueue, shard_id: i32, task_id: i64) -> Result<()> {
        ensure_shard(self.shard_id, shard_id)?;
        delete_task(&mut self.tx, queue, shard_id, task_id).await
    }

    async fn range_delete_tasks(
        &mut self,
        queue: &TaskQueue,
        range: &TaskRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64> {
        ensure_shard(self.shard_id, range.shard_id)?;
        range_delete_tasks(&mut self.tx, queue, range, batch_size).await
    }

    async fn insert_timer_tasks(&mut self, timers: &[TimerTaskRecord]) -> Result<()> {
        for timer in timers {
            ensure_shard(self.shard_id, timer.shard_id)?;
        }
        insert_timer_tasks(&mut self.tx, timers).await
    }

    async fn select_timer_tasks(
        &mut self,
        range: &TimerRange,
        page_size: u32,
    ) -> Result<Vec<TimerTaskRecord>> {
        ensure_shard(self.shard_id, range.shard_id)?;
        select_timer_tasks(&mut self.tx, range, page_size).await
    }

    async fn delete_timer_task(&mut self, shard_id: i32, key: &TimerTaskKey) -> Result<()> {
        ensure_shard(self.shard_id, shard_id)?;
        delete_timer_task(&mut self.tx, shard_id, key).await
    }

    async fn range_delete_timer_tasks(
        &mut self,
        range: &TimerRange,
        batch_size: Option<NonZeroU32>,
    ) -> Result<u64> {
        ensure_shard(self.shard_id, range.shard_id)?;
        range_delete_timer_tasks(&mut self.tx, range, batch_size).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err("rollback"))
    }
}

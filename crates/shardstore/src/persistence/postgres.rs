// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed shard store.
//!
//! Every operation is a free function over `&mut PgConnection`, so the same code
//! serves pooled snapshot reads and statements inside a [`PostgresTransaction`].
//! Locks are row locks (`FOR SHARE` / `FOR UPDATE`) held until the transaction ends.

use std::num::NonZeroU32;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};

use crate::codec::{
    BlobRow, CurrentExecutionRow, DataBlob, ExecutionRow, TaskRow, from_postgres_timestamp,
    to_postgres_timestamp,
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

const DIALECT: Dialect = Dialect::Postgres;

/// PostgreSQL-backed shard store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool configured from `config`.
    ///
    /// `lock_timeout` and `statement_timeout` are set as session options on every
    /// connection, so a blocked lock surfaces as [`StoreError::LockContention`]
    /// and a runaway statement as [`StoreError::Timeout`].
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = config
            .database_url
            .parse::<PgConnectOptions>()
            .map_err(db_err("connect"))?
            .options([
                ("lock_timeout", config.lock_timeout.as_millis().to_string()),
                (
                    "statement_timeout",
                    config.statement_timeout.as_millis().to_string(),
                ),
            ]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(db_err("connect"))?;

        if config.run_migrations {
            migrations::run_postgres(&pool).await?;
        }

        Ok(Self::new(pool))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open PostgreSQL transaction bound to one shard.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    shard_id: i32,
}

/// Timer row; PostgreSQL keeps the timestamp as `TIMESTAMP`.
#[derive(sqlx::FromRow)]
struct TimerRow {
    visibility_timestamp: NaiveDateTime,
    task_id: i64,
    data: Vec<u8>,
    data_encoding: String,
}

impl TimerRow {
    fn into_record(self, shard_id: i32) -> Result<TimerTaskRecord> {
        Ok(TimerTaskRecord {
            shard_id,
            visibility_timestamp: from_postgres_timestamp(self.visibility_timestamp),
            task_id: self.task_id,
            data: DataBlob::from_columns(self.data, &self.data_encoding)?,
        })
    }
}

// ============================================================================
// Execution Operations
// ============================================================================

async fn insert_execution(conn: &mut PgConnection, record: &ExecutionRecord) -> Result<()> {
    sqlx::query(sql::INSERT_EXECUTION)
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

async fn update_execution(conn: &mut PgConnection, record: &ExecutionRecord) -> Result<()> {
    let result = sqlx::query(sql::UPDATE_EXECUTION)
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
        let stored: Option<i64> = sqlx::query_scalar(sql::GET_NEXT_EVENT_ID)
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

async fn get_execution(conn: &mut PgConnection, key: &ExecutionKey) -> Result<ExecutionRecord> {
    let row = sqlx::query_as::<_, ExecutionRow>(sql::GET_EXECUTION)
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
    conn: &mut PgConnection,
    shard_id: i32,
    after_workflow_id: &str,
    page_size: u32,
) -> Result<Vec<ExecutionRecord>> {
    let limit = page_limit(page_size)?;
    let rows = sqlx::query_as::<_, ExecutionRow>(sql::LIST_EXECUTIONS)
        .bind(shard_id)
        .bind(after_workflow_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("list_executions"))?;

    rows.into_iter().map(ExecutionRecord::try_from).collect()
}

async fn delete_execution(conn: &mut PgConnection, key: &ExecutionKey) -> Result<()> {
    sqlx::query(sql::DELETE_EXECUTION)
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
    conn: &mut PgConnection,
    key: &ExecutionKey,
    statement: &str,
    operation: &'static str,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(statement)
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
    conn: &mut PgConnection,
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
    conn: &mut PgConnection,
    record: &CurrentExecutionRecord,
) -> Result<()> {
    sqlx::query(sql::INSERT_CURRENT_EXECUTION)
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
    conn: &mut PgConnection,
    record: &CurrentExecutionRecord,
    expected_run_id: Option<&str>,
) -> Result<u64> {
    let statement = match expected_run_id {
        Some(_) => sql::COMPARE_AND_SWAP_CURRENT_EXECUTION,
        None => sql::UPDATE_CURRENT_EXECUTION,
    };

    let mut query = sqlx::query(statement)
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
    conn: &mut PgConnection,
    key: &WorkflowKey,
    statement: &str,
    operation: &'static str,
) -> Result<CurrentExecutionRecord> {
    let row = sqlx::query_as::<_, CurrentExecutionRow>(statement)
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
    conn: &mut PgConnection,
    key: &WorkflowKey,
    run_id: &str,
) -> Result<()> {
    sqlx::query(sql::DELETE_CURRENT_EXECUTION)
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
    conn: &mut PgConnection,
    key: &WorkflowKey,
) -> Result<Vec<CurrentExecutionRecord>> {
    let rows = sqlx::query_as::<_, CurrentExecutionRow>(
        sql::lock_current_execution_join_execution(DIALECT),
    )
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
    conn: &mut PgConnection,
    key: &ExecutionKey,
    events: &[DataBlob],
) -> Result<()> {
    let chunk = insert_chunk_rows(
        DIALECT.max_bind_params(),
        sql::BUFFERED_EVENT_INSERT_COLUMNS,
    );
    for batch in events.chunks(chunk) {
        let mut builder = QueryBuilder::<Postgres>::new(sql::INSERT_BUFFERED_EVENTS_PREFIX);
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
            .execute(&mut *conn)
            .await
            .map_err(db_err("insert_buffered_events"))?;
    }

    Ok(())
}

async fn get_buffered_events(conn: &mut PgConnection, key: &ExecutionKey) -> Result<Vec<DataBlob>> {
    let rows = sqlx::query_as::<_, BlobRow>(sql::GET_BUFFERED_EVENTS)
        .bind(key.shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("get_buffered_events"))?;

    rows.into_iter().map(DataBlob::try_from).collect()
}

async fn delete_buffered_events(conn: &mut PgConnection, key: &ExecutionKey) -> Result<()> {
    sqlx::query(sql::DELETE_BUFFERED_EVENTS)
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

async fn insert_tasks(conn: &mut PgConnection, queue: &TaskQueue, tasks: &[TaskRecord]) -> Result<()> {
    let table = queue.table();
    let scope = queue.scope();
    let chunk = insert_chunk_rows(DIALECT.max_bind_params(), table.insert_columns());

    for batch in tasks.chunks(chunk) {
        let mut builder = QueryBuilder::<Postgres>::new(table.insert_prefix());
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
            .execute(&mut *conn)
            .await
            .map_err(db_err("insert_tasks"))?;
    }

    Ok(())
}

async fn select_tasks(
    conn: &mut PgConnection,
    queue: &TaskQueue,
    range: &TaskRange,
    page_size: u32,
) -> Result<Vec<TaskRecord>> {
    let limit = page_limit(page_size)?;
    let statement = queue.table().select_range();

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

async fn count_tasks(conn: &mut PgConnection, queue: &TaskQueue, shard_id: i32) -> Result<i64> {
    let statement = queue.table().count();

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
    conn: &mut PgConnection,
    queue: &TaskQueue,
    shard_id: i32,
    task_id: i64,
) -> Result<()> {
    let statement = queue.table().delete_one();

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
    conn: &mut PgConnection,
    queue: &TaskQueue,
    range: &TaskRange,
    batch_size: Option<NonZeroU32>,
) -> Result<u64> {
    let table = queue.table();
    let statement = match batch_size {
        Some(_) => table.delete_range_batch(),
        None => table.delete_range(),
    };

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

async fn insert_timer_tasks(conn: &mut PgConnection, timers: &[TimerTaskRecord]) -> Result<()> {
    let chunk = insert_chunk_rows(DIALECT.max_bind_params(), sql::TIMER_INSERT_COLUMNS);
    for batch in timers.chunks(chunk) {
        let mut builder = QueryBuilder::<Postgres>::new(sql::INSERT_TIMER_TASKS_PREFIX);
        builder.push_values(batch, |mut row, timer| {
            row.push_bind(timer.shard_id)
                .push_bind(to_postgres_timestamp(timer.visibility_timestamp))
                .push_bind(timer.task_id)
                .push_bind(&timer.data.data)
                .push_bind(timer.data.encoding.as_str());
        });
        builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(db_err("insert_timer_tasks"))?;
    }

    Ok(())
}

async fn select_timer_tasks(
    conn: &mut PgConnection,
    range: &TimerRange,
    page_size: u32,
) -> Result<Vec<TimerTaskRecord>> {
    let limit = page_limit(page_size)?;
    let rows = sqlx::query_as::<_, TimerRow>(sql::SELECT_TIMER_TASKS)
        .bind(range.shard_id)
        .bind(to_postgres_timestamp(range.min.visibility_timestamp))
        .bind(range.min.task_id)
        .bind(to_postgres_timestamp(range.max_visibility_timestamp))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("select_timer_tasks"))?;

    rows.into_iter()
        .map(|row| row.into_record(range.shard_id))
        .collect()
}

async fn delete_timer_task(conn: &mut PgConnection, shard_id: i32, key: &TimerTaskKey) -> Result<()> {
    sqlx::query(sql::DELETE_TIMER_TASK)
        .bind(shard_id)
        .bind(to_postgres_timestamp(key.visibility_timestamp))
        .bind(key.task_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err("delete_timer_task"))?;

    Ok(())
}

async fn range_delete_timer_tasks(
    conn: &mut PgConnection,
    range: &TimerRange,
    batch_size: Option<NonZeroU32>,
) -> Result<u64> {
    let statement = match batch_size {
        Some(_) => sql::DELETE_TIMER_TASK_RANGE_BATCH,
        None => sql::DELETE_TIMER_TASK_RANGE,
    };

    let mut query = sqlx::query(statement)
        .bind(range.shard_id)
        .bind(to_postgres_timestamp(range.min.visibility_timestamp))
        .bind(range.min.task_id)
        .bind(to_postgres_timestamp(range.max_visibility_timestamp));
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
impl ShardStore for PostgresStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn begin(&self, shard_id: i32) -> Result<Box<dyn ShardTransaction>> {
        let tx = self.pool.begin().await.map_err(db_err("begin"))?;
        Ok(Box::new(PostgresTransaction { tx, shard_id }))
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
impl ShardTransaction for PostgresTransaction {
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

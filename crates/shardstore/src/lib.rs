// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardstore - Durable Execution Store
//!
//! Persistence layer for a sharded workflow orchestration service. A shard owner
//! keeps each workflow run's mutable state, the pointer to the current run of every
//! workflow id, and the shard's outbound task queues in one relational database.
//! Callers combine these writes in a single transaction so that "advance the
//! workflow" and "enqueue the follow-up work" commit together.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Shard owner (history service)            │
//! └──────────────────────────────────────────────────────────┘
//!          │ snapshot reads,                 │ begin(shard)
//!          │ queue maintenance               ▼
//!          │                      ┌──────────────────────┐
//!          │                      │  ShardTransaction    │
//!          │                      │  locks + writes      │
//!          ▼                      └──────────────────────┘
//! ┌──────────────────────┐                   │
//! │     ShardStore       │───────────────────┘
//! │ PostgresStore /      │
//! │ SqliteStore          │
//! └──────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────────┐
//! │ PostgreSQL / SQLite  │
//! └──────────────────────┘
//! ```
//!
//! # Tables
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | `executions` | shard, domain, workflow, run | Mutable state of one run |
//! | `current_executions` | shard, domain, workflow | Pointer to the current run |
//! | `buffered_events` | shard, domain, workflow, run | Events held back during a decision |
//! | `transfer_tasks` | shard, task id | Work for other services |
//! | `cross_cluster_tasks` | target cluster, shard, task id | Work for one remote cluster |
//! | `timer_tasks` | shard, visibility timestamp, task id | Durable timers |
//! | `replication_tasks` | shard, task id | Outbound replication |
//! | `replication_tasks_dlq` | source cluster, shard, task id | Rejected replication tasks |
//!
//! # Locking
//!
//! | Operation | PostgreSQL | SQLite |
//! |-----------|------------|--------|
//! | `read_lock_execution` | `FOR SHARE` | no-op `UPDATE ... RETURNING` (RESERVED lock) |
//! | `write_lock_execution` | `FOR UPDATE` | no-op `UPDATE ... RETURNING` (RESERVED lock) |
//! | `lock_current_execution` | `FOR UPDATE` | no-op `UPDATE ... RETURNING` |
//! | `lock_current_execution_join_execution` | one `SELECT ... JOIN ... FOR UPDATE` | touch pointer, then join |
//!
//! Lock operations only exist on [`persistence::ShardTransaction`]. Locks are held
//! until the transaction commits, rolls back or is dropped.
//!
//! # Errors
//!
//! Every failure is a [`error::StoreError`]. Lock contention, timeouts and
//! transient connection failures are retryable; re-run the whole transaction,
//! for example with [`retry::retry_transient`].
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SHARDSTORE_DATABASE_URL` | Yes | - | `postgres://...` or `sqlite:...` |
//! | `SHARDSTORE_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `SHARDSTORE_LOCK_TIMEOUT_MS` | No | `5000` | Lock wait bound |
//! | `SHARDSTORE_STATEMENT_TIMEOUT_MS` | No | `30000` | Statement bound (PostgreSQL) |
//! | `SHARDSTORE_RUN_MIGRATIONS` | No | `true` | Apply migrations on connect |

#![deny(missing_docs)]

/// Row codec: payload blobs, lifecycle enums and timestamps.
pub mod codec;

/// Store configuration loaded from environment variables.
pub mod config;

/// Error types with stable codes and retry classification.
pub mod error;

/// Embedded schema migrations for PostgreSQL and SQLite.
pub mod migrations;

/// Store traits, records and backend implementations.
pub mod persistence;

/// Caller-side retry and deadline helpers.
pub mod retry;

pub use codec::{CloseStatus, DataBlob, EncodingType, WorkflowState};
pub use config::{BackendKind, StoreConfig};
pub use error::{Result, StoreError};
pub use persistence::{
    CurrentExecutionRecord, ExecutionKey, ExecutionRecord, ShardStore, ShardTransaction,
    TaskQueue, TaskRange, TaskRecord, TimerRange, TimerTaskKey, TimerTaskRecord, WorkflowKey,
    connect,
};

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL text shared by both backends.
//!
//! Statements are written once with PostgreSQL `$n` placeholders and rendered for
//! SQLite as `?n`. Both engines accept numbered parameters that may appear more than
//! once, which the batched deletes rely on. Queue statements are generated per
//! table because cross-cluster tasks and DLQ messages carry an extra scope column.

use std::borrow::Cow;

/// Placeholder and locking flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Rewrite `$n` placeholders for this dialect.
    pub(crate) fn render(self, sql: &str) -> Cow<'_, str> {
        match self {
            Self::Postgres => Cow::Borrowed(sql),
            Self::Sqlite => Cow::Owned(sql.replace('$', "?")),
        }
    }

    /// Upper bound on bind parameters in one statement.
    pub(crate) fn max_bind_params(self) -> usize {
        match self {
            Self::Postgres => 65_535,
            Self::Sqlite => 32_766,
        }
    }
}

/// Physical layout of an id-ordered task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueTable {
    pub name: &'static str,
    /// Extra key column between `shard_id` and `task_id`, if any.
    pub scope_column: Option<&'static str>,
}

pub(crate) const TRANSFER_TASKS: QueueTable = QueueTable {
    name: "transfer_tasks",
    scope_column: None,
};

pub(crate) const REPLICATION_TASKS: QueueTable = QueueTable {
    name: "replication_tasks",
    scope_column: None,
};

pub(crate) const CROSS_CLUSTER_TASKS: QueueTable = QueueTable {
    name: "cross_cluster_tasks",
    scope_column: Some("target_cluster"),
};

pub(crate) const REPLICATION_TASKS_DLQ: QueueTable = QueueTable {
    name: "replication_tasks_dlq",
    scope_column: Some("source_cluster_name"),
};

// Column counts per inserted row, used to split oversized batches.
pub(crate) const TIMER_INSERT_COLUMNS: usize = 5;
pub(crate) const BUFFERED_EVENT_INSERT_COLUMNS: usize = 6;

impl QueueTable {
    pub(crate) fn insert_columns(&self) -> usize {
        if self.scope_column.is_some() { 5 } else { 4 }
    }

    /// `shard_id = $1 [AND scope = $2]` and the next free parameter number.
    fn key_filter(&self) -> (String, usize) {
        match self.scope_column {
            Some(column) => (format!("shard_id = $1 AND {} = $2", column), 3),
            None => ("shard_id = $1".to_string(), 2),
        }
    }

    /// Prefix for a multi-row insert; binds `shard_id, [scope,] task_id, data, data_encoding`.
    pub(crate) fn insert_prefix(&self) -> String {
        match self.scope_column {
            Some(column) => format!(
                "INSERT INTO {} (shard_id, {}, task_id, data, data_encoding) ",
                self.name, column
            ),
            None => format!(
                "INSERT INTO {} (shard_id, task_id, data, data_encoding) ",
                self.name
            ),
        }
    }

    /// Binds `shard_id, [scope,] min_task_id, max_task_id, limit`.
    pub(crate) fn select_range(&self) -> String {
        let (filter, n) = self.key_filter();
        format!(
            "SELECT task_id, data, data_encoding FROM {table} \
             WHERE {filter} AND task_id > ${min} AND task_id <= ${max} \
             ORDER BY task_id LIMIT ${limit}",
            table = self.name,
            filter = filter,
            min = n,
            max = n + 1,
            limit = n + 2,
        )
    }

    /// Binds `shard_id, [scope,] task_id`.
    pub(crate) fn delete_one(&self) -> String {
        let (filter, n) = self.key_filter();
        format!(
            "DELETE FROM {} WHERE {} AND task_id = ${}",
            self.name, filter, n
        )
    }

    /// Binds `shard_id, [scope,] min_task_id, max_task_id`.
    pub(crate) fn delete_range(&self) -> String {
        let (filter, n) = self.key_filter();
        format!(
            "DELETE FROM {} WHERE {} AND task_id > ${} AND task_id <= ${}",
            self.name,
            filter,
            n,
            n + 1
        )
    }

    /// Deletes the lowest `limit` ids of the range.
    /// Binds `shard_id, [scope,] min_task_id, max_task_id, limit`.
    pub(crate) fn delete_range_batch(&self) -> String {
        let (filter, n) = self.key_filter();
        format!(
            "DELETE FROM {table} WHERE {filter} AND task_id IN (\
             SELECT task_id FROM {table} \
             WHERE {filter} AND task_id > ${min} AND task_id <= ${max} \
             ORDER BY task_id LIMIT ${limit})",
            table = self.name,
            filter = filter,
            min = n,
            max = n + 1,
            limit = n + 2,
        )
    }

    /// Binds `shard_id, [scope]`.
    pub(crate) fn count(&self) -> String {
        let (filter, _) = self.key_filter();
        format!("SELECT COUNT(*) FROM {} WHERE {}", self.name, filter)
    }
}

// ============================================================================
// Executions
// ============================================================================

pub(crate) const INSERT_EXECUTION: &str = r#"
    INSERT INTO executions
        (shard_id, domain_id, workflow_id, run_id, next_event_id, last_write_version, data, data_encoding)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

// The guard keeps next_event_id from moving backwards.
pub(crate) const UPDATE_EXECUTION: &str = r#"
    UPDATE executions
    SET next_event_id = $5, last_write_version = $6, data = $7, data_encoding = $8
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
      AND next_event_id <= $5
"#;

pub(crate) const GET_EXECUTION: &str = r#"
    SELECT shard_id, domain_id, workflow_id, run_id, next_event_id, last_write_version, data, data_encoding
    FROM executions
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
"#;

pub(crate) const GET_NEXT_EVENT_ID: &str = r#"
    SELECT next_event_id FROM executions
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
"#;

pub(crate) const LIST_EXECUTIONS: &str = r#"
    SELECT shard_id, domain_id, workflow_id, run_id, next_event_id, last_write_version, data, data_encoding
    FROM executions
    WHERE shard_id = $1 AND workflow_id > $2
    ORDER BY workflow_id
    LIMIT $3
"#;

pub(crate) const DELETE_EXECUTION: &str = r#"
    DELETE FROM executions
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
"#;

// A no-op write escalates a SQLite transaction to RESERVED, which excludes every
// other lock holder until commit or rollback.
const RESERVE_EXECUTION: &str = r#"
    UPDATE executions SET next_event_id = next_event_id
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
    RETURNING next_event_id
"#;

/// Shared lock on one execution row.
///
/// SQLite has no shared row lock that survives WAL snapshots, so there a read
/// lock is as exclusive as a write lock.
pub(crate) fn read_lock_execution(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            r#"
            SELECT next_event_id FROM executions
            WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
            FOR SHARE
            "#
        }
        Dialect::Sqlite => RESERVE_EXECUTION,
    }
}

/// Exclusive lock on one execution row.
pub(crate) fn write_lock_execution(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            r#"
            SELECT next_event_id FROM executions
            WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
            FOR UPDATE
            "#
        }
        Dialect::Sqlite => RESERVE_EXECUTION,
    }
}

// ============================================================================
// Current Executions
// ============================================================================

pub(crate) const INSERT_CURRENT_EXECUTION: &str = r#"
    INSERT INTO current_executions
        (shard_id, domain_id, workflow_id, run_id, create_request_id, state, close_status,
         start_version, last_write_version)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

pub(crate) const UPDATE_CURRENT_EXECUTION: &str = r#"
    UPDATE current_executions
    SET run_id = $4, create_request_id = $5, state = $6, close_status = $7,
        start_version = $8, last_write_version = $9
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3
"#;

pub(crate) const COMPARE_AND_SWAP_CURRENT_EXECUTION: &str = r#"
    UPDATE current_executions
    SET run_id = $4, create_request_id = $5, state = $6, close_status = $7,
        start_version = $8, last_write_version = $9
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $10
"#;

pub(crate) const GET_CURRENT_EXECUTION: &str = r#"
    SELECT shard_id, domain_id, workflow_id, run_id, create_request_id, state, close_status,
           start_version, last_write_version
    FROM current_executions
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3
"#;

pub(crate) const DELETE_CURRENT_EXECUTION: &str = r#"
    DELETE FROM current_executions
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
"#;

/// Exclusive lock on the current-execution pointer.
pub(crate) fn lock_current_execution(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            r#"
            SELECT shard_id, domain_id, workflow_id, run_id, create_request_id, state, close_status,
                   start_version, last_write_version
            FROM current_executions
            WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3
            FOR UPDATE
            "#
        }
        Dialect::Sqlite => {
            r#"
            UPDATE current_executions SET run_id = run_id
            WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3
            RETURNING shard_id, domain_id, workflow_id, run_id, create_request_id, state, close_status,
                      start_version, last_write_version
            "#
        }
    }
}

/// Current-execution pointer joined with its run; `last_write_version` comes from the run.
///
/// PostgreSQL locks both rows in one statement. SQLite has no row locks, so the
/// backend runs [`TOUCH_CURRENT_EXECUTION`] first and this plain join afterwards.
pub(crate) fn lock_current_execution_join_execution(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            r#"
            SELECT ce.shard_id, ce.domain_id, ce.workflow_id, ce.run_id, ce.create_request_id,
                   ce.state, ce.close_status, ce.start_version, e.last_write_version
            FROM current_executions ce
            INNER JOIN executions e
                ON e.shard_id = ce.shard_id AND e.domain_id = ce.domain_id
               AND e.workflow_id = ce.workflow_id AND e.run_id = ce.run_id
            WHERE ce.shard_id = $1 AND ce.domain_id = $2 AND ce.workflow_id = $3
            FOR UPDATE
            "#
        }
        Dialect::Sqlite => {
            r#"
            SELECT ce.shard_id, ce.domain_id, ce.workflow_id, ce.run_id, ce.create_request_id,
                   ce.state, ce.close_status, ce.start_version, e.last_write_version
            FROM current_executions ce
            INNER JOIN executions e
                ON e.shard_id = ce.shard_id AND e.domain_id = ce.domain_id
               AND e.workflow_id = ce.workflow_id AND e.run_id = ce.run_id
            WHERE ce.shard_id = $1 AND ce.domain_id = $2 AND ce.workflow_id = $3
            "#
        }
    }
}

pub(crate) const TOUCH_CURRENT_EXECUTION: &str = r#"
    UPDATE current_executions SET run_id = run_id
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3
"#;

// ============================================================================
// Buffered Events
// ============================================================================

pub(crate) const INSERT_BUFFERED_EVENTS_PREFIX: &str =
    "INSERT INTO buffered_events (shard_id, domain_id, workflow_id, run_id, data, data_encoding) ";

pub(crate) const GET_BUFFERED_EVENTS: &str = r#"
    SELECT data, data_encoding FROM buffered_events
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
    ORDER BY id
"#;

pub(crate) const DELETE_BUFFERED_EVENTS: &str = r#"
    DELETE FROM buffered_events
    WHERE shard_id = $1 AND domain_id = $2 AND workflow_id = $3 AND run_id = $4
"#;

// ============================================================================
// Timer Tasks
// ============================================================================

pub(crate) const INSERT_TIMER_TASKS_PREFIX: &str =
    "INSERT INTO timer_tasks (shard_id, visibility_timestamp, task_id, data, data_encoding) ";

/// Binds `shard_id, min_ts, min_task_id, max_ts, limit`.
pub(crate) const SELECT_TIMER_TASKS: &str = r#"
    SELECT visibility_timestamp, task_id, data, data_encoding
    FROM timer_tasks
    WHERE shard_id = $1
      AND ((visibility_timestamp >= $2 AND task_id > $3) OR visibility_timestamp > $2)
      AND visibility_timestamp <= $4
    ORDER BY visibility_timestamp, task_id
    LIMIT $5
"#;

/// Binds `shard_id, visibility_timestamp, task_id`.
pub(crate) const DELETE_TIMER_TASK: &str = r#"
    DELETE FROM timer_tasks
    WHERE shard_id = $1 AND visibility_timestamp = $2 AND task_id = $3
"#;

/// Binds `shard_id, min_ts, min_task_id, max_ts`.
pub(crate) const DELETE_TIMER_TASK_RANGE: &str = r#"
    DELETE FROM timer_tasks
    WHERE shard_id = $1
      AND ((visibility_timestamp >= $2 AND task_id > $3) OR visibility_timestamp > $2)
      AND visibility_timestamp <= $4
"#;

/// Binds `shard_id, min_ts, min_task_id, max_ts, limit`.
pub(crate) const DELETE_TIMER_TASK_RANGE_BATCH: &str = r#"
    DELETE FROM timer_tasks
    WHERE shard_id = $1 AND (visibility_timestamp, task_id) IN (
        SELECT visibility_timestamp, task_id FROM timer_tasks
        WHERE shard_id = $1
          AND ((visibility_timestamp >= $2 AND task_id > $3) OR visibility_timestamp > $2)
          AND visibility_timestamp <= $4
        ORDER BY visibility_timestamp, task_id
        LIMIT $5
    )
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sqlite_placeholders() {
        let rendered = Dialect::Sqlite.render("WHERE shard_id = $1 AND task_id > $2");
        assert_eq!(rendered, "WHERE shard_id = ?1 AND task_id > ?2");

        let untouched = Dialect::Postgres.render("WHERE shard_id = $1");
        assert!(matches!(untouched, Cow::Borrowed(_)));
    }

    #[test]
    fn test_unscoped_queue_statements() {
        assert_eq!(
            TRANSFER_TASKS.select_range(),
            "SELECT task_id, data, data_encoding FROM transfer_tasks \
             WHERE shard_id = $1 AND task_id > $2 AND task_id <= $3 \
             ORDER BY task_id LIMIT $4"
        );
        assert_eq!(
            TRANSFER_TASKS.delete_one(),
            "DELETE FROM transfer_tasks WHERE shard_id = $1 AND task_id = $2"
        );
        assert_eq!(
            REPLICATION_TASKS.insert_prefix(),
            "INSERT INTO replication_tasks (shard_id, task_id, data, data_encoding) "
        );
    }

    #[test]
    fn test_scoped_queue_statements_shift_parameters() {
        assert_eq!(
            CROSS_CLUSTER_TASKS.delete_range(),
            "DELETE FROM cross_cluster_tasks WHERE shard_id = $1 AND target_cluster = $2 \
             AND task_id > $3 AND task_id <= $4"
        );
        assert_eq!(
            REPLICATION_TASKS_DLQ.count(),
            "SELECT COUNT(*) FROM replication_tasks_dlq \
             WHERE shard_id = $1 AND source_cluster_name = $2"
        );
        assert_eq!(REPLICATION_TASKS_DLQ.insert_columns(), 5);
        assert_eq!(TRANSFER_TASKS.insert_columns(), 4);
    }

    #[test]
    fn test_batched_delete_reuses_key_parameters() {
        let sql = REPLICATION_TASKS_DLQ.delete_range_batch();
        assert_eq!(sql.matches("source_cluster_name = $2").count(), 2);
        assert!(sql.contains("ORDER BY task_id LIMIT $5"));

        let sqlite = Dialect::Sqlite.render(&sql).into_owned();
        assert!(!sqlite.contains('$'));
        assert!(sqlite.contains("LIMIT ?5"));
    }

    #[test]
    fn test_lock_statements_per_dialect() {
        assert!(write_lock_execution(Dialect::Postgres).contains("FOR UPDATE"));
        assert!(read_lock_execution(Dialect::Postgres).contains("FOR SHARE"));
        assert!(write_lock_execution(Dialect::Sqlite).contains("RETURNING next_event_id"));
        assert!(
            read_lock_execution(Dialect::Sqlite)
                .trim_start()
                .starts_with("UPDATE executions")
        );
        assert!(!lock_current_execution_join_execution(Dialect::Sqlite).contains("FOR UPDATE"));
        assert!(
            lock_current_execution_join_execution(Dialect::Postgres)
                .contains("e.last_write_version")
        );
    }
}

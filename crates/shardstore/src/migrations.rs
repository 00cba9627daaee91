// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for shardstore.
//!
//! The schema ships as embedded sqlx migrations, one set per engine. Table names
//! and key columns are the compatibility surface shared with other readers of the
//! same database.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use shardstore::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;
use tracing::info;

/// PostgreSQL migrator with the shard schema embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with the shard schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await?;
    info!(migrations = POSTGRES.iter().count(), "PostgreSQL schema up to date");
    Ok(())
}

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await?;
    info!(migrations = SQLITE.iter().count(), "SQLite schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        run_sqlite(&pool).await.unwrap();
        run_sqlite(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "buffered_events",
                "cross_cluster_tasks",
                "current_executions",
                "executions",
                "replication_tasks",
                "replication_tasks_dlq",
                "timer_tasks",
                "transfer_tasks",
            ]
        );
    }

    #[test]
    fn test_both_engines_ship_the_same_migrations() {
        let postgres: Vec<i64> = POSTGRES.iter().map(|m| m.version).collect();
        let sqlite: Vec<i64> = SQLITE.iter().map(|m| m.version).collect();
        assert_eq!(postgres, sqlite);
        assert!(!postgres.is_empty());
    }
}

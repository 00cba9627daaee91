// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! shardstore-migrate
//!
//! Applies the embedded schema to the database named by `SHARDSTORE_DATABASE_URL`
//! and verifies the connection. Intended to run once per deploy, before any
//! shard owner starts.

use anyhow::Result;
use tracing::{error, info};

use shardstore::config::StoreConfig;
use shardstore::persistence;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shardstore=info".parse()?),
        )
        .init();

    info!("Starting shardstore migration");

    let mut config = StoreConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    config.run_migrations = true;

    info!(
        backend = ?config.backend,
        max_connections = config.max_connections,
        lock_timeout_ms = config.lock_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let store = persistence::connect(&config).await.map_err(|e| {
        error!(error_code = e.error_code(), "Failed to open shard store: {}", e);
        e
    })?;

    store.health_check().await?;
    info!("Database health check passed");

    info!("Shard store schema is up to date");
    Ok(())
}

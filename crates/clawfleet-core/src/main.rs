// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clawfleet - Fleet Lifecycle and Upgrade Orchestration Server
//!
//! Runs the periodic fleet workers against a shared runtime store:
//! - Health monitor (marks runtimes that stopped reporting offline)
//! - Upgrade timeout sweeper (fails upgrades stuck past their deadline)

use std::sync::Arc;
use tracing::{info, warn};

use clawfleet_core::collaborators::{
    LoggingPresence, RUNTIME_SERVICE_KEY_FLAG, StaticFeatureFlags,
};
use clawfleet_core::config::Config;
use clawfleet_core::persistence::{PostgresRuntimeStore, RuntimeStore, SqliteRuntimeStore};
use clawfleet_core::runtime::FleetRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clawfleet_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        db_max_connections = config.db_max_connections,
        health_poll_interval_secs = config.health_poll_interval.as_secs(),
        stale_threshold_secs = config.stale_threshold.as_secs(),
        upgrade_timeout_secs = config.upgrade_timeout.as_secs(),
        "Starting Clawfleet"
    );

    // Connect and migrate
    let store: Arc<dyn RuntimeStore> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqliteRuntimeStore::connect(&config.database_url, config.db_max_connections).await?)
    } else {
        Arc::new(
            PostgresRuntimeStore::connect(&config.database_url, config.db_max_connections).await?,
        )
    };

    if !store.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Connected to database");

    let flags = StaticFeatureFlags::new();
    match &config.service_key {
        Some(key) => flags.set_flag(RUNTIME_SERVICE_KEY_FLAG, key.as_str()),
        None => warn!("CLAWFLEET_SERVICE_KEY not set; runtime process reports will be rejected"),
    }

    let runtime = FleetRuntime::builder()
        .store(store)
        .presence(Arc::new(LoggingPresence))
        .flags(Arc::new(flags))
        .health_monitor_config(config.health_monitor_config())
        .upgrade_sweeper_config(config.upgrade_sweeper_config())
        .build()?
        .start()
        .await?;

    info!("Clawfleet ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Clawfleet shut down");

    Ok(())
}

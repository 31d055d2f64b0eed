// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for clawfleet.
//!
//! [`FleetRuntime`] wires a [`RuntimeStore`] and the collaborators into a
//! registry, builds the handler state, and spawns the two periodic workers
//! (health monitor and upgrade timeout sweeper) inside an existing tokio
//! application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use clawfleet_core::collaborators::LoggingPresence;
//! use clawfleet_core::persistence::SqliteRuntimeStore;
//! use clawfleet_core::runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteRuntimeStore::from_path("fleet.db").await?;
//!
//!     let runtime = FleetRuntime::builder()
//!         .store(Arc::new(store))
//!         .presence(Arc::new(LoggingPresence))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve runtime.state() through your transport ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::collaborators::{
    AgentPresence, DenyAllAuthorizer, FeatureFlags, StaticFeatureFlags, TenantAuthorizer,
};
use crate::handlers::FleetHandlerState;
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig};
use crate::persistence::RuntimeStore;
use crate::registry::RuntimeRegistry;
use crate::upgrade_sweeper::{UpgradeSweeperConfig, UpgradeTimeoutSweeper};

/// Builder for [`FleetRuntime`].
#[derive(Default)]
pub struct FleetRuntimeBuilder {
    store: Option<Arc<dyn RuntimeStore>>,
    presence: Option<Arc<dyn AgentPresence>>,
    authorizer: Option<Arc<dyn TenantAuthorizer>>,
    flags: Option<Arc<dyn FeatureFlags>>,
    health_monitor_config: HealthMonitorConfig,
    upgrade_sweeper_config: UpgradeSweeperConfig,
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default worker settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime store (required).
    pub fn store(mut self, store: Arc<dyn RuntimeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the agent-presence collaborator (required).
    pub fn presence(mut self, presence: Arc<dyn AgentPresence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Set the tenant authorizer (default: nobody is a tenant admin).
    pub fn authorizer(mut self, authorizer: Arc<dyn TenantAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Set the feature-flag collaborator (default: empty flag store).
    pub fn flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Set the health monitor settings.
    pub fn health_monitor_config(mut self, config: HealthMonitorConfig) -> Self {
        self.health_monitor_config = config;
        self
    }

    /// Set the upgrade sweeper settings.
    pub fn upgrade_sweeper_config(mut self, config: UpgradeSweeperConfig) -> Self {
        self.upgrade_sweeper_config = config;
        self
    }

    /// Validate and produce the runtime configuration.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let presence = self
            .presence
            .ok_or_else(|| anyhow::anyhow!("presence is required"))?;
        if self.health_monitor_config.poll_interval.is_zero()
            || self.upgrade_sweeper_config.poll_interval.is_zero()
        {
            anyhow::bail!("worker poll intervals must be non-zero");
        }

        Ok(FleetRuntimeConfig {
            store,
            presence,
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(DenyAllAuthorizer)),
            flags: self
                .flags
                .unwrap_or_else(|| Arc::new(StaticFeatureFlags::new())),
            health_monitor_config: self.health_monitor_config,
            upgrade_sweeper_config: self.upgrade_sweeper_config,
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    store: Arc<dyn RuntimeStore>,
    presence: Arc<dyn AgentPresence>,
    authorizer: Arc<dyn TenantAuthorizer>,
    flags: Arc<dyn FeatureFlags>,
    health_monitor_config: HealthMonitorConfig,
    upgrade_sweeper_config: UpgradeSweeperConfig,
}

impl FleetRuntimeConfig {
    /// Start the runtime, spawning the health monitor and upgrade sweeper tasks.
    pub async fn start(self) -> Result<FleetRuntime> {
        let registry = RuntimeRegistry::new(self.store, self.presence);

        let state = Arc::new(
            FleetHandlerState::new(registry.clone(), self.authorizer, self.flags)
                .with_upgrade_timeout(self.upgrade_sweeper_config.timeout)
                .with_sweep_limit(self.upgrade_sweeper_config.limit),
        );

        let health_monitor = HealthMonitor::new(registry.clone(), self.health_monitor_config);
        let health_shutdown = health_monitor.shutdown_handle();
        let health_handle = tokio::spawn(async move {
            health_monitor.run().await;
        });

        let upgrade_sweeper = UpgradeTimeoutSweeper::new(registry, self.upgrade_sweeper_config);
        let sweeper_shutdown = upgrade_sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            upgrade_sweeper.run().await;
        });

        info!("FleetRuntime started");

        Ok(FleetRuntime {
            health_handle,
            sweeper_handle,
            health_shutdown,
            sweeper_shutdown,
            state,
        })
    }
}

/// A running clawfleet engine that can be embedded in an application.
///
/// The runtime manages:
/// - Health monitor for marking stale runtimes offline
/// - Upgrade timeout sweeper for failing stuck upgrades
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FleetRuntime {
    health_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    health_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
    state: Arc<FleetHandlerState>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<FleetHandlerState> {
        &self.state
    }

    /// Get the runtime registry.
    pub fn registry(&self) -> &RuntimeRegistry {
        &self.state.registry
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals both workers to stop, then waits for them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.health_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        let mut panicked = false;

        if let Err(e) = self.health_handle.await {
            error!("Health monitor task panicked: {}", e);
            panicked = true;
        }

        if let Err(e) = self.sweeper_handle.await {
            error!("Upgrade timeout sweeper task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            anyhow::bail!("worker task panicked during shutdown");
        }

        info!("FleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.health_handle.is_finished() && !self.sweeper_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LoggingPresence;
    use crate::persistence::SqliteRuntimeStore;
    use std::time::Duration;

    #[test]
    fn test_build_requires_store_and_presence() {
        let err = FleetRuntime::builder()
            .presence(Arc::new(LoggingPresence))
            .build()
            .err()
            .expect("missing store must fail");
        assert!(err.to_string().contains("store is required"));
    }

    #[tokio::test]
    async fn test_build_rejects_zero_poll_interval() {
        let store = SqliteRuntimeStore::in_memory().await.unwrap();
        let result = FleetRuntime::builder()
            .store(Arc::new(store))
            .presence(Arc::new(LoggingPresence))
            .health_monitor_config(HealthMonitorConfig {
                poll_interval: Duration::ZERO,
                stale_threshold: Duration::from_secs(90),
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = SqliteRuntimeStore::in_memory().await.unwrap();
        let runtime = FleetRuntime::builder()
            .store(Arc::new(store))
            .presence(Arc::new(LoggingPresence))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that fails upgrades stuck past their deadline.
//!
//! A runtime that crashed before reporting its upgrade result would otherwise
//! keep its pending slot forever and never be eligible for another rolling
//! wave. Each expired slot is completed as `failed` with
//! [`UPGRADE_TIMEOUT_ERROR`] and the runtime goes to `error`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub use crate::upgrade::UPGRADE_TIMEOUT_ERROR;

use crate::error::{FleetError, Result};
use crate::model::{Runtime, Versions};
use crate::registry::RuntimeRegistry;

/// Default pending-upgrade deadline.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Smallest accepted pending-upgrade deadline.
pub const MIN_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolve a requested timeout: default when absent, never below the minimum.
pub fn clamp_upgrade_timeout(timeout: Option<Duration>) -> Duration {
    timeout
        .unwrap_or(DEFAULT_UPGRADE_TIMEOUT)
        .max(MIN_UPGRADE_TIMEOUT)
}

/// Configuration for the upgrade timeout sweeper.
#[derive(Debug, Clone)]
pub struct UpgradeSweeperConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Pending-upgrade deadline (clamped with [`clamp_upgrade_timeout`]).
    pub timeout: Duration,
    /// Maximum pending upgrades scanned per pass; `None` scans all of them.
    pub limit: Option<i64>,
}

impl Default for UpgradeSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            timeout: DEFAULT_UPGRADE_TIMEOUT,
            limit: None,
        }
    }
}

/// A pending upgrade older than the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOutUpgrade {
    /// Owning tenant.
    pub tenant_id: String,
    /// Upgrade target.
    pub target: Versions,
    /// When the upgrade was requested.
    pub initiated_at: DateTime<Utc>,
    /// Time since the request.
    pub age: chrono::Duration,
}

/// Aggregate result of one timeout pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSweepReport {
    /// Pending upgrades examined.
    pub scanned: usize,
    /// Pending upgrades failed by this pass.
    pub timed_out: usize,
    /// Runtimes whose write failed.
    pub failed: usize,
}

/// Pending upgrades older than `timeout` at `now`.
pub fn find_timed_out_upgrades(
    now: DateTime<Utc>,
    runtimes: &[Runtime],
    timeout: chrono::Duration,
) -> Vec<TimedOutUpgrade> {
    runtimes
        .iter()
        .filter_map(|runtime| {
            let pending = runtime.pending_upgrade.as_ref()?;
            let age = pending.age(now);
            (age > timeout).then(|| TimedOutUpgrade {
                tenant_id: runtime.tenant_id.clone(),
                target: pending.target(),
                initiated_at: pending.initiated_at,
                age,
            })
        })
        .collect()
}

/// Run one timeout pass.
///
/// `timeout` is clamped with [`clamp_upgrade_timeout`]. `limit` bounds the
/// pending upgrades scanned, oldest request first, so expired slots are always
/// reached before younger ones. Each expired slot is failed independently; a
/// slot that changed since the scan is skipped.
pub async fn sweep_upgrade_timeouts(
    registry: &RuntimeRegistry,
    now: DateTime<Utc>,
    timeout: Option<Duration>,
    limit: Option<i64>,
) -> Result<UpgradeSweepReport> {
    let timeout = chrono::Duration::from_std(clamp_upgrade_timeout(timeout))
        .map_err(|e| FleetError::Other(format!("Invalid duration: {}", e)))?;

    let runtimes = registry.list_pending_upgrades(limit).await?;
    let expired = find_timed_out_upgrades(now, &runtimes, timeout);

    let mut report = UpgradeSweepReport {
        scanned: runtimes.len(),
        ..UpgradeSweepReport::default()
    };

    if expired.is_empty() {
        debug!(scanned = report.scanned, "No timed-out upgrades found");
        return Ok(report);
    }

    for upgrade in expired {
        match registry
            .fail_timed_out_upgrade(&upgrade.tenant_id, upgrade.initiated_at, now)
            .await
        {
            Ok(Some(_)) => {
                report.timed_out += 1;
                warn!(
                    tenant_id = %upgrade.tenant_id,
                    target = %upgrade.target,
                    age_secs = upgrade.age.num_seconds(),
                    "Pending upgrade timed out"
                );
            }
            Ok(None) => {
                debug!(tenant_id = %upgrade.tenant_id, "Upgrade completed since scan, skipping");
            }
            Err(e) if e.is_not_found() => {
                debug!(tenant_id = %upgrade.tenant_id, "Runtime vanished, skipping");
            }
            Err(e) => {
                report.failed += 1;
                error!(
                    tenant_id = %upgrade.tenant_id,
                    error = %e,
                    "Failed to time out pending upgrade"
                );
            }
        }
    }

    info!(
        scanned = report.scanned,
        timed_out = report.timed_out,
        failed = report.failed,
        "Upgrade timeout sweep completed"
    );

    Ok(report)
}

/// Background worker that periodically fails expired pending upgrades.
pub struct UpgradeTimeoutSweeper {
    registry: RuntimeRegistry,
    config: UpgradeSweeperConfig,
    shutdown: Arc<Notify>,
}

impl UpgradeTimeoutSweeper {
    /// Create a new sweeper.
    pub fn new(registry: RuntimeRegistry, config: UpgradeSweeperConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            timeout_secs = clamp_upgrade_timeout(Some(self.config.timeout)).as_secs(),
            limit = ?self.config.limit,
            "Upgrade timeout sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Upgrade timeout sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = sweep_upgrade_timeouts(
                        &self.registry,
                        Utc::now(),
                        Some(self.config.timeout),
                        self.config.limit,
                    )
                    .await
                    {
                        error!(error = %e, "Failed to sweep upgrade timeouts");
                    }
                }
            }
        }

        info!("Upgrade timeout sweeper stopped");
    }
}

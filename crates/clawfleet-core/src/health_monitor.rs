// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting runtimes that stopped reporting.
//!
//! A runtime that is `online` or `degraded` but has not sent a health report
//! within the stale threshold is marked `offline`. This is how an ungraceful
//! process death (crash, forced kill) is detected when the instance cannot
//! report its own shutdown. Runtimes that never reported are left alone.
//!
//! Detection ([`find_stale_runtimes`]) is a pure function of the clock and a
//! runtime listing; [`sweep_stale_runtimes`] applies it through the registry,
//! one independent write per runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, Result};
use crate::model::{Runtime, RuntimeStatus};
use crate::registry::RuntimeRegistry;

/// Configuration for the health monitor.
///
/// The default threshold tolerates roughly three missed reports at a 30
/// second reporting cadence.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to check for stale runtimes.
    pub poll_interval: Duration,
    /// Maximum time since the last health report before marking offline.
    pub stale_threshold: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(90),
        }
    }
}

/// A live runtime whose last health report is older than the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRuntime {
    /// Owning tenant.
    pub tenant_id: String,
    /// Status at detection time.
    pub status: RuntimeStatus,
    /// Last accepted health report.
    pub last_health_check: DateTime<Utc>,
    /// Time since that report.
    pub age: chrono::Duration,
}

/// Aggregate result of one staleness pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessReport {
    /// Runtimes examined.
    pub scanned: usize,
    /// Runtimes transitioned to `offline`.
    pub marked_offline: usize,
    /// Runtimes whose write failed.
    pub failed: usize,
}

/// Live runtimes whose health report age exceeds `threshold` at `now`.
pub fn find_stale_runtimes(
    now: DateTime<Utc>,
    runtimes: &[Runtime],
    threshold: chrono::Duration,
) -> Vec<StaleRuntime> {
    runtimes
        .iter()
        .filter(|runtime| runtime.status.is_live())
        .filter_map(|runtime| {
            let last_health_check = runtime.last_health_check?;
            let age = now - last_health_check;
            (age > threshold).then(|| StaleRuntime {
                tenant_id: runtime.tenant_id.clone(),
                status: runtime.status,
                last_health_check,
                age,
            })
        })
        .collect()
}

/// Run one staleness pass over the whole fleet.
///
/// Each stale runtime is written independently; a failed or missing row
/// never stops the pass.
pub async fn sweep_stale_runtimes(
    registry: &RuntimeRegistry,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Result<StalenessReport> {
    let runtimes = registry.list_all(None).await?;
    let stale = find_stale_runtimes(now, &runtimes, threshold);

    let mut report = StalenessReport {
        scanned: runtimes.len(),
        ..StalenessReport::default()
    };

    if stale.is_empty() {
        debug!(scanned = report.scanned, "No stale runtimes found");
        return Ok(report);
    }

    for runtime in stale {
        warn!(
            tenant_id = %runtime.tenant_id,
            status = %runtime.status,
            last_health_check = %runtime.last_health_check,
            age_secs = runtime.age.num_seconds(),
            "Runtime health report is stale, marking offline"
        );

        match registry
            .mark_offline_if_stale(&runtime.tenant_id, threshold, now)
            .await
        {
            Ok(true) => report.marked_offline += 1,
            Ok(false) => {
                debug!(tenant_id = %runtime.tenant_id, "Runtime reported since detection, skipping");
            }
            Err(e) if e.is_not_found() => {
                debug!(tenant_id = %runtime.tenant_id, "Runtime vanished, skipping");
            }
            Err(e) => {
                report.failed += 1;
                error!(
                    tenant_id = %runtime.tenant_id,
                    error = %e,
                    "Failed to mark stale runtime offline"
                );
            }
        }
    }

    info!(
        scanned = report.scanned,
        marked_offline = report.marked_offline,
        failed = report.failed,
        "Staleness sweep completed"
    );

    Ok(report)
}

/// Background worker that periodically marks stale runtimes offline.
pub struct HealthMonitor {
    registry: RuntimeRegistry,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(registry: RuntimeRegistry, config: HealthMonitorConfig) -> Self {
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

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_stale_runtimes().await {
                        error!(error = %e, "Failed to check stale runtimes");
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    async fn check_stale_runtimes(&self) -> Result<StalenessReport> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .map_err(|e| FleetError::Other(format!("Invalid duration: {}", e)))?;
        sweep_stale_runtimes(&self.registry, Utc::now(), threshold).await
    }
}

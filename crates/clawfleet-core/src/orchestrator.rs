// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet-wide upgrade orchestration: canary, rolling waves, and rollback.
//!
//! Rolling upgrades read one snapshot of the fleet and then issue one
//! independent conditional write per selected runtime. A crash mid-batch
//! leaves a prefix enqueued; re-running the wave skips those runtimes because
//! they now have a pending upgrade.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{FleetError, Result};
use crate::model::{PendingUpgrade, Runtime, UpgradeHistoryEntry, UpgradeStrategy, Versions};
use crate::registry::RuntimeRegistry;
use crate::upgrade::record_rollback_decision;

/// `initiatedBy` tag for upgrades enqueued by rolling waves.
pub const FLEET_ORCHESTRATOR_INITIATOR: &str = "fleet-orchestrator";

/// Default rolling batch size, as a percentage of eligible runtimes.
pub const DEFAULT_BATCH_PERCENT: u32 = 10;

/// Clamp a requested batch percentage to `[1, 100]`, defaulting to
/// [`DEFAULT_BATCH_PERCENT`].
pub fn clamp_batch_percent(percent: Option<u32>) -> u32 {
    percent.unwrap_or(DEFAULT_BATCH_PERCENT).clamp(1, 100)
}

/// `ceil(eligible * percent / 100)`, at least 1 when anything is eligible.
pub fn rolling_batch_size(eligible: usize, percent: u32) -> usize {
    if eligible == 0 {
        return 0;
    }
    (eligible * percent as usize).div_ceil(100).max(1)
}

/// Rollback target: source versions of the most recent successful upgrade,
/// or the current versions if none exists.
pub fn resolve_rollback_target(runtime: &Runtime) -> Versions {
    runtime
        .upgrade_history
        .last_success()
        .map(UpgradeHistoryEntry::from_versions)
        .unwrap_or_else(|| runtime.versions())
}

/// Aggregate result of one rolling wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpgradeReport {
    /// Runtimes that received a pending upgrade in this wave.
    pub requested: usize,
    /// Runtimes without a pending upgrade when the wave started.
    pub total_without_pending: usize,
    /// Selected runtimes whose write failed.
    pub failed: usize,
}

/// Result of a rollback decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    /// Versions the runtime is rolled back to.
    pub target: Versions,
    /// The `rolled_back` history entry that was appended.
    pub entry: UpgradeHistoryEntry,
    /// Pending upgrade set to re-apply `target`, when requested.
    pub pending: Option<PendingUpgrade>,
}

/// Fleet orchestrator over the runtime registry.
#[derive(Clone)]
pub struct FleetOrchestrator {
    registry: RuntimeRegistry,
}

impl FleetOrchestrator {
    /// Create an orchestrator.
    pub fn new(registry: RuntimeRegistry) -> Self {
        Self { registry }
    }

    /// The registry this orchestrator writes through.
    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    /// Enqueue a canary upgrade on one tenant's runtime.
    pub async fn run_canary_upgrade(
        &self,
        tenant_id: &str,
        target: &Versions,
        initiated_by: &str,
    ) -> Result<PendingUpgrade> {
        self.run_canary_upgrade_at(tenant_id, target, initiated_by, Utc::now())
            .await
    }

    /// [`Self::run_canary_upgrade`] with an explicit clock.
    pub async fn run_canary_upgrade_at(
        &self,
        tenant_id: &str,
        target: &Versions,
        initiated_by: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingUpgrade> {
        let pending = self
            .registry
            .request_upgrade_at(tenant_id, target, UpgradeStrategy::Canary, initiated_by, now)
            .await?;
        info!(tenant_id = %tenant_id, target = %target, "Canary upgrade enqueued");
        Ok(pending)
    }

    /// Enqueue the next rolling wave.
    pub async fn run_rolling_upgrade(
        &self,
        target: &Versions,
        batch_percent: Option<u32>,
    ) -> Result<RollingUpgradeReport> {
        self.run_rolling_upgrade_at(target, batch_percent, Utc::now())
            .await
    }

    /// [`Self::run_rolling_upgrade`] with an explicit clock.
    ///
    /// Selects the first `batch` runtimes without a pending upgrade, in
    /// listing order. Each write is conditional on the slot still being empty,
    /// so a runtime that gained a pending upgrade after the snapshot is skipped.
    pub async fn run_rolling_upgrade_at(
        &self,
        target: &Versions,
        batch_percent: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<RollingUpgradeReport> {
        if target.is_incomplete() {
            return Err(FleetError::InvalidRequest(
                "target versions must name both components".to_string(),
            ));
        }

        let percent = clamp_batch_percent(batch_percent);
        let runtimes = self.registry.list_all(None).await?;
        let eligible: Vec<&Runtime> = runtimes
            .iter()
            .filter(|runtime| !runtime.has_pending_upgrade())
            .collect();
        let batch = rolling_batch_size(eligible.len(), percent);

        let pending = PendingUpgrade::new(
            target,
            UpgradeStrategy::Rolling,
            FLEET_ORCHESTRATOR_INITIATOR,
            now,
        );

        let mut report = RollingUpgradeReport {
            total_without_pending: eligible.len(),
            ..RollingUpgradeReport::default()
        };

        for runtime in eligible.into_iter().take(batch) {
            match self
                .registry
                .enqueue_if_idle(&runtime.tenant_id, &pending, now)
                .await
            {
                Ok(true) => report.requested += 1,
                Ok(false) => {
                    debug!(
                        tenant_id = %runtime.tenant_id,
                        "Runtime gained a pending upgrade since the snapshot, skipping"
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!(tenant_id = %runtime.tenant_id, "Runtime vanished, skipping");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        tenant_id = %runtime.tenant_id,
                        error = %e,
                        "Failed to enqueue rolling upgrade"
                    );
                }
            }
        }

        info!(
            target = %target,
            batch_percent = percent,
            requested = report.requested,
            total_without_pending = report.total_without_pending,
            failed = report.failed,
            "Rolling upgrade wave enqueued"
        );

        Ok(report)
    }

    /// Roll a tenant's runtime back to the versions before its last success.
    pub async fn rollback_runtime(
        &self,
        tenant_id: &str,
        initiated_by: &str,
        apply: bool,
    ) -> Result<RollbackOutcome> {
        self.rollback_runtime_at(tenant_id, initiated_by, apply, Utc::now())
            .await
    }

    /// [`Self::rollback_runtime`] with an explicit clock.
    ///
    /// Always records the decision as a `rolled_back` entry. With `apply`,
    /// also sets an `immediate` pending upgrade targeting the recovered versions.
    pub async fn rollback_runtime_at(
        &self,
        tenant_id: &str,
        initiated_by: &str,
        apply: bool,
        now: DateTime<Utc>,
    ) -> Result<RollbackOutcome> {
        let (_, outcome) = self
            .registry
            .modify_runtime(tenant_id, now, |runtime| {
                let target = resolve_rollback_target(runtime);
                let entry = record_rollback_decision(runtime, &target, initiated_by, now);
                let pending = apply.then(|| {
                    PendingUpgrade::new(&target, UpgradeStrategy::Immediate, initiated_by, now)
                });
                runtime.pending_upgrade.clone_from(&pending);
                Ok(RollbackOutcome {
                    target,
                    entry,
                    pending,
                })
            })
            .await?;

        info!(
            tenant_id = %tenant_id,
            target = %outcome.target,
            apply,
            "Runtime rolled back"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuntimeConfig, RuntimeStatus, UpgradeOutcome};

    #[test]
    fn test_clamp_batch_percent() {
        assert_eq!(clamp_batch_percent(None), 10);
        assert_eq!(clamp_batch_percent(Some(0)), 1);
        assert_eq!(clamp_batch_percent(Some(250)), 100);
        assert_eq!(clamp_batch_percent(Some(35)), 35);
    }

    #[test]
    fn test_rolling_batch_size() {
        assert_eq!(rolling_batch_size(0, 10), 0);
        assert_eq!(rolling_batch_size(3, 10), 1);
        assert_eq!(rolling_batch_size(10, 10), 1);
        assert_eq!(rolling_batch_size(11, 10), 2);
        assert_eq!(rolling_batch_size(25, 50), 13);
        assert_eq!(rolling_batch_size(7, 100), 7);
    }

    #[test]
    fn test_resolve_rollback_target_uses_last_success_source() {
        let now = Utc::now();
        let mut runtime = Runtime::new(
            "tenant-a",
            RuntimeStatus::Online,
            &RuntimeConfig::with_versions(&Versions::new("v3", "r3")),
            now,
        );
        for (from, to, status) in [
            ("v1", "v2", UpgradeOutcome::Success),
            ("v2", "v3", UpgradeOutcome::Success),
            ("v3", "v4", UpgradeOutcome::Failed),
        ] {
            runtime.upgrade_history.push(UpgradeHistoryEntry {
                from_openclaw_version: from.to_string(),
                to_openclaw_version: to.to_string(),
                from_runtime_version: from.replace('v', "r"),
                to_runtime_version: to.replace('v', "r"),
                status,
                started_at: now,
                completed_at: now,
                duration: None,
                error: None,
                initiated_by: "admin".to_string(),
            });
        }

        assert_eq!(resolve_rollback_target(&runtime), Versions::new("v2", "r2"));
    }

    #[test]
    fn test_resolve_rollback_target_falls_back_to_current() {
        let runtime = Runtime::new(
            "tenant-a",
            RuntimeStatus::Online,
            &RuntimeConfig::with_versions(&Versions::new("v1", "r1")),
            Utc::now(),
        );
        assert_eq!(resolve_rollback_target(&runtime), Versions::new("v1", "r1"));
    }
}

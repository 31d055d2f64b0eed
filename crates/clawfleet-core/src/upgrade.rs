// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-runtime upgrade state machine.
//!
//! ```text
//!            request_upgrade              success / failed / rolled_back
//!   Idle ─────────────────────▶ Pending ─────────────────────────────────▶ Idle
//!    ▲                            │          (history entry appended)
//!    └────── clear_upgrade_request┘
//!            (no history entry)
//! ```
//!
//! The transitions are pure functions over a [`Runtime`] and are committed
//! through the registry's single-row write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::model::{
    PendingUpgrade, Runtime, RuntimeStatus, UpgradeHistoryEntry, UpgradeOutcome, UpgradeStrategy,
    Versions, sanitize_error,
};
use crate::registry::RuntimeRegistry;

/// Error recorded when a pending upgrade exceeds its deadline.
pub const UPGRADE_TIMEOUT_ERROR: &str = "Upgrade timed out";

/// Completion callback payload sent by a runtime process after attempting an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResult {
    /// Terminal outcome of the attempt.
    pub status: UpgradeOutcome,
    /// Versions before the attempt.
    pub from: Versions,
    /// Versions the attempt targeted.
    pub to: Versions,
    /// Duration in milliseconds, when the runtime measured it.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Raw error text; sanitized before storage.
    #[serde(default)]
    pub error: Option<String>,
    /// Identity that requested the attempt. Empty falls back to the pending request's.
    #[serde(default)]
    pub initiated_by: String,
}

/// Outcome of [`RuntimeRegistry::record_upgrade_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The pending upgrade was completed with this history entry.
    Recorded(UpgradeHistoryEntry),
    /// Nothing was pending (already completed, cleared, or timed out).
    NoPendingUpgrade,
    /// A different upgrade is pending; the result belongs to an earlier request.
    TargetMismatch {
        /// Target of the request that is still pending.
        pending: Versions,
    },
}

/// A terminal transition to apply to a runtime.
#[derive(Debug, Clone)]
pub struct UpgradeCompletion {
    /// Terminal outcome.
    pub outcome: UpgradeOutcome,
    /// Versions before the attempt.
    pub from: Versions,
    /// Versions the attempt targeted.
    pub to: Versions,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Raw error text.
    pub error: Option<String>,
    /// Identity that requested the attempt.
    pub initiated_by: String,
}

/// Apply a terminal transition: append history, clear the pending slot, and
/// set the visible status (`online` on success and rollback, `error` on
/// failure). Versions only move on success.
pub fn apply_completion(
    runtime: &mut Runtime,
    completion: UpgradeCompletion,
    now: DateTime<Utc>,
) -> UpgradeHistoryEntry {
    let entry = UpgradeHistoryEntry {
        from_openclaw_version: completion.from.openclaw_version,
        to_openclaw_version: completion.to.openclaw_version.clone(),
        from_runtime_version: completion.from.runtime_service_version,
        to_runtime_version: completion.to.runtime_service_version.clone(),
        status: completion.outcome,
        started_at: completion.started_at,
        completed_at: now,
        duration: completion.duration_ms,
        error: completion
            .error
            .as_deref()
            .map(sanitize_error)
            .filter(|e| !e.is_empty()),
        initiated_by: completion.initiated_by,
    };

    runtime.pending_upgrade = None;
    match completion.outcome {
        UpgradeOutcome::Success => {
            runtime.status = RuntimeStatus::Online;
            runtime.set_versions(&completion.to);
        }
        UpgradeOutcome::Failed => runtime.status = RuntimeStatus::Error,
        UpgradeOutcome::RolledBack => runtime.status = RuntimeStatus::Online,
    }
    runtime.upgrade_history.push(entry.clone());
    entry
}

/// Treat a generic report of the pending target versions as a successful completion.
///
/// `previous` are the versions stored before the report was applied. Returns
/// the appended entry, or `None` when nothing is pending or the report does
/// not carry both target versions. The visible status is left as reported.
pub fn complete_if_target_reported(
    runtime: &mut Runtime,
    previous: &Versions,
    reported: Option<Versions>,
    now: DateTime<Utc>,
) -> Option<UpgradeHistoryEntry> {
    let reported = reported?;
    if !runtime.pending_upgrade.as_ref()?.is_target(&reported) {
        return None;
    }
    let pending = runtime.pending_upgrade.take()?;

    let entry = UpgradeHistoryEntry {
        from_openclaw_version: previous.openclaw_version.clone(),
        to_openclaw_version: reported.openclaw_version,
        from_runtime_version: previous.runtime_service_version.clone(),
        to_runtime_version: reported.runtime_service_version,
        status: UpgradeOutcome::Success,
        started_at: pending.initiated_at,
        completed_at: now,
        duration: Some(pending.age(now).num_milliseconds()),
        error: None,
        initiated_by: pending.initiated_by,
    };
    runtime.upgrade_history.push(entry.clone());
    Some(entry)
}

/// Record a rollback decision: clear any pending upgrade and append a
/// `rolled_back` entry from the current versions to `target`. The visible
/// status is unchanged.
pub fn record_rollback_decision(
    runtime: &mut Runtime,
    target: &Versions,
    initiated_by: &str,
    now: DateTime<Utc>,
) -> UpgradeHistoryEntry {
    let current = runtime.versions();
    let entry = UpgradeHistoryEntry {
        from_openclaw_version: current.openclaw_version,
        to_openclaw_version: target.openclaw_version.clone(),
        from_runtime_version: current.runtime_service_version,
        to_runtime_version: target.runtime_service_version.clone(),
        status: UpgradeOutcome::RolledBack,
        started_at: now,
        completed_at: now,
        duration: None,
        error: None,
        initiated_by: initiated_by.to_string(),
    };
    runtime.pending_upgrade = None;
    runtime.upgrade_history.push(entry.clone());
    entry
}

impl RuntimeRegistry {
    /// Set the pending upgrade for a tenant's runtime.
    ///
    /// A newer request replaces any pending one (last request wins).
    pub async fn request_upgrade(
        &self,
        tenant_id: &str,
        target: &Versions,
        strategy: UpgradeStrategy,
        initiated_by: &str,
    ) -> Result<PendingUpgrade> {
        self.request_upgrade_at(tenant_id, target, strategy, initiated_by, Utc::now())
            .await
    }

    /// [`Self::request_upgrade`] with an explicit clock.
    pub async fn request_upgrade_at(
        &self,
        tenant_id: &str,
        target: &Versions,
        strategy: UpgradeStrategy,
        initiated_by: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingUpgrade> {
        if target.is_incomplete() {
            return Err(FleetError::InvalidRequest(
                "target versions must name both components".to_string(),
            ));
        }

        let pending = PendingUpgrade::new(target, strategy, initiated_by, now);
        let (_, superseded) = self
            .modify_runtime(tenant_id, now, |runtime| {
                Ok(runtime.pending_upgrade.replace(pending.clone()))
            })
            .await?;

        if let Some(previous) = superseded {
            warn!(
                tenant_id = %tenant_id,
                superseded_target = %previous.target(),
                superseded_by = %previous.initiated_by,
                "Pending upgrade superseded by newer request"
            );
        }
        info!(
            tenant_id = %tenant_id,
            target = %target,
            strategy = %strategy,
            initiated_by = %initiated_by,
            "Upgrade requested"
        );

        Ok(pending)
    }

    /// Clear the pending upgrade without recording history.
    ///
    /// Returns the cleared request, or `None` if nothing was pending.
    pub async fn clear_upgrade_request(&self, tenant_id: &str) -> Result<Option<PendingUpgrade>> {
        let cleared = self
            .update_runtime(tenant_id, Utc::now(), |runtime| {
                Ok(runtime.pending_upgrade.take())
            })
            .await?
            .map(|(_, pending)| pending);

        if let Some(pending) = &cleared {
            info!(
                tenant_id = %tenant_id,
                target = %pending.target(),
                "Upgrade request cleared"
            );
        }
        Ok(cleared)
    }

    /// Record the outcome reported by a runtime process.
    ///
    /// Applied only when the pending request targets `result.to`. A result for
    /// an earlier request leaves a newer one in place, so retried callbacks
    /// are safe.
    pub async fn record_upgrade_result(
        &self,
        tenant_id: &str,
        result: &UpgradeResult,
    ) -> Result<RecordOutcome> {
        self.record_upgrade_result_at(tenant_id, result, Utc::now())
            .await
    }

    /// [`Self::record_upgrade_result`] with an explicit clock.
    pub async fn record_upgrade_result_at(
        &self,
        tenant_id: &str,
        result: &UpgradeResult,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        let mut mismatched = None;
        let written = self
            .update_runtime(tenant_id, now, |runtime| {
                mismatched = None;
                let Some(pending) = runtime.pending_upgrade.as_ref() else {
                    return Ok(None);
                };
                if !pending.is_target(&result.to) {
                    mismatched = Some(pending.target());
                    return Ok(None);
                }
                let initiated_by = if result.initiated_by.is_empty() {
                    pending.initiated_by.clone()
                } else {
                    result.initiated_by.clone()
                };
                let completion = UpgradeCompletion {
                    outcome: result.status,
                    from: result.from.clone(),
                    to: result.to.clone(),
                    started_at: pending.initiated_at,
                    duration_ms: result.duration_ms,
                    error: result.error.clone(),
                    initiated_by,
                };
                Ok(Some(apply_completion(runtime, completion, now)))
            })
            .await?;

        match written {
            Some((_, entry)) => {
                info!(
                    tenant_id = %tenant_id,
                    outcome = %entry.status,
                    to = %entry.to_versions(),
                    "Upgrade result recorded"
                );
                Ok(RecordOutcome::Recorded(entry))
            }
            None => match mismatched {
                Some(pending) => {
                    warn!(
                        tenant_id = %tenant_id,
                        pending_target = %pending,
                        result_target = %result.to,
                        "Ignoring upgrade result for a request that is no longer pending"
                    );
                    Ok(RecordOutcome::TargetMismatch { pending })
                }
                None => Ok(RecordOutcome::NoPendingUpgrade),
            },
        }
    }

    /// Set `pending` only if the runtime has no upgrade in flight at commit time.
    pub(crate) async fn enqueue_if_idle(
        &self,
        tenant_id: &str,
        pending: &PendingUpgrade,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let written = self
            .update_runtime(tenant_id, now, |runtime| {
                if runtime.has_pending_upgrade() {
                    return Ok(None);
                }
                runtime.pending_upgrade = Some(pending.clone());
                Ok(Some(()))
            })
            .await?;
        Ok(written.is_some())
    }

    /// Force a `failed` completion for a pending upgrade that started at
    /// `initiated_at`. Skipped if the slot now holds a different request or
    /// nothing at all.
    pub(crate) async fn fail_timed_out_upgrade(
        &self,
        tenant_id: &str,
        initiated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<UpgradeHistoryEntry>> {
        let written = self
            .update_runtime(tenant_id, now, |runtime| {
                let Some(pending) = runtime.pending_upgrade.as_ref() else {
                    return Ok(None);
                };
                if pending.initiated_at != initiated_at {
                    return Ok(None);
                }
                let completion = UpgradeCompletion {
                    outcome: UpgradeOutcome::Failed,
                    from: runtime.versions(),
                    to: pending.target(),
                    started_at: pending.initiated_at,
                    duration_ms: Some(pending.age(now).num_milliseconds()),
                    error: Some(UPGRADE_TIMEOUT_ERROR.to_string()),
                    initiated_by: pending.initiated_by.clone(),
                };
                Ok(Some(apply_completion(runtime, completion, now)))
            })
            .await?;

        Ok(written.map(|(_, entry)| entry))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime registry: the single ingestion point for health and version telemetry.
//!
//! Every transition in the engine goes through [`RuntimeRegistry::update_runtime`]:
//! read the row, compute the next row in memory, and commit it conditioned on
//! the revision that was read. A lost race re-reads and recomputes. Presence
//! signals are derived from the committed before/after status and delivered
//! only after the write has landed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collaborators::{AgentPresence, PresenceSignal};
use crate::error::{FleetError, Result};
use crate::model::{Runtime, RuntimeConfig, RuntimeStatus, UpgradeHistoryEntry};
use crate::persistence::RuntimeStore;
use crate::upgrade::complete_if_target_reported;

/// Number of times a single-row write is recomputed after losing a revision race.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Presence signals implied by a status transition.
///
/// Going down (`online`/`degraded` to `offline`) marks agents offline and
/// clears transient presence. Coming up (`offline`/`error`/`provisioning` to
/// `online`) announces the runtime. Same-status writes emit nothing.
pub fn presence_signals(previous: RuntimeStatus, next: RuntimeStatus) -> Vec<PresenceSignal> {
    use RuntimeStatus::*;

    match (previous, next) {
        (prev, next) if prev == next => Vec::new(),
        (Online | Degraded, Offline) => vec![
            PresenceSignal::MarkAgentsOffline,
            PresenceSignal::ClearTransientPresence,
        ],
        (Offline | Error | Provisioning, Online) => vec![PresenceSignal::RuntimeCameUp],
        _ => Vec::new(),
    }
}

/// Result of a status report.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The runtime as committed.
    pub runtime: Runtime,
    /// Whether the report created the row.
    pub created: bool,
    /// History entry appended by implicit upgrade completion, if the report
    /// carried the pending target versions.
    pub completed_upgrade: Option<UpgradeHistoryEntry>,
}

/// Aggregate counts for the fleet view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSummary {
    /// Number of runtimes.
    pub total: usize,
    /// Runtimes in `provisioning`.
    pub provisioning: usize,
    /// Runtimes in `online`.
    pub online: usize,
    /// Runtimes in `degraded`.
    pub degraded: usize,
    /// Runtimes in `offline`.
    pub offline: usize,
    /// Runtimes in `error`.
    pub error: usize,
    /// Runtimes with an upgrade in flight.
    pub pending_upgrades: usize,
}

impl FleetSummary {
    /// Summarize a runtime listing.
    pub fn from_runtimes(runtimes: &[Runtime]) -> Self {
        let mut summary = Self {
            total: runtimes.len(),
            ..Self::default()
        };
        for runtime in runtimes {
            match runtime.status {
                RuntimeStatus::Provisioning => summary.provisioning += 1,
                RuntimeStatus::Online => summary.online += 1,
                RuntimeStatus::Degraded => summary.degraded += 1,
                RuntimeStatus::Offline => summary.offline += 1,
                RuntimeStatus::Error => summary.error += 1,
            }
            if runtime.has_pending_upgrade() {
                summary.pending_upgrades += 1;
            }
        }
        summary
    }
}

/// Registry over a [`RuntimeStore`] that owns every runtime write.
#[derive(Clone)]
pub struct RuntimeRegistry {
    store: Arc<dyn RuntimeStore>,
    presence: Arc<dyn AgentPresence>,
}

impl RuntimeRegistry {
    /// Create a registry.
    pub fn new(store: Arc<dyn RuntimeStore>, presence: Arc<dyn AgentPresence>) -> Self {
        Self { store, presence }
    }

    /// Fetch the runtime for a tenant.
    pub async fn get_by_tenant(&self, tenant_id: &str) -> Result<Option<Runtime>> {
        self.store.get_runtime(tenant_id).await
    }

    /// List runtimes in listing order, optionally bounded.
    pub async fn list_all(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        self.store.list_runtimes(limit).await
    }

    /// Runtimes with an upgrade in flight, oldest request first.
    pub async fn list_pending_upgrades(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        self.store.list_pending_upgrades(limit).await
    }

    /// Counts per status across the whole fleet.
    pub async fn fleet_summary(&self) -> Result<FleetSummary> {
        let runtimes = self.store.list_runtimes(None).await?;
        Ok(FleetSummary::from_runtimes(&runtimes))
    }

    /// Check that the backing store is reachable.
    pub async fn health_check_db(&self) -> Result<bool> {
        self.store.health_check_db().await
    }

    /// Record a status report at the current time.
    pub async fn upsert_status(
        &self,
        tenant_id: &str,
        status: RuntimeStatus,
        config: Option<&RuntimeConfig>,
    ) -> Result<UpsertOutcome> {
        self.upsert_status_at(tenant_id, status, config, Utc::now())
            .await
    }

    /// Record a status report observed at `now`.
    ///
    /// Inserts the row on first report. Otherwise patches status, health
    /// timestamp, and every field present in `config`, then completes the
    /// pending upgrade if the report carries its target versions.
    pub async fn upsert_status_at(
        &self,
        tenant_id: &str,
        status: RuntimeStatus,
        config: Option<&RuntimeConfig>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let config = config.cloned().unwrap_or_default();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            if self.store.get_runtime(tenant_id).await?.is_none() {
                let runtime = Runtime::new(tenant_id, status, &config, now);
                if self.store.insert_runtime(&runtime).await? {
                    info!(
                        tenant_id = %tenant_id,
                        status = %status,
                        "Runtime registered"
                    );
                    self.deliver_presence(tenant_id, RuntimeStatus::Provisioning, status)
                        .await;
                    return Ok(UpsertOutcome {
                        runtime,
                        created: true,
                        completed_upgrade: None,
                    });
                }
                debug!(tenant_id = %tenant_id, "Lost runtime insert race, updating instead");
            }

            let written = self
                .modify_runtime(tenant_id, now, |runtime| {
                    let previous_versions = runtime.versions();
                    config.apply_to(runtime);
                    runtime.status = status;
                    runtime.last_health_check = Some(now);
                    Ok(complete_if_target_reported(
                        runtime,
                        &previous_versions,
                        config.reported_versions(),
                        now,
                    ))
                })
                .await;

            match written {
                Ok((runtime, completed_upgrade)) => {
                    if let Some(entry) = &completed_upgrade {
                        info!(
                            tenant_id = %tenant_id,
                            to = %entry.to_versions(),
                            "Upgrade completed by version report"
                        );
                    }
                    return Ok(UpsertOutcome {
                        runtime,
                        created: false,
                        completed_upgrade,
                    });
                }
                // Row disappeared between the existence check and the write.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Err(FleetError::WriteConflict {
            tenant_id: tenant_id.to_string(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    /// Mark a runtime offline if it is still live and its last health report
    /// is older than `threshold` at commit time.
    ///
    /// `lastHealthCheck` is left untouched. Returns whether the row changed.
    pub async fn mark_offline_if_stale(
        &self,
        tenant_id: &str,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let written = self
            .update_runtime(tenant_id, now, |runtime| {
                let stale = runtime.status.is_live()
                    && runtime.health_age(now).is_some_and(|age| age > threshold);
                if !stale {
                    return Ok(None);
                }
                runtime.status = RuntimeStatus::Offline;
                Ok(Some(()))
            })
            .await?;

        Ok(written.is_some())
    }

    /// Apply a transition to one runtime row as a single logical write.
    ///
    /// `apply` mutates a copy of the current row and returns `Some` to commit
    /// or `None` to leave the row untouched. It may run more than once when a
    /// concurrent writer wins the revision race, so it must be a pure function
    /// of the row it is given.
    pub(crate) async fn update_runtime<T, F>(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        mut apply: F,
    ) -> Result<Option<(Runtime, T)>>
    where
        F: FnMut(&mut Runtime) -> Result<Option<T>> + Send,
        T: Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get_runtime(tenant_id)
                .await?
                .ok_or_else(|| FleetError::RuntimeNotFound(tenant_id.to_string()))?;

            let mut next = current.clone();
            let Some(value) = apply(&mut next)? else {
                return Ok(None);
            };
            next.updated_at = now;

            if self.store.update_runtime(&next, current.revision).await? {
                next.revision = current.revision + 1;
                if current.status != next.status {
                    info!(
                        tenant_id = %tenant_id,
                        from = %current.status,
                        to = %next.status,
                        "Runtime status changed"
                    );
                }
                self.deliver_presence(tenant_id, current.status, next.status)
                    .await;
                return Ok(Some((next, value)));
            }

            debug!(
                tenant_id = %tenant_id,
                attempt,
                "Runtime revision changed during write, retrying"
            );
        }

        Err(FleetError::WriteConflict {
            tenant_id: tenant_id.to_string(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    /// Like [`Self::update_runtime`] for transitions that always write.
    pub(crate) async fn modify_runtime<T, F>(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        mut apply: F,
    ) -> Result<(Runtime, T)>
    where
        F: FnMut(&mut Runtime) -> Result<T> + Send,
        T: Send,
    {
        self.update_runtime(tenant_id, now, |runtime| apply(runtime).map(Some))
            .await?
            .ok_or_else(|| {
                FleetError::Other(format!("write for tenant {} was skipped", tenant_id))
            })
    }

    async fn deliver_presence(
        &self,
        tenant_id: &str,
        previous: RuntimeStatus,
        next: RuntimeStatus,
    ) {
        for signal in presence_signals(previous, next) {
            if let Err(e) = self.presence.deliver(tenant_id, signal).await {
                warn!(
                    tenant_id = %tenant_id,
                    signal = signal.as_str(),
                    error = %e,
                    "Failed to deliver presence signal"
                );
            }
        }
    }
}

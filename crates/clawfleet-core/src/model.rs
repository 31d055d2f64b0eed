// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime registry data model.
//!
//! A [`Runtime`] is the durable record of one tenant's long-lived compute
//! instance. It carries the two independently versioned software components,
//! liveness state, at most one [`PendingUpgrade`], and a bounded
//! [`UpgradeHistory`].

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Maximum number of entries retained in a runtime's upgrade history.
pub const UPGRADE_HISTORY_CAPACITY: usize = 10;

/// Maximum length (in characters) of an error message stored in history.
pub const MAX_ERROR_LENGTH: usize = 2048;

// ============================================================================
// Enumerations
// ============================================================================

/// Visible status of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// Compute resource is being created.
    Provisioning,
    /// Instance is healthy and reporting.
    Online,
    /// Instance is reporting but unhealthy.
    Degraded,
    /// Instance reported shutdown or stopped reporting.
    Offline,
    /// Instance failed (including a failed upgrade).
    Error,
}

impl RuntimeStatus {
    /// All statuses, in declaration order.
    pub const ALL: [RuntimeStatus; 5] = [
        RuntimeStatus::Provisioning,
        RuntimeStatus::Online,
        RuntimeStatus::Degraded,
        RuntimeStatus::Offline,
        RuntimeStatus::Error,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// Whether the runtime is believed alive and subject to staleness checks.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            other => Err(FleetError::InvalidRequest(format!(
                "unknown runtime status: {}",
                other
            ))),
        }
    }
}

/// How an upgrade was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStrategy {
    /// Apply on this runtime right away.
    Immediate,
    /// Part of a percentage-sized fleet wave.
    Rolling,
    /// Single designated runtime.
    Canary,
}

impl UpgradeStrategy {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Rolling => "rolling",
            Self::Canary => "canary",
        }
    }
}

impl fmt::Display for UpgradeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeStrategy {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "rolling" => Ok(Self::Rolling),
            "canary" => Ok(Self::Canary),
            other => Err(FleetError::InvalidRequest(format!(
                "unknown upgrade strategy: {}",
                other
            ))),
        }
    }
}

/// Terminal outcome of an upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// New versions are running.
    Success,
    /// Upgrade failed; prior versions are retained.
    Failed,
    /// Instance reverted to earlier versions.
    RolledBack,
}

impl UpgradeOutcome {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for UpgradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeOutcome {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(FleetError::InvalidRequest(format!(
                "unknown upgrade outcome: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Versions and upgrades
// ============================================================================

/// The pair of independently versioned components running on an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versions {
    /// Agent framework version.
    pub openclaw_version: String,
    /// Runtime service version.
    pub runtime_service_version: String,
}

impl Versions {
    /// Create a version pair.
    pub fn new(openclaw_version: impl Into<String>, runtime_service_version: impl Into<String>) -> Self {
        Self {
            openclaw_version: openclaw_version.into(),
            runtime_service_version: runtime_service_version.into(),
        }
    }

    /// Whether either component is unset.
    pub fn is_incomplete(&self) -> bool {
        self.openclaw_version.is_empty() || self.runtime_service_version.is_empty()
    }
}

impl fmt::Display for Versions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "openclaw={} runtime={}",
            self.openclaw_version, self.runtime_service_version
        )
    }
}

/// The single in-flight upgrade request slot of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpgrade {
    /// Target agent framework version.
    pub target_openclaw_version: String,
    /// Target runtime service version.
    pub target_runtime_version: String,
    /// When the request was made.
    pub initiated_at: DateTime<Utc>,
    /// Identity that requested the upgrade.
    pub initiated_by: String,
    /// How the upgrade was requested.
    pub strategy: UpgradeStrategy,
}

impl PendingUpgrade {
    /// Create a pending upgrade targeting `target`.
    pub fn new(
        target: &Versions,
        strategy: UpgradeStrategy,
        initiated_by: impl Into<String>,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target_openclaw_version: target.openclaw_version.clone(),
            target_runtime_version: target.runtime_service_version.clone(),
            initiated_at,
            initiated_by: initiated_by.into(),
            strategy,
        }
    }

    /// Target versions of this upgrade.
    pub fn target(&self) -> Versions {
        Versions::new(&self.target_openclaw_version, &self.target_runtime_version)
    }

    /// Whether `versions` equal the upgrade target.
    pub fn is_target(&self, versions: &Versions) -> bool {
        self.target_openclaw_version == versions.openclaw_version
            && self.target_runtime_version == versions.runtime_service_version
    }

    /// Time elapsed since the request.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.initiated_at
    }
}

/// One completed (or decided) upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeHistoryEntry {
    /// Agent framework version before the attempt.
    pub from_openclaw_version: String,
    /// Agent framework version the attempt targeted.
    pub to_openclaw_version: String,
    /// Runtime service version before the attempt.
    pub from_runtime_version: String,
    /// Runtime service version the attempt targeted.
    pub to_runtime_version: String,
    /// Terminal outcome.
    pub status: UpgradeOutcome,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the outcome was recorded.
    pub completed_at: DateTime<Utc>,
    /// Duration in milliseconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Sanitized error message, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identity that requested the attempt.
    pub initiated_by: String,
}

impl UpgradeHistoryEntry {
    /// Versions before the attempt.
    pub fn from_versions(&self) -> Versions {
        Versions::new(&self.from_openclaw_version, &self.from_runtime_version)
    }

    /// Versions the attempt targeted.
    pub fn to_versions(&self) -> Versions {
        Versions::new(&self.to_openclaw_version, &self.to_runtime_version)
    }
}

/// Upgrade history bounded to [`UPGRADE_HISTORY_CAPACITY`] entries.
///
/// Entries are kept oldest first; pushing onto a full history evicts the
/// oldest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<UpgradeHistoryEntry>", into = "Vec<UpgradeHistoryEntry>")]
pub struct UpgradeHistory {
    entries: VecDeque<UpgradeHistoryEntry>,
}

impl UpgradeHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning the evicted entry if the history was full.
    pub fn push(&mut self, entry: UpgradeHistoryEntry) -> Option<UpgradeHistoryEntry> {
        let evicted = if self.entries.len() >= UPGRADE_HISTORY_CAPACITY {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &UpgradeHistoryEntry> {
        self.entries.iter()
    }

    /// Most recently appended entry.
    pub fn latest(&self) -> Option<&UpgradeHistoryEntry> {
        self.entries.back()
    }

    /// Most recent entry with `status = success`.
    pub fn last_success(&self) -> Option<&UpgradeHistoryEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.status == UpgradeOutcome::Success)
    }
}

impl From<Vec<UpgradeHistoryEntry>> for UpgradeHistory {
    fn from(entries: Vec<UpgradeHistoryEntry>) -> Self {
        let skip = entries.len().saturating_sub(UPGRADE_HISTORY_CAPACITY);
        Self {
            entries: entries.into_iter().skip(skip).collect(),
        }
    }
}

impl From<UpgradeHistory> for Vec<UpgradeHistoryEntry> {
    fn from(history: UpgradeHistory) -> Self {
        history.entries.into()
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Telemetry carried by a status report. Absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Compute provider name.
    pub provider: Option<String>,
    /// Provider-side resource identifier.
    pub provider_id: Option<String>,
    /// Network address.
    pub ip_address: Option<String>,
    /// Provider region.
    pub region: Option<String>,
    /// Reported agent framework version.
    pub openclaw_version: Option<String>,
    /// Reported runtime service version.
    pub runtime_service_version: Option<String>,
    /// Deployed image tag.
    pub image_tag: Option<String>,
    /// Advisory health signal.
    pub health_score: Option<f64>,
}

impl RuntimeConfig {
    /// Config carrying only software versions.
    pub fn with_versions(versions: &Versions) -> Self {
        Self {
            openclaw_version: Some(versions.openclaw_version.clone()),
            runtime_service_version: Some(versions.runtime_service_version.clone()),
            ..Self::default()
        }
    }

    /// Reported versions, when both components are present.
    pub fn reported_versions(&self) -> Option<Versions> {
        match (&self.openclaw_version, &self.runtime_service_version) {
            (Some(openclaw), Some(runtime)) => Some(Versions::new(openclaw, runtime)),
            _ => None,
        }
    }

    /// Patch the present fields onto `runtime`.
    pub(crate) fn apply_to(&self, runtime: &mut Runtime) {
        fn patch(field: &mut String, value: &Option<String>) {
            if let Some(value) = value {
                field.clone_from(value);
            }
        }

        patch(&mut runtime.provider, &self.provider);
        patch(&mut runtime.provider_id, &self.provider_id);
        patch(&mut runtime.ip_address, &self.ip_address);
        patch(&mut runtime.region, &self.region);
        patch(&mut runtime.openclaw_version, &self.openclaw_version);
        patch(
            &mut runtime.runtime_service_version,
            &self.runtime_service_version,
        );
        patch(&mut runtime.image_tag, &self.image_tag);
        if self.health_score.is_some() {
            runtime.health_score = self.health_score;
        }
    }
}

/// Durable record of one tenant's runtime instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    /// Owning tenant (unique).
    pub tenant_id: String,
    /// Compute provider name.
    pub provider: String,
    /// Provider-side resource identifier.
    pub provider_id: String,
    /// Network address.
    pub ip_address: String,
    /// Provider region.
    pub region: String,
    /// Running agent framework version.
    pub openclaw_version: String,
    /// Running runtime service version.
    pub runtime_service_version: String,
    /// Deployed image tag.
    pub image_tag: String,
    /// Visible status.
    pub status: RuntimeStatus,
    /// Most recent accepted health report; `None` if never reported.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Advisory health signal.
    pub health_score: Option<f64>,
    /// In-flight upgrade request, if any.
    pub pending_upgrade: Option<PendingUpgrade>,
    /// Bounded upgrade history.
    pub upgrade_history: UpgradeHistory,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency revision, bumped by every committed write.
    #[serde(skip)]
    pub revision: i64,
}

impl Runtime {
    /// Build a new row from a first report. Unknown fields default to empty strings.
    pub fn new(
        tenant_id: impl Into<String>,
        status: RuntimeStatus,
        config: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut runtime = Self {
            tenant_id: tenant_id.into(),
            provider: String::new(),
            provider_id: String::new(),
            ip_address: String::new(),
            region: String::new(),
            openclaw_version: String::new(),
            runtime_service_version: String::new(),
            image_tag: String::new(),
            status,
            last_health_check: Some(now),
            health_score: None,
            pending_upgrade: None,
            upgrade_history: UpgradeHistory::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        };
        config.apply_to(&mut runtime);
        runtime
    }

    /// Currently running versions.
    pub fn versions(&self) -> Versions {
        Versions::new(&self.openclaw_version, &self.runtime_service_version)
    }

    /// Replace the running versions.
    pub fn set_versions(&mut self, versions: &Versions) {
        self.openclaw_version.clone_from(&versions.openclaw_version);
        self.runtime_service_version
            .clone_from(&versions.runtime_service_version);
    }

    /// Whether an upgrade is in flight.
    pub fn has_pending_upgrade(&self) -> bool {
        self.pending_upgrade.is_some()
    }

    /// Time since the last health report, if one was ever accepted.
    pub fn health_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_health_check.map(|checked| now - checked)
    }
}

/// Sanitize an error message for storage: first line only, trimmed, and
/// truncated to [`MAX_ERROR_LENGTH`] characters.
pub fn sanitize_error(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default().trim();
    match first_line.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((cut, _)) => first_line[..cut].to_string(),
        None => first_line.to_string(),
    }
}

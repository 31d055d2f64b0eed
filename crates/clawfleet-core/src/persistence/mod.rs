// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the runtime registry.
//!
//! The store reads one row, lists rows, inserts a row,
//! and replaces a row conditioned on its revision. Every multi-step transition
//! in the engine is computed in memory and committed through
//! [`RuntimeStore::update_runtime`], so a transition is always one logical
//! write against one row.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresRuntimeStore;
pub use self::sqlite::SqliteRuntimeStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FleetError, Result};
use crate::model::{PendingUpgrade, Runtime, UpgradeHistory};

/// Persistence interface for runtime rows.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Fetch the runtime for a tenant.
    async fn get_runtime(&self, tenant_id: &str) -> Result<Option<Runtime>>;

    /// List runtimes in listing order (oldest first), optionally bounded.
    async fn list_runtimes(&self, limit: Option<i64>) -> Result<Vec<Runtime>>;

    /// List runtimes with a pending upgrade, oldest request first, optionally bounded.
    async fn list_pending_upgrades(&self, limit: Option<i64>) -> Result<Vec<Runtime>>;

    /// Insert a new runtime row.
    ///
    /// Returns false if a row for the tenant already exists.
    async fn insert_runtime(&self, runtime: &Runtime) -> Result<bool>;

    /// Replace a runtime row if its stored revision equals `expected_revision`.
    ///
    /// The stored revision becomes `expected_revision + 1`. Returns false when
    /// the row was changed (or removed) by another writer.
    async fn update_runtime(&self, runtime: &Runtime, expected_revision: i64) -> Result<bool>;

    /// Check that the backing database is reachable.
    async fn health_check_db(&self) -> Result<bool>;
}

/// Column list shared by both backends' SELECT statements.
pub(crate) const RUNTIME_COLUMNS: &str = "tenant_id, provider, provider_id, ip_address, region, \
     openclaw_version, runtime_service_version, image_tag, status, last_health_check, \
     health_score, pending_upgrade, upgrade_history, created_at, updated_at, revision";

/// Raw `runtimes` row as stored (JSON columns as text).
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RuntimeRow {
    pub tenant_id: String,
    pub provider: String,
    pub provider_id: String,
    pub ip_address: String,
    pub region: String,
    pub openclaw_version: String,
    pub runtime_service_version: String,
    pub image_tag: String,
    pub status: String,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_score: Option<f64>,
    pub pending_upgrade: Option<String>,
    pub upgrade_history: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
}

impl TryFrom<RuntimeRow> for Runtime {
    type Error = FleetError;

    fn try_from(row: RuntimeRow) -> Result<Self> {
        let pending_upgrade = row
            .pending_upgrade
            .as_deref()
            .map(serde_json::from_str::<PendingUpgrade>)
            .transpose()?;
        let upgrade_history: UpgradeHistory = serde_json::from_str(&row.upgrade_history)?;

        Ok(Runtime {
            status: row.status.parse()?,
            tenant_id: row.tenant_id,
            provider: row.provider,
            provider_id: row.provider_id,
            ip_address: row.ip_address,
            region: row.region,
            openclaw_version: row.openclaw_version,
            runtime_service_version: row.runtime_service_version,
            image_tag: row.image_tag,
            last_health_check: row.last_health_check,
            health_score: row.health_score,
            pending_upgrade,
            upgrade_history,
            created_at: row.created_at,
            updated_at: row.updated_at,
            revision: row.revision,
        })
    }
}

/// JSON-encoded columns of a runtime, ready to bind.
pub(crate) struct EncodedColumns {
    pub pending_upgrade: Option<String>,
    pub pending_initiated_at: Option<DateTime<Utc>>,
    pub upgrade_history: String,
}

impl EncodedColumns {
    pub fn encode(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            pending_upgrade: runtime
                .pending_upgrade
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            pending_initiated_at: runtime.pending_upgrade.as_ref().map(|p| p.initiated_at),
            upgrade_history: serde_json::to_string(&runtime.upgrade_history)?,
        })
    }
}

pub(crate) fn decode_rows(rows: Vec<RuntimeRow>) -> Result<Vec<Runtime>> {
    rows.into_iter().map(Runtime::try_from).collect()
}

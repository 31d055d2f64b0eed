// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed runtime store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{FleetError, Result};
use crate::model::Runtime;

use super::{EncodedColumns, RUNTIME_COLUMNS, RuntimeRow, RuntimeStore, decode_rows};

/// SQLite-backed runtime store.
#[derive(Clone)]
pub struct SqliteRuntimeStore {
    pool: SqlitePool,
}

impl SqliteRuntimeStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, run migrations, and return the store.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a file-backed store, creating parent directories as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FleetError::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Create an in-memory store (single connection, so every query sees the same database).
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RuntimeStore for SqliteRuntimeStore {
    async fn get_runtime(&self, tenant_id: &str) -> Result<Option<Runtime>> {
        let row = sqlx::query_as::<_, RuntimeRow>(&format!(
            "SELECT {} FROM runtimes WHERE tenant_id = ?1",
            RUNTIME_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runtime::try_from).transpose()
    }

    async fn list_runtimes(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        // SQLite treats a negative LIMIT as unbounded.
        let rows = sqlx::query_as::<_, RuntimeRow>(&format!(
            "SELECT {} FROM runtimes ORDER BY created_at ASC, tenant_id ASC LIMIT COALESCE(?1, -1)",
            RUNTIME_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        decode_rows(rows)
    }

    async fn list_pending_upgrades(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        let rows = sqlx::query_as::<_, RuntimeRow>(&format!(
            "SELECT {} FROM runtimes WHERE pending_initiated_at IS NOT NULL \
             ORDER BY pending_initiated_at ASC, tenant_id ASC LIMIT COALESCE(?1, -1)",
            RUNTIME_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        decode_rows(rows)
    }

    async fn insert_runtime(&self, runtime: &Runtime) -> Result<bool> {
        let encoded = EncodedColumns::encode(runtime)?;
        let result = sqlx::query(
            r#"
            INSERT INTO runtimes (
                tenant_id, provider, provider_id, ip_address, region,
                openclaw_version, runtime_service_version, image_tag, status,
                last_health_check, health_score, pending_upgrade, pending_initiated_at,
                upgrade_history, created_at, updated_at, revision
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(&runtime.tenant_id)
        .bind(&runtime.provider)
        .bind(&runtime.provider_id)
        .bind(&runtime.ip_address)
        .bind(&runtime.region)
        .bind(&runtime.openclaw_version)
        .bind(&runtime.runtime_service_version)
        .bind(&runtime.image_tag)
        .bind(runtime.status.as_str())
        .bind(runtime.last_health_check)
        .bind(runtime.health_score)
        .bind(&encoded.pending_upgrade)
        .bind(encoded.pending_initiated_at)
        .bind(&encoded.upgrade_history)
        .bind(runtime.created_at)
        .bind(runtime.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_runtime(&self, runtime: &Runtime, expected_revision: i64) -> Result<bool> {
        let encoded = EncodedColumns::encode(runtime)?;
        let result = sqlx::query(
            r#"
            UPDATE runtimes
            SET provider = ?2,
                provider_id = ?3,
                ip_address = ?4,
                region = ?5,
                openclaw_version = ?6,
                runtime_service_version = ?7,
                image_tag = ?8,
                status = ?9,
                last_health_check = ?10,
                health_score = ?11,
                pending_upgrade = ?12,
                pending_initiated_at = ?13,
                upgrade_history = ?14,
                updated_at = ?15,
                revision = revision + 1
            WHERE tenant_id = ?1 AND revision = ?16
            "#,
        )
        .bind(&runtime.tenant_id)
        .bind(&runtime.provider)
        .bind(&runtime.provider_id)
        .bind(&runtime.ip_address)
        .bind(&runtime.region)
        .bind(&runtime.openclaw_version)
        .bind(&runtime.runtime_service_version)
        .bind(&runtime.image_tag)
        .bind(runtime.status.as_str())
        .bind(runtime.last_health_check)
        .bind(runtime.health_score)
        .bind(&encoded.pending_upgrade)
        .bind(encoded.pending_initiated_at)
        .bind(&encoded.upgrade_history)
        .bind(runtime.updated_at)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn health_check_db(&self) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

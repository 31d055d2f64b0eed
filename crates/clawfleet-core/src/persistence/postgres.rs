// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed runtime store.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::Runtime;

use super::{EncodedColumns, RUNTIME_COLUMNS, RuntimeRow, RuntimeStore, decode_rows};

/// PostgreSQL-backed runtime store.
#[derive(Clone)]
pub struct PostgresRuntimeStore {
    pool: PgPool,
}

impl PostgresRuntimeStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, run migrations, and return the store.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RuntimeStore for PostgresRuntimeStore {
    async fn get_runtime(&self, tenant_id: &str) -> Result<Option<Runtime>> {
        let row = sqlx::query_as::<_, RuntimeRow>(&format!(
            "SELECT {} FROM runtimes WHERE tenant_id = $1",
            RUNTIME_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runtime::try_from).transpose()
    }

    async fn list_runtimes(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        // LIMIT NULL is LIMIT ALL in PostgreSQL.
        let rows = sqlx::query_as::<_, RuntimeRow>(&format!(
            "SELECT {} FROM runtimes ORDER BY created_at ASC, tenant_id ASC LIMIT $1",
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
             ORDER BY pending_initiated_at ASC, tenant_id ASC LIMIT $1",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0)
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
            SET provider = $2,
                provider_id = $3,
                ip_address = $4,
                region = $5,
                openclaw_version = $6,
                runtime_service_version = $7,
                image_tag = $8,
                status = $9,
                last_health_check = $10,
                health_score = $11,
                pending_upgrade = $12,
                pending_initiated_at = $13,
                upgrade_history = $14,
                updated_at = $15,
                revision = revision + 1
            WHERE tenant_id = $1 AND revision = $16
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
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

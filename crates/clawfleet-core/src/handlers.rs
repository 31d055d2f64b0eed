// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet operation handlers.
//!
//! Each handler applies its authorization gate before touching state, so an
//! authorization failure never mutates a runtime. Transport layers (HTTP,
//! RPC, an embedding service) call these with an already-identified caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::auth::{
    ServiceCredential, is_fleet_orchestrator, require_fleet_orchestration_enabled,
    require_fleet_orchestrator, require_tenant_admin,
};
use crate::collaborators::{FeatureFlags, TenantAuthorizer};
use crate::error::{FleetError, Result};
use crate::model::{PendingUpgrade, Runtime, RuntimeConfig, RuntimeStatus, UpgradeStrategy, Versions};
use crate::orchestrator::{FleetOrchestrator, RollbackOutcome, RollingUpgradeReport};
use crate::registry::{FleetSummary, RuntimeRegistry, UpsertOutcome};
use crate::upgrade::{RecordOutcome, UpgradeResult};
use crate::upgrade_sweeper::{DEFAULT_UPGRADE_TIMEOUT, UpgradeSweepReport, sweep_upgrade_timeouts};

/// Shared state for fleet handlers.
pub struct FleetHandlerState {
    /// Runtime registry (all runtime writes go through it).
    pub registry: RuntimeRegistry,
    /// Fleet orchestrator over the same registry.
    pub orchestrator: FleetOrchestrator,
    /// Tenant authorization collaborator.
    pub authorizer: Arc<dyn TenantAuthorizer>,
    /// Feature-flag collaborator.
    pub flags: Arc<dyn FeatureFlags>,
    /// Default deadline for on-demand timeout sweeps.
    pub upgrade_timeout: Duration,
    /// Default scan bound for on-demand timeout sweeps.
    pub sweep_limit: Option<i64>,
    /// When the server started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl FleetHandlerState {
    /// Create handler state over a registry and its collaborators.
    pub fn new(
        registry: RuntimeRegistry,
        authorizer: Arc<dyn TenantAuthorizer>,
        flags: Arc<dyn FeatureFlags>,
    ) -> Self {
        Self {
            orchestrator: FleetOrchestrator::new(registry.clone()),
            registry,
            authorizer,
            flags,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            sweep_limit: None,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Set the default deadline for on-demand timeout sweeps.
    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = timeout;
        self
    }

    /// Set the default scan bound for on-demand timeout sweeps.
    pub fn with_sweep_limit(mut self, limit: Option<i64>) -> Self {
        self.sweep_limit = limit;
        self
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    /// Whether the server is healthy (database connected).
    pub healthy: bool,
    /// Server version.
    pub version: String,
    /// Server uptime in milliseconds.
    pub uptime_ms: i64,
}

/// Handle health check request.
pub async fn handle_health_check(state: &FleetHandlerState) -> Result<HealthCheckResponse> {
    let healthy = state.registry.health_check_db().await.unwrap_or(false);

    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    })
}

// ============================================================================
// Runtime process callbacks
// ============================================================================

/// Status report from a runtime process.
#[derive(Debug, Clone)]
pub struct ReportStatusRequest {
    /// Reporting tenant.
    pub tenant_id: String,
    /// Reported status.
    pub status: RuntimeStatus,
    /// Reported telemetry.
    pub config: Option<RuntimeConfig>,
}

/// Handle a status report from a runtime process.
pub async fn handle_report_status(
    state: &FleetHandlerState,
    _credential: &ServiceCredential,
    request: ReportStatusRequest,
) -> Result<UpsertOutcome> {
    state
        .registry
        .upsert_status(&request.tenant_id, request.status, request.config.as_ref())
        .await
}

/// Upgrade result callback from a runtime process.
#[derive(Debug, Clone)]
pub struct RecordUpgradeResultRequest {
    /// Reporting tenant.
    pub tenant_id: String,
    /// Attempt outcome.
    pub result: UpgradeResult,
}

/// Handle an upgrade result callback from a runtime process.
pub async fn handle_record_upgrade_result(
    state: &FleetHandlerState,
    _credential: &ServiceCredential,
    request: RecordUpgradeResultRequest,
) -> Result<RecordOutcome> {
    state
        .registry
        .record_upgrade_result(&request.tenant_id, &request.result)
        .await
}

// ============================================================================
// Tenant admin operations
// ============================================================================

/// Request to set a tenant's pending upgrade.
#[derive(Debug, Clone)]
pub struct RequestUpgradeRequest {
    /// Calling identity.
    pub caller_id: String,
    /// Target tenant.
    pub tenant_id: String,
    /// Target versions.
    pub target: Versions,
    /// Upgrade strategy.
    pub strategy: UpgradeStrategy,
}

/// Handle an upgrade request (tenant admin only).
pub async fn handle_request_upgrade(
    state: &FleetHandlerState,
    request: RequestUpgradeRequest,
) -> Result<PendingUpgrade> {
    require_tenant_admin(
        state.authorizer.as_ref(),
        &request.caller_id,
        &request.tenant_id,
    )
    .await?;

    state
        .registry
        .request_upgrade(
            &request.tenant_id,
            &request.target,
            request.strategy,
            &request.caller_id,
        )
        .await
}

/// Handle clearing a tenant's pending upgrade (tenant admin only).
pub async fn handle_clear_upgrade_request(
    state: &FleetHandlerState,
    caller_id: &str,
    tenant_id: &str,
) -> Result<Option<PendingUpgrade>> {
    require_tenant_admin(state.authorizer.as_ref(), caller_id, tenant_id).await?;
    state.registry.clear_upgrade_request(tenant_id).await
}

/// Request to roll back a tenant's runtime.
#[derive(Debug, Clone)]
pub struct RollbackRuntimeRequest {
    /// Calling identity.
    pub caller_id: String,
    /// Target tenant.
    pub tenant_id: String,
    /// Also enqueue an immediate upgrade to the recovered versions.
    pub apply: bool,
}

/// Handle a rollback (tenant admin only).
pub async fn handle_rollback_runtime(
    state: &FleetHandlerState,
    request: RollbackRuntimeRequest,
) -> Result<RollbackOutcome> {
    require_tenant_admin(
        state.authorizer.as_ref(),
        &request.caller_id,
        &request.tenant_id,
    )
    .await?;

    state
        .orchestrator
        .rollback_runtime(&request.tenant_id, &request.caller_id, request.apply)
        .await
}

/// Handle reading one tenant's runtime (tenant admin only).
pub async fn handle_get_by_tenant(
    state: &FleetHandlerState,
    caller_id: &str,
    tenant_id: &str,
) -> Result<Runtime> {
    require_tenant_admin(state.authorizer.as_ref(), caller_id, tenant_id).await?;
    state
        .registry
        .get_by_tenant(tenant_id)
        .await?
        .ok_or_else(|| FleetError::RuntimeNotFound(tenant_id.to_string()))
}

// ============================================================================
// Fleet orchestration
// ============================================================================

/// Request to enqueue a canary upgrade.
#[derive(Debug, Clone)]
pub struct CanaryUpgradeRequest {
    /// Calling identity.
    pub caller_id: String,
    /// The single tenant to upgrade.
    pub tenant_id: String,
    /// Target versions.
    pub target: Versions,
}

/// Handle a canary upgrade.
///
/// Requires the orchestration flag, and a caller that is either the fleet
/// orchestrator or an admin of the named tenant.
pub async fn handle_run_canary_upgrade(
    state: &FleetHandlerState,
    request: CanaryUpgradeRequest,
) -> Result<PendingUpgrade> {
    require_fleet_orchestration_enabled(state.flags.as_ref()).await?;
    if !is_fleet_orchestrator(state.flags.as_ref(), &request.caller_id).await? {
        require_tenant_admin(
            state.authorizer.as_ref(),
            &request.caller_id,
            &request.tenant_id,
        )
        .await?;
    }

    state
        .orchestrator
        .run_canary_upgrade(&request.tenant_id, &request.target, &request.caller_id)
        .await
}

/// Request to enqueue a rolling wave.
#[derive(Debug, Clone)]
pub struct RollingUpgradeRequest {
    /// Calling identity.
    pub caller_id: String,
    /// Target versions.
    pub target: Versions,
    /// Batch size as a percentage of eligible runtimes (clamped to 1..=100, default 10).
    pub batch_percent: Option<u32>,
}

/// Handle a rolling upgrade wave (fleet orchestrator only).
pub async fn handle_run_rolling_upgrade(
    state: &FleetHandlerState,
    request: RollingUpgradeRequest,
) -> Result<RollingUpgradeReport> {
    require_fleet_orchestration_enabled(state.flags.as_ref()).await?;
    require_fleet_orchestrator(state.flags.as_ref(), &request.caller_id).await?;

    info!(
        caller_id = %request.caller_id,
        target = %request.target,
        "Rolling upgrade requested"
    );

    state
        .orchestrator
        .run_rolling_upgrade(&request.target, request.batch_percent)
        .await
}

/// Request for an on-demand timeout sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepUpgradeTimeoutsRequest {
    /// Calling identity.
    pub caller_id: String,
    /// Deadline override (clamped to at least 60 seconds).
    pub timeout: Option<Duration>,
    /// Scan bound override.
    pub limit: Option<i64>,
}

/// Handle an on-demand timeout sweep (fleet orchestrator only).
pub async fn handle_sweep_upgrade_timeouts(
    state: &FleetHandlerState,
    request: SweepUpgradeTimeoutsRequest,
) -> Result<UpgradeSweepReport> {
    require_fleet_orchestration_enabled(state.flags.as_ref()).await?;
    require_fleet_orchestrator(state.flags.as_ref(), &request.caller_id).await?;

    sweep_upgrade_timeouts(
        &state.registry,
        Utc::now(),
        Some(request.timeout.unwrap_or(state.upgrade_timeout)),
        request.limit.or(state.sweep_limit),
    )
    .await
}

/// Fleet-wide read model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetView {
    /// Runtimes in listing order.
    pub runtimes: Vec<Runtime>,
    /// Aggregate counts over `runtimes`.
    pub summary: FleetSummary,
}

/// Handle the fleet view (fleet orchestrator only).
pub async fn handle_list_all_for_fleet_view(
    state: &FleetHandlerState,
    caller_id: &str,
    limit: Option<i64>,
) -> Result<FleetView> {
    require_fleet_orchestrator(state.flags.as_ref(), caller_id).await?;

    let runtimes = state.registry.list_all(limit).await?;
    let summary = FleetSummary::from_runtimes(&runtimes);
    Ok(FleetView { runtimes, summary })
}

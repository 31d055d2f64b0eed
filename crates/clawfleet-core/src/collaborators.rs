// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces to the collaborators the engine consumes but does not own.
//!
//! - [`TenantAuthorizer`]: answers whether a caller administers a tenant.
//! - [`FeatureFlags`]: key-value flag store (orchestration switch, orchestrator identity).
//! - [`AgentPresence`]: receives presence signals when a runtime goes down or comes up.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::info;

use crate::error::{FleetError, Result};

/// Flag that must equal `"true"` for any fleet-wide batch operation.
pub const FLEET_ORCHESTRATION_ENABLED_FLAG: &str = "fleet_orchestration_enabled";

/// Flag holding the designated fleet-orchestrator caller identity.
pub const FLEET_ORCHESTRATOR_USER_ID_FLAG: &str = "fleet_orchestrator_user_id";

/// Flag holding the shared secret runtime processes present as their service credential.
pub const RUNTIME_SERVICE_KEY_FLAG: &str = "runtime_service_key";

/// Signal delivered to the agent-presence collaborator, keyed by tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceSignal {
    /// Mark every agent of the tenant offline.
    MarkAgentsOffline,
    /// Clear transient presence indicators (typing, activity).
    ClearTransientPresence,
    /// The tenant's runtime came back up.
    RuntimeCameUp,
}

impl PresenceSignal {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkAgentsOffline => "mark_agents_offline",
            Self::ClearTransientPresence => "clear_transient_presence",
            Self::RuntimeCameUp => "runtime_came_up",
        }
    }
}

/// Tenant authorization collaborator.
#[async_trait]
pub trait TenantAuthorizer: Send + Sync {
    /// Whether `caller_id` is an admin or owner of `tenant_id`.
    async fn is_tenant_admin(&self, caller_id: &str, tenant_id: &str) -> Result<bool>;
}

/// Feature-flag collaborator.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    /// Look up a flag value.
    async fn get_flag(&self, key: &str) -> Result<Option<String>>;
}

/// Agent-presence collaborator.
#[async_trait]
pub trait AgentPresence: Send + Sync {
    /// Deliver one presence signal for a tenant.
    async fn deliver(&self, tenant_id: &str, signal: PresenceSignal) -> Result<()>;
}

// ============================================================================
// Adapters
// ============================================================================

/// In-process flag store, seeded at startup or by an embedding service.
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    flags: RwLock<HashMap<String, String>>,
}

impl StaticFeatureFlags {
    /// Create an empty flag store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style flag insertion.
    pub fn with_flag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_flag(key, value);
        self
    }

    /// Set or replace a flag.
    pub fn set_flag(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut flags = self
            .flags
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flags.insert(key.into(), value.into());
    }

    /// Remove a flag.
    pub fn remove_flag(&self, key: &str) {
        let mut flags = self
            .flags
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flags.remove(key);
    }
}

#[async_trait]
impl FeatureFlags for StaticFeatureFlags {
    async fn get_flag(&self, key: &str) -> Result<Option<String>> {
        let flags = self
            .flags
            .read()
            .map_err(|_| FleetError::Collaborator("feature flag store poisoned".to_string()))?;
        Ok(flags.get(key).cloned())
    }
}

/// Authorizer that grants no tenant-admin rights.
///
/// Default for processes without a tenant directory; only the fleet
/// orchestrator identity can act through the handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllAuthorizer;

#[async_trait]
impl TenantAuthorizer for DenyAllAuthorizer {
    async fn is_tenant_admin(&self, _caller_id: &str, _tenant_id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Presence adapter that only logs signals.
///
/// Used by the standalone binary, where the presence service lives in another
/// process and consumes these transitions from the logs/event pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPresence;

#[async_trait]
impl AgentPresence for LoggingPresence {
    async fn deliver(&self, tenant_id: &str, signal: PresenceSignal) -> Result<()> {
        info!(
            tenant_id = %tenant_id,
            signal = signal.as_str(),
            "Presence signal"
        );
        Ok(())
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for clawfleet-core integration tests.
//!
//! Provides a TestContext over an in-memory SQLite store plus test doubles
//! for the collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use clawfleet_core::collaborators::{
    AgentPresence, FLEET_ORCHESTRATION_ENABLED_FLAG, FLEET_ORCHESTRATOR_USER_ID_FLAG,
    PresenceSignal, StaticFeatureFlags, TenantAuthorizer,
};
use clawfleet_core::error::{FleetError, Result};
use clawfleet_core::handlers::FleetHandlerState;
use clawfleet_core::model::{Runtime, RuntimeConfig, RuntimeStatus, Versions};
use clawfleet_core::orchestrator::FleetOrchestrator;
use clawfleet_core::persistence::{RuntimeStore, SqliteRuntimeStore};
use clawfleet_core::registry::RuntimeRegistry;

pub const ORCHESTRATOR_ID: &str = "svc-fleet";

// ============================================================================
// Presence
// ============================================================================

/// Presence collaborator that records every delivered signal.
#[derive(Default)]
pub struct RecordingPresence {
    signals: Mutex<Vec<(String, PresenceSignal)>>,
    fail: AtomicBool,
}

impl RecordingPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail (after recording it).
    pub fn fail_deliveries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn signals(&self) -> Vec<(String, PresenceSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn signals_for(&self, tenant_id: &str) -> Vec<PresenceSignal> {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .filter(|(tenant, _)| tenant == tenant_id)
            .map(|(_, signal)| *signal)
            .collect()
    }

    pub fn count(&self, tenant_id: &str, signal: PresenceSignal) -> usize {
        self.signals_for(tenant_id)
            .into_iter()
            .filter(|s| *s == signal)
            .count()
    }

    pub fn clear(&self) {
        self.signals.lock().unwrap().clear();
    }
}

#[async_trait]
impl AgentPresence for RecordingPresence {
    async fn deliver(&self, tenant_id: &str, signal: PresenceSignal) -> Result<()> {
        self.signals
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), signal));
        if self.fail.load(Ordering::SeqCst) {
            return Err(FleetError::Collaborator("presence unavailable".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Authorization
// ============================================================================

/// Authorizer backed by an explicit set of (caller, tenant) admin grants.
#[derive(Default)]
pub struct StaticAuthorizer {
    admins: Mutex<HashSet<(String, String)>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, caller_id: &str, tenant_id: &str) {
        self.admins
            .lock()
            .unwrap()
            .insert((caller_id.to_string(), tenant_id.to_string()));
    }
}

#[async_trait]
impl TenantAuthorizer for StaticAuthorizer {
    async fn is_tenant_admin(&self, caller_id: &str, tenant_id: &str) -> Result<bool> {
        Ok(self
            .admins
            .lock()
            .unwrap()
            .contains(&(caller_id.to_string(), tenant_id.to_string())))
    }
}

// ============================================================================
// Store with fault injection
// ============================================================================

/// Store wrapper that can fail writes or lose revision races for chosen tenants.
pub struct FlakyStore {
    inner: Arc<dyn RuntimeStore>,
    failing_tenants: Mutex<HashSet<String>>,
    lost_races: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn RuntimeStore>) -> Self {
        Self {
            inner,
            failing_tenants: Mutex::new(HashSet::new()),
            lost_races: Mutex::new(HashMap::new()),
        }
    }

    /// Every write for `tenant_id` returns a database-style error.
    pub fn fail_writes_for(&self, tenant_id: &str) {
        self.failing_tenants
            .lock()
            .unwrap()
            .insert(tenant_id.to_string());
    }

    /// The next `times` conditional updates for `tenant_id` report a revision mismatch.
    pub fn lose_races_for(&self, tenant_id: &str, times: usize) {
        self.lost_races
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), times);
    }

    fn check_failing(&self, tenant_id: &str) -> Result<()> {
        if self.failing_tenants.lock().unwrap().contains(tenant_id) {
            return Err(FleetError::Other(format!(
                "injected write failure for {}",
                tenant_id
            )));
        }
        Ok(())
    }

    fn take_lost_race(&self, tenant_id: &str) -> bool {
        let mut races = self.lost_races.lock().unwrap();
        match races.get_mut(tenant_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RuntimeStore for FlakyStore {
    async fn get_runtime(&self, tenant_id: &str) -> Result<Option<Runtime>> {
        self.inner.get_runtime(tenant_id).await
    }

    async fn list_runtimes(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        self.inner.list_runtimes(limit).await
    }

    async fn list_pending_upgrades(&self, limit: Option<i64>) -> Result<Vec<Runtime>> {
        self.inner.list_pending_upgrades(limit).await
    }

    async fn insert_runtime(&self, runtime: &Runtime) -> Result<bool> {
        self.check_failing(&runtime.tenant_id)?;
        self.inner.insert_runtime(runtime).await
    }

    async fn update_runtime(&self, runtime: &Runtime, expected_revision: i64) -> Result<bool> {
        self.check_failing(&runtime.tenant_id)?;
        if self.take_lost_race(&runtime.tenant_id) {
            return Ok(false);
        }
        self.inner.update_runtime(runtime, expected_revision).await
    }

    async fn health_check_db(&self) -> Result<bool> {
        self.inner.health_check_db().await
    }
}

// ============================================================================
// Test context
// ============================================================================

/// Wired engine over a fresh in-memory SQLite database.
pub struct TestContext {
    pub store: Arc<FlakyStore>,
    pub presence: Arc<RecordingPresence>,
    pub authorizer: Arc<StaticAuthorizer>,
    pub flags: Arc<StaticFeatureFlags>,
    pub registry: RuntimeRegistry,
    pub orchestrator: FleetOrchestrator,
}

impl TestContext {
    pub async fn new() -> Self {
        let sqlite = SqliteRuntimeStore::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store");
        let store = Arc::new(FlakyStore::new(Arc::new(sqlite)));
        let presence = Arc::new(RecordingPresence::new());
        let registry = RuntimeRegistry::new(store.clone(), presence.clone());

        Self {
            orchestrator: FleetOrchestrator::new(registry.clone()),
            store,
            presence,
            authorizer: Arc::new(StaticAuthorizer::new()),
            flags: Arc::new(StaticFeatureFlags::new()),
            registry,
        }
    }

    /// Handler state sharing this context's registry and collaborators.
    pub fn handler_state(&self) -> FleetHandlerState {
        FleetHandlerState::new(
            self.registry.clone(),
            self.authorizer.clone(),
            self.flags.clone(),
        )
    }

    /// Enable orchestration and designate [`ORCHESTRATOR_ID`].
    pub fn enable_orchestration(&self) {
        self.flags.set_flag(FLEET_ORCHESTRATION_ENABLED_FLAG, "true");
        self.flags
            .set_flag(FLEET_ORCHESTRATOR_USER_ID_FLAG, ORCHESTRATOR_ID);
    }

    /// Register a runtime with the given status and versions at `at`.
    pub async fn seed_runtime(
        &self,
        tenant_id: &str,
        status: RuntimeStatus,
        versions: &Versions,
        at: DateTime<Utc>,
    ) -> Runtime {
        self.registry
            .upsert_status_at(
                tenant_id,
                status,
                Some(&RuntimeConfig::with_versions(versions)),
                at,
            )
            .await
            .expect("Failed to seed runtime")
            .runtime
    }

    /// Load a runtime that must exist.
    pub async fn runtime(&self, tenant_id: &str) -> Runtime {
        self.registry
            .get_by_tenant(tenant_id)
            .await
            .expect("Failed to load runtime")
            .expect("Runtime should exist")
    }

    /// Overwrite a runtime row directly through the store.
    pub async fn overwrite(&self, runtime: &Runtime) {
        assert!(
            self.store
                .update_runtime(runtime, runtime.revision)
                .await
                .expect("Failed to overwrite runtime"),
            "overwrite lost a revision race"
        );
    }
}

pub fn v(openclaw: &str, runtime: &str) -> Versions {
    Versions::new(openclaw, runtime)
}

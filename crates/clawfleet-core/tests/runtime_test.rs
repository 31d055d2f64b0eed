// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the embedded runtime and its background workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use clawfleet_core::collaborators::PresenceSignal;
use clawfleet_core::health_monitor::HealthMonitorConfig;
use clawfleet_core::model::{RuntimeConfig, RuntimeStatus, UpgradeStrategy, Versions};
use clawfleet_core::persistence::SqliteRuntimeStore;
use clawfleet_core::registry::RuntimeRegistry;
use clawfleet_core::runtime::FleetRuntime;
use clawfleet_core::upgrade_sweeper::{UPGRADE_TIMEOUT_ERROR, UpgradeSweeperConfig};
use common::RecordingPresence;

/// Poll until `tenant_id` reaches `status` or the deadline passes.
async fn wait_for_status(registry: &RuntimeRegistry, tenant_id: &str, status: RuntimeStatus) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let runtime = registry.get_by_tenant(tenant_id).await.unwrap();
        if runtime.is_some_and(|r| r.status == status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_workers_mark_stale_and_time_out_upgrades() {
    let store = SqliteRuntimeStore::in_memory().await.unwrap();
    let presence = Arc::new(RecordingPresence::new());

    let runtime = FleetRuntime::builder()
        .store(Arc::new(store))
        .presence(presence.clone())
        .health_monitor_config(HealthMonitorConfig {
            poll_interval: Duration::from_millis(50),
            stale_threshold: Duration::from_secs(90),
        })
        .upgrade_sweeper_config(UpgradeSweeperConfig {
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(60),
            limit: None,
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let registry = runtime.registry().clone();
    let long_ago = Utc::now() - ChronoDuration::minutes(10);

    registry
        .upsert_status_at(
            "silent",
            RuntimeStatus::Online,
            Some(&RuntimeConfig::with_versions(&Versions::new("v1", "r1"))),
            long_ago,
        )
        .await
        .unwrap();

    // Reports fresh health but never finishes its upgrade.
    registry
        .upsert_status("stuck", RuntimeStatus::Provisioning, None)
        .await
        .unwrap();
    registry
        .request_upgrade_at(
            "stuck",
            &Versions::new("v2", "r2"),
            UpgradeStrategy::Rolling,
            "fleet-orchestrator",
            long_ago,
        )
        .await
        .unwrap();

    assert!(wait_for_status(&registry, "silent", RuntimeStatus::Offline).await);
    assert!(wait_for_status(&registry, "stuck", RuntimeStatus::Error).await);

    assert_eq!(
        presence.count("silent", PresenceSignal::MarkAgentsOffline),
        1
    );
    let stuck = registry.get_by_tenant("stuck").await.unwrap().unwrap();
    assert!(!stuck.has_pending_upgrade());
    assert_eq!(
        stuck.upgrade_history.latest().unwrap().error.as_deref(),
        Some(UPGRADE_TIMEOUT_ERROR)
    );

    assert!(runtime.is_running());
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_shares_registry() {
    let store = SqliteRuntimeStore::in_memory().await.unwrap();
    let runtime = FleetRuntime::builder()
        .store(Arc::new(store))
        .presence(Arc::new(RecordingPresence::new()))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    runtime
        .registry()
        .upsert_status("tenant-a", RuntimeStatus::Online, None)
        .await
        .unwrap();

    let summary = runtime.state().registry.fleet_summary().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(runtime.state().upgrade_timeout, Duration::from_secs(30 * 60));

    runtime.shutdown().await.unwrap();
}

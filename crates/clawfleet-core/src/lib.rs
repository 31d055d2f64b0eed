// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clawfleet Core - Fleet Lifecycle and Upgrade Orchestration
//!
//! This crate keeps the authoritative view of a multi-tenant fleet of
//! per-tenant runtime instances (one long-lived compute unit per tenant) and
//! rolls version upgrades across that fleet.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────────────────┐
//! │   Runtime processes      │      │   Admins / fleet orchestrator        │
//! │ (status + result reports)│      │ (upgrade, rollback, waves, views)    │
//! └──────────────────────────┘      └──────────────────────────────────────┘
//!              │ service credential                 │ tenant admin / orchestrator
//!              ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         handlers (auth gates)                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐   │
//! │  │   Runtime    │  │   Upgrade    │  │    Fleet     │  │  Workers   │   │
//! │  │   Registry   │◄─│ State Machine│◄─│ Orchestrator │  │ health /   │   │
//! │  │              │  │              │  │              │  │ timeouts   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!              │ single-row revision-checked writes         │ presence signals
//!              ▼                                            ▼
//! ┌──────────────────────────────────┐      ┌───────────────────────────────┐
//! │   PostgreSQL / SQLite `runtimes` │      │   Agent presence collaborator │
//! └──────────────────────────────────┘      └───────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Caller | Description |
//! |-----------|--------|-------------|
//! | `report_status` | Runtime process | Upsert status and telemetry; may complete a pending upgrade |
//! | `record_upgrade_result` | Runtime process | Terminal upgrade outcome (no-op unless its target is pending) |
//! | `request_upgrade` | Tenant admin | Set the pending upgrade (last request wins) |
//! | `clear_upgrade_request` | Tenant admin | Cancel the pending upgrade without history |
//! | `rollback_runtime` | Tenant admin | Record a rollback to the pre-success versions |
//! | `get_by_tenant` | Tenant admin | Read one runtime |
//! | `run_canary_upgrade` | Orchestrator or tenant admin | Enqueue a canary upgrade on one runtime |
//! | `run_rolling_upgrade` | Orchestrator | Enqueue the next percentage-sized wave |
//! | `sweep_upgrade_timeouts` | Orchestrator | Fail pending upgrades past the deadline |
//! | `list_all_for_fleet_view` | Orchestrator | Fleet listing plus status counts |
//!
//! Fleet-wide batch operations additionally require the
//! `fleet_orchestration_enabled` flag to equal `"true"`.
//!
//! # Background Workers
//!
//! | Worker | Default cadence | Effect |
//! |--------|-----------------|--------|
//! | [`health_monitor::HealthMonitor`] | 30s | Marks live runtimes silent for > 90s `offline` |
//! | [`upgrade_sweeper::UpgradeTimeoutSweeper`] | 60s | Fails pending upgrades older than 30 minutes |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

#![deny(missing_docs)]

/// Authorization gates and the runtime service credential.
pub mod auth;

/// Interfaces to external collaborators and in-process adapters.
pub mod collaborators;

/// Environment-variable configuration.
pub mod config;

/// Error types.
pub mod error;

/// Fleet operation handlers.
pub mod handlers;

/// Staleness detection and its background worker.
pub mod health_monitor;

/// Embedded database migrations.
pub mod migrations;

/// Runtime registry data model.
pub mod model;

/// Canary, rolling, and rollback orchestration.
pub mod orchestrator;

/// Runtime store trait and database backends.
pub mod persistence;

/// Runtime registry and its single-row write path.
pub mod registry;

/// Embeddable runtime that runs the background workers.
pub mod runtime;

/// Per-runtime upgrade state machine.
pub mod upgrade;

/// Upgrade timeout sweeping and its background worker.
pub mod upgrade_sweeper;

pub use config::Config;
pub use error::{FleetError, Result};

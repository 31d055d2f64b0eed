// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for clawfleet-core.

use thiserror::Error;

/// Fleet engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FleetError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No runtime row exists for the tenant.
    #[error("Runtime not found for tenant: {0}")]
    RuntimeNotFound(String),

    /// Caller lacks the role required for the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The `fleet_orchestration_enabled` flag is not set to `"true"`.
    #[error("Fleet orchestration is disabled")]
    OrchestrationDisabled,

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A single-row write kept losing optimistic concurrency races.
    #[error("Write conflict on runtime for tenant {tenant_id} after {attempts} attempts")]
    WriteConflict {
        /// Tenant whose runtime row could not be written.
        tenant_id: String,
        /// Number of attempts made.
        attempts: usize,
    },

    /// An external collaborator (authorization, flags, presence) failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl FleetError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::RuntimeNotFound(_) => "RUNTIME_NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::OrchestrationDisabled => "ORCHESTRATION_DISABLED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::WriteConflict { .. } => "WRITE_CONFLICT",
            Self::Collaborator(_) => "COLLABORATOR_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error is an authorization failure (role or feature flag).
    ///
    /// Authorization failures never mutate state and are not retried.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::OrchestrationDisabled)
    }

    /// Whether this error means the tenant has no runtime row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RuntimeNotFound(_))
    }
}

/// Result type using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            FleetError::RuntimeNotFound("t1".into()).error_code(),
            "RUNTIME_NOT_FOUND"
        );
        assert_eq!(
            FleetError::OrchestrationDisabled.error_code(),
            "ORCHESTRATION_DISABLED"
        );
        assert_eq!(
            FleetError::WriteConflict {
                tenant_id: "t1".into(),
                attempts: 5
            }
            .error_code(),
            "WRITE_CONFLICT"
        );
    }

    #[test]
    fn test_classification() {
        assert!(FleetError::Unauthorized("nope".into()).is_authorization());
        assert!(FleetError::OrchestrationDisabled.is_authorization());
        assert!(!FleetError::RuntimeNotFound("t1".into()).is_authorization());
        assert!(FleetError::RuntimeNotFound("t1".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = FleetError::WriteConflict {
            tenant_id: "tenant-a".into(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "Write conflict on runtime for tenant tenant-a after 5 attempts"
        );
    }
}

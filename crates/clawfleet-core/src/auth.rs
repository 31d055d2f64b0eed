// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization gates for the operation surface.
//!
//! Three caller classes exist:
//!
//! | Caller | Gate | Used by |
//! |--------|------|---------|
//! | Tenant admin | [`require_tenant_admin`] | request/clear upgrade, rollback, get runtime |
//! | Fleet orchestrator | [`require_fleet_orchestrator`] + [`require_fleet_orchestration_enabled`] | rolling upgrade, timeout sweep, fleet view |
//! | Runtime process | [`ServiceCredential`] | status and upgrade-result reports |

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::collaborators::{
    FLEET_ORCHESTRATION_ENABLED_FLAG, FLEET_ORCHESTRATOR_USER_ID_FLAG, FeatureFlags,
    RUNTIME_SERVICE_KEY_FLAG, TenantAuthorizer,
};
use crate::error::{FleetError, Result};

/// Fail unless `caller_id` administers `tenant_id`.
pub async fn require_tenant_admin(
    authorizer: &dyn TenantAuthorizer,
    caller_id: &str,
    tenant_id: &str,
) -> Result<()> {
    if authorizer.is_tenant_admin(caller_id, tenant_id).await? {
        Ok(())
    } else {
        Err(FleetError::Unauthorized(format!(
            "caller {} is not an admin of tenant {}",
            caller_id, tenant_id
        )))
    }
}

/// Whether `caller_id` is the designated fleet-orchestrator identity.
pub async fn is_fleet_orchestrator(flags: &dyn FeatureFlags, caller_id: &str) -> Result<bool> {
    let orchestrator = flags.get_flag(FLEET_ORCHESTRATOR_USER_ID_FLAG).await?;
    Ok(matches!(orchestrator, Some(id) if !id.is_empty() && id == caller_id))
}

/// Fail unless `caller_id` is the designated fleet-orchestrator identity.
pub async fn require_fleet_orchestrator(flags: &dyn FeatureFlags, caller_id: &str) -> Result<()> {
    if is_fleet_orchestrator(flags, caller_id).await? {
        Ok(())
    } else {
        Err(FleetError::Unauthorized(format!(
            "caller {} is not the fleet orchestrator",
            caller_id
        )))
    }
}

/// Fail unless the `fleet_orchestration_enabled` flag is exactly `"true"`.
pub async fn require_fleet_orchestration_enabled(flags: &dyn FeatureFlags) -> Result<()> {
    match flags.get_flag(FLEET_ORCHESTRATION_ENABLED_FLAG).await?.as_deref() {
        Some("true") => Ok(()),
        _ => Err(FleetError::OrchestrationDisabled),
    }
}

/// Proof that a runtime process presented a valid service key.
///
/// Only obtainable through one of the two verification entry points, so any
/// handler taking `&ServiceCredential` cannot be reached with an unverified
/// caller.
#[derive(Debug)]
pub struct ServiceCredential {
    _verified: (),
}

impl ServiceCredential {
    /// Verify against a secret the caller holds directly (e.g. from [`crate::Config`]).
    pub fn verify_with_key(expected: &str, presented: &str) -> Result<Self> {
        if keys_match(expected, presented) {
            Ok(Self { _verified: () })
        } else {
            warn!("Rejected runtime service credential");
            Err(FleetError::Unauthorized(
                "invalid service credential".to_string(),
            ))
        }
    }

    /// Verify against the secret stored in the feature-flag collaborator.
    pub async fn verify_with_flags(flags: &dyn FeatureFlags, presented: &str) -> Result<Self> {
        let expected = flags
            .get_flag(RUNTIME_SERVICE_KEY_FLAG)
            .await?
            .unwrap_or_default();
        Self::verify_with_key(&expected, presented)
    }
}

/// Compare keys by SHA-256 digest. An empty expected key never matches.
fn keys_match(expected: &str, presented: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticFeatureFlags;

    #[test]
    fn test_verify_with_key() {
        assert!(ServiceCredential::verify_with_key("s3cret", "s3cret").is_ok());
        assert!(ServiceCredential::verify_with_key("s3cret", "guess").is_err());
        assert!(ServiceCredential::verify_with_key("", "").is_err());
    }

    #[tokio::test]
    async fn test_verify_with_flags() {
        let flags = StaticFeatureFlags::new().with_flag(RUNTIME_SERVICE_KEY_FLAG, "s3cret");
        assert!(
            ServiceCredential::verify_with_flags(&flags, "s3cret")
                .await
                .is_ok()
        );

        let empty = StaticFeatureFlags::new();
        let err = ServiceCredential::verify_with_flags(&empty, "s3cret")
            .await
            .unwrap_err();
        assert!(err.is_authorization());
    }

    #[tokio::test]
    async fn test_orchestration_flag_must_be_literal_true() {
        let flags = StaticFeatureFlags::new().with_flag(FLEET_ORCHESTRATION_ENABLED_FLAG, "TRUE");
        assert!(matches!(
            require_fleet_orchestration_enabled(&flags).await,
            Err(FleetError::OrchestrationDisabled)
        ));

        flags.set_flag(FLEET_ORCHESTRATION_ENABLED_FLAG, "true");
        assert!(require_fleet_orchestration_enabled(&flags).await.is_ok());
    }

    #[tokio::test]
    async fn test_fleet_orchestrator_identity() {
        let flags = StaticFeatureFlags::new().with_flag(FLEET_ORCHESTRATOR_USER_ID_FLAG, "svc-fleet");
        assert!(require_fleet_orchestrator(&flags, "svc-fleet").await.is_ok());
        assert!(require_fleet_orchestrator(&flags, "alice").await.is_err());

        let unset = StaticFeatureFlags::new();
        assert!(!is_fleet_orchestrator(&unset, "").await.unwrap());
    }
}

//! Workload restart and scale operations
//!
//! Both are single remote patches with no local state. Scale requests are
//! validated here so that out-of-range counts never reach the cluster.
//!
//! A manual scale only changes the live object. Whatever declares the
//! workload (a GitOps controller, a Helm release) still holds the old replica
//! count and may put it back on its next sync.

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MAX_REPLICAS;
use crate::orchestrator::Orchestrator;
use crate::types::WorkloadRef;

/// Note attached to every successful manual scale
pub const RUNTIME_ONLY_NOTE: &str =
    "runtime only; the declarative spec is unchanged and may revert this on its next sync";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScaleError {
    #[error("Unknown scale target '{target}' (known: {known})")]
    UnknownTarget { target: String, known: String },
    #[error("Replica count {0} is outside 0..=10")]
    ReplicasOutOfRange(i32),
    #[error("Failed to scale {0}")]
    PatchFailed(WorkloadRef),
}

/// A logical name operators use to address a scalable workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub name: String,
    pub workload: WorkloadRef,
}

impl ScaleTarget {
    pub fn new(name: impl Into<String>, workload: WorkloadRef) -> Self {
        Self {
            name: name.into(),
            workload,
        }
    }
}

/// Result of an accepted scale request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub target: String,
    pub workload: WorkloadRef,
    pub replicas: i32,
    pub note: &'static str,
}

pub fn validate_replicas(replicas: i32) -> Result<i32, ScaleError> {
    if (0..=MAX_REPLICAS).contains(&replicas) {
        Ok(replicas)
    } else {
        Err(ScaleError::ReplicasOutOfRange(replicas))
    }
}

/// RFC 3339 timestamp stamped on restarts
pub fn restart_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Lifecycle {
    orchestrator: Orchestrator,
    targets: Vec<ScaleTarget>,
}

impl Lifecycle {
    pub fn new(orchestrator: Orchestrator, targets: Vec<ScaleTarget>) -> Self {
        Self {
            orchestrator,
            targets,
        }
    }

    pub fn targets(&self) -> &[ScaleTarget] {
        &self.targets
    }

    pub fn find_target(&self, name: &str) -> Option<&ScaleTarget> {
        let name = name.trim();
        self.targets
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Trigger a rolling restart. Returns whether the patch was accepted.
    pub async fn restart(&self, workload: &WorkloadRef) -> bool {
        let timestamp = restart_timestamp();
        let ok = self
            .orchestrator
            .patch_workload_restart(workload, &timestamp)
            .await;
        if ok {
            info!(workload = %workload, restarted_at = %timestamp, "Rolling restart requested");
        } else {
            warn!(workload = %workload, "Rolling restart request failed");
        }
        ok
    }

    /// Set a workload's replica count after validating it
    pub async fn scale_workload(&self, workload: &WorkloadRef, replicas: i32) -> Result<(), ScaleError> {
        let replicas = validate_replicas(replicas)?;
        if !self.orchestrator.scale_workload(workload, replicas).await {
            return Err(ScaleError::PatchFailed(workload.clone()));
        }
        info!(workload = %workload, replicas, "Scaled workload (runtime only)");
        Ok(())
    }

    /// Scale a named target
    pub async fn scale(&self, target: &str, replicas: i32) -> Result<ScaleOutcome, ScaleError> {
        let Some(scale_target) = self.find_target(target) else {
            let known = self
                .targets
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ScaleError::UnknownTarget {
                target: target.to_string(),
                known,
            });
        };

        self.scale_workload(&scale_target.workload, replicas).await?;
        Ok(ScaleOutcome {
            target: scale_target.name.clone(),
            workload: scale_target.workload.clone(),
            replicas,
            note: RUNTIME_ONLY_NOTE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_api::{ApiError, MockClusterApi, PatchStrategy};
    use crate::types::WorkloadKind;
    use std::sync::Arc;

    fn targets() -> Vec<ScaleTarget> {
        vec![
            ScaleTarget::new(
                "lobby",
                WorkloadRef::new("mc", "paper-lobby", WorkloadKind::StatefulSet),
            ),
            ScaleTarget::new(
                "survival",
                WorkloadRef::new("mc", "paper-survival", WorkloadKind::Deployment),
            ),
        ]
    }

    #[test]
    fn test_validate_replicas_bounds() {
        assert_eq!(validate_replicas(0), Ok(0));
        assert_eq!(validate_replicas(10), Ok(10));
        assert_eq!(validate_replicas(11), Err(ScaleError::ReplicasOutOfRange(11)));
        assert_eq!(validate_replicas(-1), Err(ScaleError::ReplicasOutOfRange(-1)));
    }

    #[test]
    fn test_restart_timestamp_is_rfc3339_seconds() {
        let ts = restart_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
    }

    #[tokio::test]
    async fn test_out_of_range_scale_makes_no_call() {
        // No expectations: any cluster call would panic
        let lifecycle = Lifecycle::new(Orchestrator::new(Arc::new(MockClusterApi::new())), targets());

        assert_eq!(
            lifecycle.scale("lobby", 11).await,
            Err(ScaleError::ReplicasOutOfRange(11))
        );
        assert_eq!(
            lifecycle.scale("lobby", -3).await,
            Err(ScaleError::ReplicasOutOfRange(-3))
        );
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let lifecycle = Lifecycle::new(Orchestrator::new(Arc::new(MockClusterApi::new())), targets());

        let err = lifecycle.scale("skyblock", 1).await.unwrap_err();
        assert_eq!(
            err,
            ScaleError::UnknownTarget {
                target: "skyblock".to_string(),
                known: "lobby, survival".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_scale_named_target() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_workload()
            .withf(|workload, strategy, patch| {
                workload.name == "paper-survival"
                    && workload.kind == WorkloadKind::Deployment
                    && *strategy == PatchStrategy::Merge
                    && patch["spec"]["replicas"] == 4
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let lifecycle = Lifecycle::new(Orchestrator::new(Arc::new(mock)), targets());

        let outcome = lifecycle.scale("Survival", 4).await.unwrap();
        assert_eq!(outcome.target, "survival");
        assert_eq!(outcome.replicas, 4);
        assert_eq!(outcome.note, RUNTIME_ONLY_NOTE);
    }

    #[tokio::test]
    async fn test_scale_patch_failure() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_workload().returning(|_, _, _| {
            Err(ApiError::Status {
                code: 404,
                body: "not found".to_string(),
            })
        });
        let lifecycle = Lifecycle::new(Orchestrator::new(Arc::new(mock)), targets());

        assert!(matches!(
            lifecycle.scale("lobby", 1).await,
            Err(ScaleError::PatchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_uses_strategic_patch() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_workload()
            .withf(|workload, strategy, _| {
                workload.kind == WorkloadKind::StatefulSet && *strategy == PatchStrategy::Strategic
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let lifecycle = Lifecycle::new(Orchestrator::new(Arc::new(mock)), vec![]);

        let workload = WorkloadRef::new("mc", "velocity", WorkloadKind::StatefulSet);
        assert!(lifecycle.restart(&workload).await);
    }

    #[tokio::test]
    async fn test_restart_degraded_returns_false() {
        let lifecycle = Lifecycle::new(Orchestrator::degraded(), vec![]);
        let workload = WorkloadRef::new("mc", "velocity", WorkloadKind::StatefulSet);
        assert!(!lifecycle.restart(&workload).await);
    }
}

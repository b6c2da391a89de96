//! Failure-absorbing facade over [`ClusterApi`]
//!
//! Discovery and lifecycle callers never see transport or API errors: every
//! failure is logged with its status and body and turned into an empty
//! result or `false`. Without credentials the facade runs degraded and makes
//! no network calls at all.

use std::sync::Arc;

use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::annotations;
use crate::kube_api::{ApiError, ClusterApi, KubeClusterApi, PatchStrategy, WatchNotice};
use crate::resolver;
use crate::types::{BackendCandidate, PodRef, WorkloadRef};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator client is degraded (no credentials)")]
    Degraded,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Namespace and label that scope discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryScope {
    pub namespace: String,
    pub label_key: String,
    pub label_value: String,
}

impl DiscoveryScope {
    pub fn new(
        namespace: impl Into<String>,
        label_key: impl Into<String>,
        label_value: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            label_key: label_key.into(),
            label_value: label_value.into(),
        }
    }

    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label_key, self.label_value)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    api: Option<Arc<dyn ClusterApi>>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api: Some(api) }
    }

    /// A client that performs no I/O and reports every operation as failed
    pub fn degraded() -> Self {
        Self { api: None }
    }

    /// Connect using the mounted service account, degrading on failure
    pub fn in_cluster() -> Self {
        match KubeClusterApi::in_cluster() {
            Ok(api) => Self::new(Arc::new(api)),
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    "Kubernetes credentials unavailable, discovery and lifecycle operations disabled"
                );
                Self::degraded()
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.api.is_none()
    }

    fn api(&self) -> Result<&Arc<dyn ClusterApi>, OrchestratorError> {
        self.api.as_ref().ok_or(OrchestratorError::Degraded)
    }

    /// Pods matching `label_selector`, empty on any failure
    pub async fn list_labeled_pods(&self, namespace: &str, label_selector: &str) -> Vec<PodRef> {
        let Ok(api) = self.api() else {
            return Vec::new();
        };
        match api.list_pods(namespace, label_selector).await {
            Ok(pods) => pods.iter().map(pod_ref).collect(),
            Err(e) => {
                log_api_error(&e, "Failed to list pods");
                Vec::new()
            }
        }
    }

    /// Discover backend candidates, surfacing failures.
    ///
    /// Services and endpoints are fetched in two calls with the same selector.
    pub async fn try_list_discoverable_backends(
        &self,
        scope: &DiscoveryScope,
    ) -> Result<Vec<BackendCandidate>, OrchestratorError> {
        let api = self.api()?;
        let selector = scope.label_selector();
        let services = api.list_services(&scope.namespace, &selector).await?;
        let endpoints = api.list_endpoints(&scope.namespace, &selector).await?;

        let candidates = resolver::resolve_candidates(&services, &endpoints);
        debug!(
            services = services.len(),
            endpoints = endpoints.len(),
            candidates = candidates.len(),
            "Resolved discoverable backends"
        );
        Ok(candidates)
    }

    /// Discover backend candidates, empty on any failure
    pub async fn list_discoverable_backends(&self, scope: &DiscoveryScope) -> Vec<BackendCandidate> {
        match self.try_list_discoverable_backends(scope).await {
            Ok(candidates) => candidates,
            Err(OrchestratorError::Degraded) => Vec::new(),
            Err(OrchestratorError::Api(e)) => {
                log_api_error(&e, "Failed to list discoverable backends");
                Vec::new()
            }
        }
    }

    /// Stamp the restart annotation on the workload's pod template
    pub async fn patch_workload_restart(&self, workload: &WorkloadRef, timestamp: &str) -> bool {
        let Ok(api) = self.api() else {
            return false;
        };
        let restart_key = annotations::RESTARTED_AT;
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { restart_key: timestamp }
                    }
                }
            }
        });
        match api
            .patch_workload(workload, PatchStrategy::Strategic, patch)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log_api_error(&e, "Failed to restart workload");
                false
            }
        }
    }

    /// Set the replica count. Bounds are enforced by the caller.
    pub async fn scale_workload(&self, workload: &WorkloadRef, replicas: i32) -> bool {
        let Ok(api) = self.api() else {
            return false;
        };
        let patch = json!({ "spec": { "replicas": replicas } });
        match api.patch_workload(workload, PatchStrategy::Merge, patch).await {
            Ok(()) => true,
            Err(e) => {
                log_api_error(&e, "Failed to scale workload");
                false
            }
        }
    }

    /// One key of a config map, `None` if the map or key is missing
    pub async fn get_config_value(
        &self,
        namespace: &str,
        config_name: &str,
        key: &str,
    ) -> Option<String> {
        let api = self.api().ok()?;
        match api.get_config_map(namespace, config_name).await {
            Ok(cm) => cm?.data?.remove(key),
            Err(e) => {
                log_api_error(&e, "Failed to read config map");
                None
            }
        }
    }

    /// Merge-patch a single config map key
    pub async fn patch_config_value(
        &self,
        namespace: &str,
        config_name: &str,
        key: &str,
        value: &str,
    ) -> bool {
        let Ok(api) = self.api() else {
            return false;
        };
        let patch = json!({ "data": { key: value } });
        match api.patch_config_map(namespace, config_name, patch).await {
            Ok(()) => true,
            Err(e) => {
                log_api_error(&e, "Failed to patch config map");
                false
            }
        }
    }

    /// Open an endpoints watch for the discovery scope
    pub fn watch_discoverable_endpoints(
        &self,
        scope: &DiscoveryScope,
    ) -> Result<BoxStream<'static, Result<WatchNotice, ApiError>>, OrchestratorError> {
        let api = self.api()?;
        Ok(api.watch_endpoints(&scope.namespace, &scope.label_selector()))
    }
}

fn pod_ref(pod: &Pod) -> PodRef {
    let status = pod.status.as_ref();
    PodRef {
        name: pod.metadata.name.clone().unwrap_or_default(),
        address: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        ready: status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            }),
    }
}

pub(crate) fn log_api_error(err: &ApiError, message: &str) {
    match err {
        ApiError::Status { code, body } => {
            error!(status = code, body = %body, "{message}");
        }
        other => {
            error!(error = %other, "{message}");
        }
    }
}

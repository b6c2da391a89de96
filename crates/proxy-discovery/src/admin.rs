//! Operations backing the administrative command surface
//!
//! Command parsing and presentation belong to the host; these methods only
//! perform the operation and return something the host can report.

use std::sync::Arc;

use crate::config::DiscoveryConfig;
use crate::default_route::{DefaultRouteError, DefaultRouteResolver};
use crate::lifecycle::{Lifecycle, ScaleError, ScaleOutcome};
use crate::orchestrator::Orchestrator;
use crate::pinning::{PinError, PinningPolicy, TransferTarget};
use crate::reconciler::{ManagedSet, Reconciler};
use crate::routing::{RegisteredRoute, RoutingTable};
use crate::types::{BackendCandidate, PodRef, WorkloadRef};

/// The cached default key and the route it currently resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRouteInfo {
    pub key: String,
    pub resolved: Option<String>,
}

/// A routing table entry annotated with its provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEntry {
    pub route: RegisteredRoute,
    /// Created by discovery rather than static configuration
    pub discovered: bool,
}

/// A proxy-tier pod as listed to operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPod {
    pub pod: PodRef,
    /// This process runs in the pod
    pub current: bool,
}

pub struct AdminOps {
    orchestrator: Orchestrator,
    table: Arc<dyn RoutingTable>,
    managed: Arc<ManagedSet>,
    reconciler: Arc<Reconciler>,
    default_route: Arc<DefaultRouteResolver>,
    lifecycle: Lifecycle,
    pinning: PinningPolicy,
    namespace: String,
    proxy_workload: WorkloadRef,
    proxy_pod_selector: String,
}

impl AdminOps {
    pub fn new(
        config: &DiscoveryConfig,
        orchestrator: Orchestrator,
        table: Arc<dyn RoutingTable>,
        reconciler: Arc<Reconciler>,
        default_route: Arc<DefaultRouteResolver>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(orchestrator.clone(), config.scale_targets.clone()),
            pinning: PinningPolicy::from_config(config),
            managed: reconciler.managed().clone(),
            orchestrator,
            table,
            reconciler,
            default_route,
            namespace: config.namespace.clone(),
            proxy_workload: config.proxy_workload.clone(),
            proxy_pod_selector: config.proxy_pod_selector.clone(),
        }
    }

    /// Name of the pod this process runs in
    pub fn current_pod(&self) -> &str {
        &self.pinning.current_pod
    }

    pub fn resolve_default(&self) -> Option<RegisteredRoute> {
        self.default_route.resolve()
    }

    pub fn describe_default(&self) -> DefaultRouteInfo {
        DefaultRouteInfo {
            key: self.default_route.current_key(),
            resolved: self.resolve_default().map(|route| route.name),
        }
    }

    /// Persist a new default key and report what it now resolves to
    pub async fn set_default(&self, key: &str) -> Result<DefaultRouteInfo, DefaultRouteError> {
        self.default_route.set_and_persist(key).await?;
        Ok(self.describe_default())
    }

    /// Every registered route, ordered by name
    pub fn list_backends(&self) -> Vec<BackendEntry> {
        self.table
            .list()
            .into_iter()
            .map(|route| BackendEntry {
                discovered: self.managed.contains(&route.name),
                route,
            })
            .collect()
    }

    /// Fresh discovery results, including candidates that are not ready
    pub async fn list_discovered(&self) -> Vec<BackendCandidate> {
        self.orchestrator
            .list_discoverable_backends(self.reconciler.scope())
            .await
    }

    /// Rolling-restart the proxy tier itself
    pub async fn restart_proxy(&self) -> bool {
        self.lifecycle.restart(&self.proxy_workload).await
    }

    pub async fn restart(&self, workload: &WorkloadRef) -> bool {
        self.lifecycle.restart(workload).await
    }

    pub async fn scale(&self, target: &str, replicas: i32) -> Result<ScaleOutcome, ScaleError> {
        self.lifecycle.scale(target, replicas).await
    }

    /// Names accepted by [`AdminOps::scale`]
    pub fn scale_targets(&self) -> Vec<String> {
        self.lifecycle
            .targets()
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Proxy-tier pods ordered by name
    pub async fn list_proxy_pods(&self) -> Vec<ProxyPod> {
        let mut pods = self
            .orchestrator
            .list_labeled_pods(&self.namespace, &self.proxy_pod_selector)
            .await;
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods.into_iter()
            .map(|pod| ProxyPod {
                current: pod.name == self.pinning.current_pod,
                pod,
            })
            .collect()
    }

    /// Decide how to transfer a client onto `pod_name`
    pub async fn pin_instance(&self, pod_name: &str) -> Result<TransferTarget, PinError> {
        let pods = self
            .orchestrator
            .list_labeled_pods(&self.namespace, &self.proxy_pod_selector)
            .await;
        self.pinning.plan(&pods, pod_name.trim())
    }
}

//! Typed, fallible access to the cluster control plane
//!
//! [`ClusterApi`] is the narrow set of calls discovery and lifecycle control
//! need. Every request is bounded by [`REQUEST_TIMEOUT`] and none retries;
//! retry policy belongs to the caller.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Service};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Api, Client, Config, ResourceExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::{WorkloadKind, WorkloadRef};

/// Upper bound on a single orchestrator request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Location of the mounted service account credentials
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("API returned status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("Failed to decode API response: {0}")]
    Decode(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Watch stream failed: {0}")]
    Watch(String),
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref ae) => ApiError::Status {
                code: ae.code,
                body: ae.message.clone(),
            },
            kube::Error::SerdeError(e) => ApiError::Decode(e.to_string()),
            other => ApiError::Transport(other.to_string()),
        }
    }
}

/// Patch flavour for workload mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// `application/strategic-merge-patch+json`
    Strategic,
    /// `application/merge-patch+json`
    Merge,
}

/// A change observed on a watched endpoints collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotice {
    Applied(String),
    Deleted(String),
    /// The watch (re)listed the full collection
    Resynced,
}

/// Cluster operations used by discovery and lifecycle control
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ApiError>;

    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, ApiError>;

    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, ApiError>;

    /// Fetch a config map, `None` when it does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ApiError>;

    /// Merge-patch a config map
    async fn patch_config_map(
        &self,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<(), ApiError>;

    async fn patch_workload(
        &self,
        workload: &WorkloadRef,
        strategy: PatchStrategy,
        patch: Value,
    ) -> Result<(), ApiError>;

    /// Open a watch on label-selected endpoints.
    ///
    /// The stream ends or yields an error when the connection drops; callers
    /// reconnect by calling this again.
    fn watch_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> BoxStream<'static, Result<WatchNotice, ApiError>>;
}

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    request_timeout: Duration,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request bound
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let client = Client::try_from(config).context("Failed to build Kubernetes client")?;
        Ok(Self::new(client))
    }

    /// Build a client from the mounted service account.
    ///
    /// Fails when the bearer token or CA certificate is missing or unreadable.
    pub fn in_cluster() -> anyhow::Result<Self> {
        Self::in_cluster_from(Path::new(SERVICE_ACCOUNT_DIR))
    }

    fn in_cluster_from(dir: &Path) -> anyhow::Result<Self> {
        let token_path = dir.join("token");
        let token = std::fs::read_to_string(&token_path)
            .with_context(|| format!("Failed to read service account token {}", token_path.display()))?;
        ensure!(!token.trim().is_empty(), "Service account token is empty");

        let ca_path = dir.join("ca.crt");
        std::fs::metadata(&ca_path)
            .with_context(|| format!("Failed to read cluster CA {}", ca_path.display()))?;

        let mut config = Config::incluster_dns().context("Failed to load in-cluster config")?;
        config.connect_timeout = Some(REQUEST_TIMEOUT);
        Self::from_config(config)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        }
    }

    async fn patch_typed<K>(
        &self,
        workload: &WorkloadRef,
        patch: &Patch<Value>,
    ) -> Result<(), ApiError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &workload.namespace);
        self.bounded(api.patch(&workload.name, &PatchParams::default(), patch))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self))]
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ApiError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded(api.list(&ListParams::default().labels(label_selector)))
            .await?;
        debug!(count = list.items.len(), "Listed pods");
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn list_services(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>, ApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded(api.list(&ListParams::default().labels(label_selector)))
            .await?;
        debug!(count = list.items.len(), "Listed services");
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, ApiError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded(api.list(&ListParams::default().labels(label_selector)))
            .await?;
        debug!(count = list.items.len(), "Listed endpoints");
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ApiError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name)).await
    }

    #[instrument(skip(self, patch))]
    async fn patch_config_map(
        &self,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<(), ApiError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.patch(name, &PatchParams::default(), &Patch::Merge(patch)))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, workload, patch), fields(workload = %workload))]
    async fn patch_workload(
        &self,
        workload: &WorkloadRef,
        strategy: PatchStrategy,
        patch: Value,
    ) -> Result<(), ApiError> {
        let patch = match strategy {
            PatchStrategy::Strategic => Patch::Strategic(patch),
            PatchStrategy::Merge => Patch::Merge(patch),
        };
        match workload.kind {
            WorkloadKind::Deployment => self.patch_typed::<Deployment>(workload, &patch).await,
            WorkloadKind::StatefulSet => self.patch_typed::<StatefulSet>(workload, &patch).await,
        }
    }

    fn watch_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> BoxStream<'static, Result<WatchNotice, ApiError>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(label_selector);

        watcher(api, config)
            .filter_map(|event| {
                let notice = match event {
                    Ok(watcher::Event::Apply(ep)) => Some(Ok(WatchNotice::Applied(ep.name_any()))),
                    Ok(watcher::Event::Delete(ep)) => Some(Ok(WatchNotice::Deleted(ep.name_any()))),
                    Ok(watcher::Event::InitDone) => Some(Ok(WatchNotice::Resynced)),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitApply(_)) => None,
                    Err(e) => Some(Err(ApiError::Watch(e.to_string()))),
                };
                futures::future::ready(notice)
            })
            .boxed()
    }
}

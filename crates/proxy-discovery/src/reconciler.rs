//! Route reconciliation
//!
//! Converges the proxy's routing table with the set of ready, discovered
//! backends. Only routes in the [`ManagedSet`] are ever modified; a
//! discovered name colliding with a route this crate did not create is
//! skipped, never overwritten.
//!
//! Passes are serialized by a single async lock held across the fetch, diff
//! and write. The managed-set has its own short-lived lock so read paths such
//! as default-route resolution never wait on network I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::orchestrator::{DiscoveryScope, Orchestrator, OrchestratorError};
use crate::resolver;
use crate::routing::{RegisteredRoute, RouteAddress, RoutingTable};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to fetch discoverable backends: {0}")]
    Fetch(#[from] OrchestratorError),
}

/// Names of routes created by discovery
#[derive(Debug, Default)]
pub struct ManagedSet {
    names: RwLock<BTreeSet<String>>,
}

impl ManagedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    /// Snapshot of managed names in lexicographic order
    pub fn names(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    pub(crate) fn insert(&self, name: String) {
        self.names.write().insert(name);
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        self.names.write().remove(name)
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Desired names that collide with routes discovery does not own
    pub skipped_unmanaged: Vec<String>,
    pub unchanged: usize,
    /// Candidates dropped because no endpoint address was ready
    pub not_ready: usize,
}

impl ReconcileReport {
    /// Whether the pass left the routing table untouched
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct Reconciler {
    orchestrator: Orchestrator,
    table: Arc<dyn RoutingTable>,
    managed: Arc<ManagedSet>,
    scope: DiscoveryScope,
    name_prefix: String,
    pass_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        orchestrator: Orchestrator,
        table: Arc<dyn RoutingTable>,
        managed: Arc<ManagedSet>,
        scope: DiscoveryScope,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            table,
            managed,
            scope,
            name_prefix: name_prefix.into(),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn managed(&self) -> &Arc<ManagedSet> {
        &self.managed
    }

    pub fn scope(&self) -> &DiscoveryScope {
        &self.scope
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Run one reconciliation pass.
    ///
    /// A failed fetch leaves the routing table and managed-set untouched.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.pass_lock.lock().await;

        let candidates = self
            .orchestrator
            .try_list_discoverable_backends(&self.scope)
            .await?;

        let mut report = ReconcileReport::default();
        let mut desired: BTreeMap<String, RouteAddress> = BTreeMap::new();
        for candidate in candidates {
            if !candidate.is_ready() {
                report.not_ready += 1;
                continue;
            }
            desired.insert(
                resolver::route_name(&self.name_prefix, &candidate.name),
                candidate.address(),
            );
        }

        for (name, address) in &desired {
            self.apply(name, address, &mut report);
        }

        for name in self.managed.names() {
            if desired.contains_key(&name) {
                continue;
            }
            self.table.unregister(&name);
            self.managed.remove(&name);
            info!(name = %name, "Removed stale discovered route");
            report.removed.push(name);
        }

        debug!(
            registered = report.registered.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            skipped = report.skipped_unmanaged.len(),
            unchanged = report.unchanged,
            not_ready = report.not_ready,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    fn apply(&self, name: &str, address: &RouteAddress, report: &mut ReconcileReport) {
        match self.table.lookup(name) {
            None => {
                if self.register(name, address) {
                    info!(name = %name, address = %address, "Registered discovered route");
                    report.registered.push(name.to_string());
                }
            }
            Some(_) if !self.managed.contains(name) => {
                debug!(name = %name, "Route exists and is not managed by discovery, skipping");
                report.skipped_unmanaged.push(name.to_string());
            }
            Some(existing) if existing.address == *address => {
                report.unchanged += 1;
            }
            Some(existing) => {
                self.table.unregister(name);
                if self.register(name, address) {
                    info!(
                        name = %name,
                        old = %existing.address,
                        new = %address,
                        "Updated discovered route address"
                    );
                    report.updated.push(name.to_string());
                } else {
                    self.managed.remove(name);
                    report.removed.push(name.to_string());
                }
            }
        }
    }

    fn register(&self, name: &str, address: &RouteAddress) -> bool {
        match self
            .table
            .register(RegisteredRoute::new(name, address.clone()))
        {
            Ok(()) => {
                self.managed.insert(name.to_string());
                true
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to register discovered route");
                false
            }
        }
    }

    /// Run a pass, logging instead of returning failures
    pub async fn run_pass(&self) {
        if let Err(e) = self.reconcile().await {
            match e {
                ReconcileError::Fetch(OrchestratorError::Degraded) => {
                    debug!("Skipping reconciliation, orchestrator client degraded");
                }
                other => warn!(error = %other, "Reconciliation pass failed, routes left unchanged"),
            }
        }
    }
}

//! Background tasks driving discovery
//!
//! [`DiscoveryRuntime::start`] wires the components together, runs the
//! initial refresh and pass inline, then spawns the periodic ticker and
//! (when enabled) the endpoint watch. All tasks stop on one cancellation
//! token.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::AdminOps;
use crate::config::DiscoveryConfig;
use crate::default_route::DefaultRouteResolver;
use crate::orchestrator::{DiscoveryScope, Orchestrator};
use crate::reconciler::{ManagedSet, Reconciler};
use crate::routing::RoutingTable;
use crate::watch::WatchLoop;

pub struct DiscoveryRuntime;

impl DiscoveryRuntime {
    /// Build the components and start background work.
    ///
    /// Returns once the initial default-key refresh and reconciliation pass
    /// have finished, so callers may report readiness afterwards.
    pub async fn start(
        config: &DiscoveryConfig,
        orchestrator: Orchestrator,
        table: Arc<dyn RoutingTable>,
    ) -> RuntimeHandle {
        let managed = Arc::new(ManagedSet::new());
        let scope = DiscoveryScope::new(&config.namespace, &config.label_key, &config.label_value);
        let reconciler = Arc::new(Reconciler::new(
            orchestrator.clone(),
            table.clone(),
            managed.clone(),
            scope,
            &config.name_prefix,
        ));
        let default_route = Arc::new(DefaultRouteResolver::new(
            orchestrator.clone(),
            table.clone(),
            managed,
            &config.namespace,
            &config.runtime_config_map,
            &config.name_prefix,
        ));
        let admin = Arc::new(AdminOps::new(
            config,
            orchestrator.clone(),
            table,
            reconciler.clone(),
            default_route.clone(),
        ));

        default_route.refresh().await;
        if config.discovery_enabled {
            reconciler.run_pass().await;
        } else {
            info!("Discovery disabled, only the default route key is refreshed");
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_ticker(
            reconciler.clone(),
            default_route.clone(),
            config.discovery_enabled,
            config.poll_interval,
            cancel.child_token(),
        )));

        if config.discovery_enabled && config.watch_enabled {
            if orchestrator.is_degraded() {
                warn!("Orchestrator client degraded, endpoint watch not started");
            } else {
                let watch = WatchLoop::new(orchestrator, reconciler.clone());
                tasks.push(tokio::spawn(watch.run(cancel.child_token())));
            }
        }

        info!(
            discovery = config.discovery_enabled,
            watch = config.watch_enabled,
            interval_secs = config.poll_interval.as_secs(),
            tasks = tasks.len(),
            "Discovery runtime started"
        );

        RuntimeHandle {
            cancel,
            tasks,
            admin,
            reconciler,
            default_route,
        }
    }
}

/// Periodic refresh of the default key and, when enabled, a reconciliation pass
async fn run_ticker(
    reconciler: Arc<Reconciler>,
    default_route: Arc<DefaultRouteResolver>,
    discovery_enabled: bool,
    period: Duration,
    cancel: CancellationToken,
) {
    // The initial pass already ran, so the first tick is one period out
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Discovery ticker stopped");
                return;
            }
            _ = ticker.tick() => {
                default_route.refresh().await;
                if discovery_enabled {
                    reconciler.run_pass().await;
                }
            }
        }
    }
}

/// Owns the spawned tasks and the components they share
pub struct RuntimeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    admin: Arc<AdminOps>,
    reconciler: Arc<Reconciler>,
    default_route: Arc<DefaultRouteResolver>,
}

impl RuntimeHandle {
    pub fn admin(&self) -> &Arc<AdminOps> {
        &self.admin
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn default_route(&self) -> &Arc<DefaultRouteResolver> {
        &self.default_route
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = ?e, "Discovery task panicked");
                } else {
                    warn!(error = %e, "Discovery task did not finish cleanly");
                }
            }
        }
        info!("Discovery runtime stopped");
    }
}

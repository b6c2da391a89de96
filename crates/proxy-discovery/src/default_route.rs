//! Default route resolution
//!
//! The default route key is a logical name stored in a config map and cached
//! in memory. [`DefaultRouteResolver::resolve`] is on the session routing path
//! and only reads the cache, the routing table and the managed-set.
//!
//! Refreshes and explicit sets hold one async lock across their remote call
//! and cache write, so a refresh that read the old key can never overwrite a
//! newer key set while it was in flight.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::keys;
use crate::orchestrator::Orchestrator;
use crate::reconciler::ManagedSet;
use crate::routing::{RegisteredRoute, RoutingTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefaultRouteError {
    #[error("Default route key must not be blank")]
    BlankKey,
    #[error("Failed to persist default route key '{0}'")]
    PersistFailed(String),
}

pub struct DefaultRouteResolver {
    orchestrator: Orchestrator,
    table: Arc<dyn RoutingTable>,
    managed: Arc<ManagedSet>,
    namespace: String,
    config_map: String,
    name_prefix: String,
    key: RwLock<String>,
    sync_lock: Mutex<()>,
}

impl DefaultRouteResolver {
    pub fn new(
        orchestrator: Orchestrator,
        table: Arc<dyn RoutingTable>,
        managed: Arc<ManagedSet>,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            table,
            managed,
            namespace: namespace.into(),
            config_map: config_map.into(),
            name_prefix: name_prefix.into(),
            key: RwLock::new(keys::FALLBACK_ROUTE.to_string()),
            sync_lock: Mutex::new(()),
        }
    }

    /// Currently cached default key
    pub fn current_key(&self) -> String {
        self.key.read().clone()
    }

    /// Resolve the cached key to a registered route.
    ///
    /// Tries an exact route name first, then the lexicographically first
    /// managed route named after the key (with or without the discovery
    /// prefix, optionally followed by `-<suffix>`), then the fallback route.
    pub fn resolve(&self) -> Option<RegisteredRoute> {
        let key = self.current_key();

        if let Some(route) = self.table.lookup(&key) {
            return Some(route);
        }

        let prefixed = format!("{}{}", self.name_prefix, key);
        let matched = self
            .managed
            .names()
            .into_iter()
            .filter(|name| {
                matches_key(name, &key) || (!self.name_prefix.is_empty() && matches_key(name, &prefixed))
            })
            .find_map(|name| self.table.lookup(&name));
        if matched.is_some() {
            return matched;
        }

        self.table.lookup(keys::FALLBACK_ROUTE)
    }

    /// Re-read the key from the config map.
    ///
    /// Blank or missing values keep the cached key. Returns whether the
    /// cached key changed.
    pub async fn refresh(&self) -> bool {
        let _guard = self.sync_lock.lock().await;
        let Some(value) = self
            .orchestrator
            .get_config_value(&self.namespace, &self.config_map, keys::DEFAULT_SERVER)
            .await
        else {
            debug!("Default route key not readable, keeping cached value");
            return false;
        };

        let value = value.trim();
        if value.is_empty() {
            return false;
        }

        let mut key = self.key.write();
        if *key == value {
            return false;
        }
        info!(old = %*key, new = %value, "Default route key changed");
        *key = value.to_string();
        true
    }

    /// Persist a new key, updating the cache only if the write succeeds
    pub async fn set_and_persist(&self, new_key: &str) -> Result<(), DefaultRouteError> {
        let new_key = new_key.trim();
        if new_key.is_empty() {
            return Err(DefaultRouteError::BlankKey);
        }

        let _guard = self.sync_lock.lock().await;
        let persisted = self
            .orchestrator
            .patch_config_value(&self.namespace, &self.config_map, keys::DEFAULT_SERVER, new_key)
            .await;
        if !persisted {
            warn!(key = %new_key, "Default route key not persisted, cache unchanged");
            return Err(DefaultRouteError::PersistFailed(new_key.to_string()));
        }

        *self.key.write() = new_key.to_string();
        info!(key = %new_key, "Default route key set");
        Ok(())
    }
}

fn matches_key(name: &str, key: &str) -> bool {
    name == key
        || name
            .strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_api::{ApiError, MockClusterApi};
    use crate::routing::{InMemoryRoutingTable, RouteAddress};
    use k8s_openapi::api::core::v1::ConfigMap;

    fn route(name: &str, host: &str) -> RegisteredRoute {
        RegisteredRoute::new(name, RouteAddress::new(host, 25565))
    }

    fn resolver_with(
        mock: MockClusterApi,
        table: Arc<InMemoryRoutingTable>,
        managed: Arc<ManagedSet>,
    ) -> DefaultRouteResolver {
        DefaultRouteResolver::new(
            Orchestrator::new(Arc::new(mock)),
            table,
            managed,
            "mc",
            "proxy-discovery-runtime",
            "auto-",
        )
    }

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            data: Some([(keys::DEFAULT_SERVER.to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    fn mock_returning(value: Option<&'static str>) -> MockClusterApi {
        let mut mock = MockClusterApi::new();
        mock.expect_get_config_map()
            .returning(move |_, _| Ok(value.map(config_map)));
        mock
    }

    #[tokio::test]
    async fn test_exact_match_wins() {
        let table = Arc::new(InMemoryRoutingTable::with_routes([
            route("lobby", "10.0.0.1"),
            route("auto-lobby-0", "10.0.0.2"),
        ]));
        let managed = Arc::new(ManagedSet::new());
        managed.insert("auto-lobby-0".to_string());
        let resolver = resolver_with(mock_returning(Some("lobby")), table, managed);

        assert!(resolver.refresh().await);
        assert_eq!(resolver.resolve().unwrap().name, "lobby");
    }

    #[tokio::test]
    async fn test_prefix_match_on_managed_routes() {
        let table = Arc::new(InMemoryRoutingTable::with_routes([route(
            "auto-lobby-2-123456",
            "10.0.0.5",
        )]));
        let managed = Arc::new(ManagedSet::new());
        managed.insert("auto-lobby-2-123456".to_string());
        let resolver = resolver_with(mock_returning(Some("lobby")), table, managed);

        resolver.refresh().await;
        assert_eq!(resolver.resolve().unwrap().name, "auto-lobby-2-123456");
    }

    #[tokio::test]
    async fn test_prefix_match_is_lexicographic() {
        let table = Arc::new(InMemoryRoutingTable::with_routes([
            route("auto-lobby-1", "10.0.0.6"),
            route("auto-lobby-0", "10.0.0.5"),
            route("auto-lobbyist-0", "10.0.0.7"),
        ]));
        let managed = Arc::new(ManagedSet::new());
        for name in ["auto-lobby-1", "auto-lobby-0", "auto-lobbyist-0"] {
            managed.insert(name.to_string());
        }
        let resolver = resolver_with(mock_returning(Some("lobby")), table, managed);

        resolver.refresh().await;
        assert_eq!(resolver.resolve().unwrap().name, "auto-lobby-0");
    }

    #[tokio::test]
    async fn test_unmanaged_routes_are_not_prefix_matched() {
        let table = Arc::new(InMemoryRoutingTable::with_routes([
            route("lobby-static", "10.0.0.1"),
            route("limbo", "10.0.0.9"),
        ]));
        let resolver = resolver_with(
            mock_returning(Some("lobby")),
            table,
            Arc::new(ManagedSet::new()),
        );

        resolver.refresh().await;
        assert_eq!(resolver.resolve().unwrap().name, "limbo");
    }

    #[tokio::test]
    async fn test_falls_back_to_limbo() {
        let table = Arc::new(InMemoryRoutingTable::with_routes([route("limbo", "10.0.0.9")]));
        let resolver = resolver_with(
            mock_returning(Some("survival")),
            table,
            Arc::new(ManagedSet::new()),
        );

        resolver.refresh().await;
        assert_eq!(resolver.resolve().unwrap().name, "limbo");
    }

    #[test]
    fn test_nothing_resolves_without_fallback_route() {
        let resolver = resolver_with(
            MockClusterApi::new(),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );
        assert_eq!(resolver.current_key(), "limbo");
        assert!(resolver.resolve().is_none());
    }

    #[tokio::test]
    async fn test_refresh_ignores_blank_and_missing() {
        let resolver = resolver_with(
            mock_returning(Some("  ")),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );
        assert!(!resolver.refresh().await);
        assert_eq!(resolver.current_key(), "limbo");

        let resolver = resolver_with(
            mock_returning(None),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );
        assert!(!resolver.refresh().await);
        assert_eq!(resolver.current_key(), "limbo");
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_last_known_key() {
        let mut mock = MockClusterApi::new();
        let mut calls = 0;
        mock.expect_get_config_map().returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(Some(config_map(" survival ")))
            } else {
                Err(ApiError::Timeout(std::time::Duration::from_secs(5)))
            }
        });
        let resolver = resolver_with(
            mock,
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );

        assert!(resolver.refresh().await);
        assert_eq!(resolver.current_key(), "survival");
        assert!(!resolver.refresh().await);
        assert_eq!(resolver.current_key(), "survival");
    }

    #[tokio::test]
    async fn test_set_and_persist_updates_cache_on_success() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_config_map()
            .withf(|ns, name, patch| {
                ns == "mc"
                    && name == "proxy-discovery-runtime"
                    && patch["data"][keys::DEFAULT_SERVER] == "creative"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let resolver = resolver_with(
            mock,
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );

        resolver.set_and_persist(" creative ").await.unwrap();
        assert_eq!(resolver.current_key(), "creative");
    }

    #[tokio::test]
    async fn test_set_and_persist_keeps_cache_on_failure() {
        let mut mock = MockClusterApi::new();
        mock.expect_patch_config_map().returning(|_, _, _| {
            Err(ApiError::Status {
                code: 403,
                body: "forbidden".to_string(),
            })
        });
        let resolver = resolver_with(
            mock,
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );

        let result = resolver.set_and_persist("creative").await;
        assert_eq!(
            result,
            Err(DefaultRouteError::PersistFailed("creative".to_string()))
        );
        assert_eq!(resolver.current_key(), "limbo");
    }

    #[tokio::test]
    async fn test_set_and_persist_rejects_blank_without_network() {
        let resolver = resolver_with(
            MockClusterApi::new(),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        );

        assert_eq!(
            resolver.set_and_persist("   ").await,
            Err(DefaultRouteError::BlankKey)
        );
    }

    #[tokio::test]
    async fn test_refresh_waits_for_in_flight_set() {
        let resolver = Arc::new(resolver_with(
            mock_returning(Some("survival")),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        ));

        // Stands in for a set_and_persist holding the lock across its PATCH
        let guard = resolver.sync_lock.lock().await;
        let refresh = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.refresh().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!refresh.is_finished());
        assert_eq!(resolver.current_key(), "limbo");

        *resolver.key.write() = "creative".to_string();
        drop(guard);

        // The refresh reads after the set completed, never before it
        assert!(refresh.await.unwrap());
        assert_eq!(resolver.current_key(), "survival");
    }

    #[tokio::test]
    async fn test_set_waits_for_in_flight_refresh() {
        let mut mock = mock_returning(Some("lobby"));
        mock.expect_patch_config_map().returning(|_, _, _| Ok(()));
        let resolver = Arc::new(resolver_with(
            mock,
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(ManagedSet::new()),
        ));

        let guard = resolver.sync_lock.lock().await;
        let set = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.set_and_persist("creative").await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!set.is_finished());
        drop(guard);

        set.await.unwrap().unwrap();
        assert_eq!(resolver.current_key(), "creative");
    }

    #[test]
    fn test_matches_key() {
        assert!(matches_key("lobby", "lobby"));
        assert!(matches_key("lobby-0", "lobby"));
        assert!(!matches_key("lobbyist", "lobby"));
        assert!(!matches_key("auto-lobby-0", "lobby"));
    }
}

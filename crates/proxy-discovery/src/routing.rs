//! Proxy routing table boundary
//!
//! The host proxy owns the live routing table. This crate only needs
//! register/unregister/lookup/list, expressed by [`RoutingTable`] so the host
//! can plug in its own structure. [`InMemoryRoutingTable`] backs the
//! standalone binary and tests.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Route already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Invalid route address: {0}")]
    InvalidAddress(String),
}

/// Host and port a route forwards to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteAddress {
    pub host: String,
    pub port: u16,
}

impl RouteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, accepting bracketed IPv6 hosts
    pub fn parse(value: &str) -> Result<Self, RoutingError> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| RoutingError::InvalidAddress(value.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RoutingError::InvalidAddress(value.to_string()));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| RoutingError::InvalidAddress(value.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for RouteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An entry in the proxy's routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRoute {
    pub name: String,
    pub address: RouteAddress,
}

impl RegisteredRoute {
    pub fn new(name: impl Into<String>, address: RouteAddress) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Live routing table of the host proxy
#[cfg_attr(test, mockall::automock)]
pub trait RoutingTable: Send + Sync {
    /// Register a route. Fails if the name is already taken.
    fn register(&self, route: RegisteredRoute) -> Result<(), RoutingError>;

    /// Remove a route by name, returning it if it was present
    fn unregister(&self, name: &str) -> Option<RegisteredRoute>;

    fn lookup(&self, name: &str) -> Option<RegisteredRoute>;

    /// All routes, ordered by name
    fn list(&self) -> Vec<RegisteredRoute>;
}

/// Routing table kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryRoutingTable {
    routes: RwLock<BTreeMap<String, RouteAddress>>,
}

impl InMemoryRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table pre-populated with statically configured routes
    pub fn with_routes(routes: impl IntoIterator<Item = RegisteredRoute>) -> Self {
        let routes = routes
            .into_iter()
            .map(|route| (route.name, route.address))
            .collect();
        Self {
            routes: RwLock::new(routes),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl RoutingTable for InMemoryRoutingTable {
    fn register(&self, route: RegisteredRoute) -> Result<(), RoutingError> {
        let mut routes = self.routes.write();
        if routes.contains_key(&route.name) {
            return Err(RoutingError::AlreadyRegistered(route.name));
        }
        routes.insert(route.name, route.address);
        Ok(())
    }

    fn unregister(&self, name: &str) -> Option<RegisteredRoute> {
        self.routes
            .write()
            .remove(name)
            .map(|address| RegisteredRoute::new(name, address))
    }

    fn lookup(&self, name: &str) -> Option<RegisteredRoute> {
        self.routes
            .read()
            .get(name)
            .map(|address| RegisteredRoute::new(name, address.clone()))
    }

    fn list(&self) -> Vec<RegisteredRoute> {
        self.routes
            .read()
            .iter()
            .map(|(name, address)| RegisteredRoute::new(name.clone(), address.clone()))
            .collect()
    }
}

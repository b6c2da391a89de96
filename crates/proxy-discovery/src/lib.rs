//! proxy-discovery: cluster-backed backend discovery for a network proxy

pub mod admin;
pub mod config;
pub mod default_route;
pub mod health;
pub mod kube_api;
pub mod lifecycle;
pub mod orchestrator;
pub mod pinning;
pub mod reconciler;
pub mod resolver;
pub mod routing;
pub mod runtime;
pub mod types;
pub mod watch;

pub use config::DiscoveryConfig;
pub use orchestrator::Orchestrator;
pub use routing::{InMemoryRoutingTable, RegisteredRoute, RouteAddress, RoutingTable};
pub use runtime::{DiscoveryRuntime, RuntimeHandle};

//! Runtime configuration and well-known names
//!
//! Configuration is read from the environment once at startup. Blank values
//! fall back to defaults; unparseable numbers and booleans are logged and
//! replaced by their default rather than failing startup.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::lifecycle::ScaleTarget;
use crate::routing::{RegisteredRoute, RouteAddress};
use crate::types::{WorkloadKind, WorkloadRef};

/// Annotations read or written on cluster resources
pub mod annotations {
    /// Overrides the display name of a discovered service
    pub const SERVER_NAME: &str = "proxy-discovery.io/server-name";
    /// Pod template annotation stamped to trigger a rolling restart
    pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
}

/// Well-known keys and route names
pub mod keys {
    /// Config map field holding the default route key
    pub const DEFAULT_SERVER: &str = "defaultServer";
    /// Service port name preferred when resolving the routable port
    pub const PREFERRED_PORT_NAME: &str = "minecraft";
    /// Route used when the default key resolves to nothing
    pub const FALLBACK_ROUTE: &str = "limbo";
}

/// Poll intervals below this are raised to it
pub const MIN_POLL_INTERVAL_SECS: u64 = 3;

/// Upper bound accepted by manual scale requests
pub const MAX_REPLICAS: i32 = 10;

const DEFAULT_SCALE_TARGETS: &str =
    "lobby=statefulset/paper-lobby,survival=deployment/paper-survival,creative=deployment/paper-creative";

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub namespace: String,
    /// Name of the pod this process runs in
    pub pod_name: String,
    pub discovery_enabled: bool,
    pub watch_enabled: bool,
    pub label_key: String,
    pub label_value: String,
    /// Prepended to every generated route name, may be empty
    pub name_prefix: String,
    pub poll_interval: Duration,
    /// Config map holding the default route key
    pub runtime_config_map: String,
    /// Workload restarted by the restart operation
    pub proxy_workload: WorkloadRef,
    pub proxy_pod_selector: String,
    pub proxy_port: u16,
    pub proxy_protocol_required: bool,
    pub transfer_host: Option<String>,
    pub transfer_port: u16,
    pub target_host: Option<String>,
    pub target_base_port: u16,
    pub scale_targets: Vec<ScaleTarget>,
    /// Routes seeded into the standalone routing table
    pub static_routes: Vec<RegisteredRoute>,
    pub health_port: u16,
}

impl DiscoveryConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `POD_NAMESPACE` (default: `minecraft`)
    /// - `POD_NAME` (default: `unknown-pod`)
    /// - `PROXY_DISCOVERY_ENABLED`, `PROXY_DISCOVERY_WATCH_ENABLED` (default: true)
    /// - `PROXY_DISCOVERY_LABEL_KEY`, `PROXY_DISCOVERY_LABEL_VALUE`
    /// - `PROXY_DISCOVERY_NAME_PREFIX` (default: `auto-`, may be blank)
    /// - `PROXY_DISCOVERY_INTERVAL_SECONDS` (default: 5, minimum 3)
    /// - `PROXY_RUNTIME_CONFIGMAP`
    /// - `PROXY_WORKLOAD`, `PROXY_WORKLOAD_KIND`, `PROXY_POD_LABEL_SELECTOR`, `PROXY_PORT`
    /// - `PROXY_HAPROXY_PROTOCOL_REQUIRED`, `PROXY_TRANSFER_HOST`, `PROXY_TRANSFER_PORT`,
    ///   `PROXY_TARGET_HOST`, `PROXY_TARGET_BASE_PORT`
    /// - `PROXY_SCALE_TARGETS` (`name=kind/workload,...`)
    /// - `PROXY_STATIC_ROUTES` (`name=host:port,...`)
    /// - `HEALTH_PORT` (default: 8081)
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_source<F>(source: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = env_or(&source, "POD_NAMESPACE", "minecraft");
        let pod_name = env_or(&source, "POD_NAME", "unknown-pod");

        let interval_secs = parse_env(&source, "PROXY_DISCOVERY_INTERVAL_SECONDS", 5u64);
        let poll_interval = Duration::from_secs(interval_secs.max(MIN_POLL_INTERVAL_SECS));

        let proxy_workload = WorkloadRef::new(
            namespace.clone(),
            env_or(&source, "PROXY_WORKLOAD", "velocity"),
            WorkloadKind::parse(&env_or(&source, "PROXY_WORKLOAD_KIND", "statefulset")),
        );

        let proxy_port = parse_env(&source, "PROXY_PORT", 25577u16);
        let transfer_host = non_blank(&source, "PROXY_TRANSFER_HOST");
        let transfer_port = parse_env(&source, "PROXY_TRANSFER_PORT", proxy_port);
        let target_host = non_blank(&source, "PROXY_TARGET_HOST").or_else(|| transfer_host.clone());

        let scale_targets = parse_scale_targets(
            &env_or(&source, "PROXY_SCALE_TARGETS", DEFAULT_SCALE_TARGETS),
            &namespace,
        )
        .context("Invalid PROXY_SCALE_TARGETS")?;

        let static_routes = match non_blank(&source, "PROXY_STATIC_ROUTES") {
            Some(value) => parse_static_routes(&value).context("Invalid PROXY_STATIC_ROUTES")?,
            None => Vec::new(),
        };

        Ok(Self {
            pod_name,
            discovery_enabled: parse_env(&source, "PROXY_DISCOVERY_ENABLED", true),
            watch_enabled: parse_env(&source, "PROXY_DISCOVERY_WATCH_ENABLED", true),
            label_key: env_or(&source, "PROXY_DISCOVERY_LABEL_KEY", "proxy-discovery.io/discover"),
            label_value: env_or(&source, "PROXY_DISCOVERY_LABEL_VALUE", "enabled"),
            name_prefix: source("PROXY_DISCOVERY_NAME_PREFIX")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| "auto-".to_string()),
            poll_interval,
            runtime_config_map: env_or(&source, "PROXY_RUNTIME_CONFIGMAP", "proxy-discovery-runtime"),
            proxy_workload,
            proxy_pod_selector: env_or(&source, "PROXY_POD_LABEL_SELECTOR", "app=velocity"),
            proxy_port,
            proxy_protocol_required: parse_env(&source, "PROXY_HAPROXY_PROTOCOL_REQUIRED", true),
            transfer_host,
            transfer_port,
            target_host,
            target_base_port: parse_env(&source, "PROXY_TARGET_BASE_PORT", 25578u16),
            scale_targets,
            static_routes,
            health_port: parse_env(&source, "HEALTH_PORT", 8081u16),
            namespace,
        })
    }

    /// Label selector used for service and endpoint discovery
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label_key, self.label_value)
    }
}

fn non_blank<F>(source: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    source(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or<F>(source: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    non_blank(source, key).unwrap_or_else(|| default.to_string())
}

/// Parse a value with logging on failure
fn parse_env<F, T>(source: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match non_blank(source, key) {
        Some(v) => match v.to_ascii_lowercase().parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    env_var = key,
                    value = %v,
                    error = %e,
                    default = %default,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        None => default,
    }
}

/// Parse `name=kind/workload` entries separated by commas
pub fn parse_scale_targets(value: &str, namespace: &str) -> Result<Vec<ScaleTarget>> {
    let mut targets = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, workload)) = entry.split_once('=') else {
            bail!("scale target '{entry}' is not in name=kind/workload form");
        };
        let Some((kind, workload)) = workload.trim().split_once('/') else {
            bail!("scale target '{entry}' is missing a workload kind");
        };
        let (name, workload) = (name.trim(), workload.trim());
        if name.is_empty() || workload.is_empty() {
            bail!("scale target '{entry}' has an empty name");
        }
        targets.push(ScaleTarget::new(
            name.to_ascii_lowercase(),
            WorkloadRef::new(namespace, workload, WorkloadKind::parse(kind)),
        ));
    }
    Ok(targets)
}

/// Parse `name=host:port` entries separated by commas
pub fn parse_static_routes(value: &str) -> Result<Vec<RegisteredRoute>> {
    let mut routes = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, address)) = entry.split_once('=') else {
            bail!("static route '{entry}' is not in name=host:port form");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("static route '{entry}' has an empty name");
        }
        let address = RouteAddress::parse(address.trim())
            .with_context(|| format!("static route '{name}'"))?;
        routes.push(RegisteredRoute::new(name, address));
    }
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<DiscoveryConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DiscoveryConfig::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.namespace, "minecraft");
        assert_eq!(config.pod_name, "unknown-pod");
        assert!(config.discovery_enabled);
        assert!(config.watch_enabled);
        assert_eq!(config.label_selector(), "proxy-discovery.io/discover=enabled");
        assert_eq!(config.name_prefix, "auto-");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.runtime_config_map, "proxy-discovery-runtime");
        assert_eq!(config.proxy_workload.to_string(), "statefulset/velocity");
        assert_eq!(config.proxy_port, 25577);
        assert_eq!(config.transfer_port, 25577);
        assert!(config.transfer_host.is_none());
        assert!(config.target_host.is_none());
        assert_eq!(config.target_base_port, 25578);
        assert_eq!(config.scale_targets.len(), 3);
        assert!(config.static_routes.is_empty());
        assert_eq!(config.health_port, 8081);
    }

    #[test]
    fn test_poll_interval_clamped_to_minimum() {
        let config = config_from(&[("PROXY_DISCOVERY_INTERVAL_SECONDS", "1")]).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_unparseable_values_use_defaults() {
        let config = config_from(&[
            ("PROXY_DISCOVERY_INTERVAL_SECONDS", "soon"),
            ("PROXY_DISCOVERY_WATCH_ENABLED", "maybe"),
            ("PROXY_PORT", "99999"),
        ])
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.watch_enabled);
        assert_eq!(config.proxy_port, 25577);
    }

    #[test]
    fn test_booleans_are_case_insensitive() {
        let config = config_from(&[("PROXY_DISCOVERY_ENABLED", "FALSE")]).unwrap();
        assert!(!config.discovery_enabled);
    }

    #[test]
    fn test_blank_values_fall_back_except_prefix() {
        let config = config_from(&[
            ("POD_NAMESPACE", "  "),
            ("PROXY_DISCOVERY_NAME_PREFIX", ""),
        ])
        .unwrap();

        assert_eq!(config.namespace, "minecraft");
        assert_eq!(config.name_prefix, "");
    }

    #[test]
    fn test_target_host_defaults_to_transfer_host() {
        let config = config_from(&[
            ("PROXY_TRANSFER_HOST", "mc.example.net"),
            ("PROXY_TRANSFER_PORT", "25565"),
        ])
        .unwrap();

        assert_eq!(config.transfer_host.as_deref(), Some("mc.example.net"));
        assert_eq!(config.target_host.as_deref(), Some("mc.example.net"));
        assert_eq!(config.transfer_port, 25565);
    }

    #[test]
    fn test_parse_scale_targets() {
        let targets =
            parse_scale_targets("lobby=statefulset/paper-lobby, Survival=deployment/paper-survival", "mc")
                .unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "lobby");
        assert_eq!(
            targets[0].workload,
            WorkloadRef::new("mc", "paper-lobby", WorkloadKind::StatefulSet)
        );
        assert_eq!(targets[1].name, "survival");
        assert_eq!(targets[1].workload.kind, WorkloadKind::Deployment);
    }

    #[test]
    fn test_parse_scale_targets_rejects_malformed() {
        assert!(parse_scale_targets("lobby", "mc").is_err());
        assert!(parse_scale_targets("lobby=paper-lobby", "mc").is_err());
        assert!(parse_scale_targets("=deployment/x", "mc").is_err());
    }

    #[test]
    fn test_parse_static_routes() {
        let routes = parse_static_routes("lobby=10.0.0.1:25565,limbo=limbo.mc.svc:30000").unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name, "lobby");
        assert_eq!(routes[1].address, RouteAddress::new("limbo.mc.svc", 30000));
    }

    #[test]
    fn test_invalid_static_routes_fail_startup() {
        let result = config_from(&[("PROXY_STATIC_ROUTES", "lobby=10.0.0.1")]);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("POD_NAMESPACE", "games");
        std::env::set_var("PROXY_DISCOVERY_LABEL_VALUE", "yes");

        let config = DiscoveryConfig::from_env().unwrap();
        assert_eq!(config.namespace, "games");
        assert_eq!(config.label_selector(), "proxy-discovery.io/discover=yes");
        assert_eq!(config.scale_targets[0].workload.namespace, "games");

        // Clean up
        std::env::remove_var("POD_NAMESPACE");
        std::env::remove_var("PROXY_DISCOVERY_LABEL_VALUE");
    }
}

//! Shared data model for discovery, routing and lifecycle control

use std::fmt;

use crate::routing::RouteAddress;

/// A routable target discovered from the cluster.
///
/// Candidates are recomputed wholesale on every reconciliation pass and are
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCandidate {
    /// Stable name derived from the owning service and pod identity (unprefixed)
    pub name: String,
    /// Endpoint IP or hostname
    pub host: String,
    /// Routable port
    pub port: u16,
    /// Number of ready endpoint addresses backing this name
    pub ready_count: u32,
}

impl BackendCandidate {
    pub fn address(&self) -> RouteAddress {
        RouteAddress::new(self.host.clone(), self.port)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_count > 0
    }
}

/// A proxy-tier pod, used for listing and instance pinning only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    /// Pod IP, empty when not yet assigned
    pub address: String,
    pub ready: bool,
}

/// Kind of a restartable/scalable workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    /// Parse a kind name. Unknown kinds map to [`WorkloadKind::Deployment`].
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "statefulset" | "statefulsets" | "sts" => WorkloadKind::StatefulSet,
            _ => WorkloadKind::Deployment,
        }
    }

    /// Lowercase resource name as used by `kubectl` and in operator output
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }

    /// Plural resource segment of the `apps/v1` API path
    pub fn plural(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::StatefulSet => "statefulsets",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a workload targeted by restart and scale operations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: WorkloadKind) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_kind_parse() {
        assert_eq!(WorkloadKind::parse("statefulset"), WorkloadKind::StatefulSet);
        assert_eq!(WorkloadKind::parse("StatefulSet"), WorkloadKind::StatefulSet);
        assert_eq!(WorkloadKind::parse("deployment"), WorkloadKind::Deployment);
    }

    #[test]
    fn test_unknown_workload_kind_defaults_to_deployment() {
        assert_eq!(WorkloadKind::parse("daemonset"), WorkloadKind::Deployment);
        assert_eq!(WorkloadKind::parse(""), WorkloadKind::Deployment);
    }

    #[test]
    fn test_workload_ref_display() {
        let workload = WorkloadRef::new("minecraft", "velocity", WorkloadKind::StatefulSet);
        assert_eq!(workload.to_string(), "statefulset/velocity");
    }

    #[test]
    fn test_candidate_readiness() {
        let candidate = BackendCandidate {
            name: "lobby-0".to_string(),
            host: "10.0.0.5".to_string(),
            port: 25565,
            ready_count: 0,
        };
        assert!(!candidate.is_ready());
        assert_eq!(candidate.address().to_string(), "10.0.0.5:25565");
    }
}

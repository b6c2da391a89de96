//! Choosing a transfer address that lands a client on a specific proxy pod
//!
//! When the proxy tier sits behind a PROXY-protocol load balancer, a client
//! cannot dial a pod IP directly. Each ordinal is then exposed on its own
//! port of a shared target host (`target_base_port + ordinal`); pods without
//! an ordinal can only be reached through the load balancer itself.

use thiserror::Error;

use crate::config::DiscoveryConfig;
use crate::resolver::trailing_ordinal;
use crate::routing::RouteAddress;
use crate::types::PodRef;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("Pod not found: {0}")]
    PodNotFound(String),
    #[error("Target pod not ready: {0}")]
    NotReady(String),
    #[error("Already on proxy pod {0}")]
    AlreadyHere(String),
    #[error("Proxy protocol is required and no transfer host is configured for {0}")]
    ProxyProtocolRequired(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Per-ordinal port on the target host, reaches exactly this pod
    Pinned { pod: String, address: RouteAddress },
    /// Through the load balancer, the landing pod is not guaranteed
    LoadBalancer { pod: String, address: RouteAddress },
    /// Straight to the pod IP
    Direct { pod: String, address: RouteAddress },
}

impl TransferTarget {
    pub fn address(&self) -> &RouteAddress {
        match self {
            TransferTarget::Pinned { address, .. }
            | TransferTarget::LoadBalancer { address, .. }
            | TransferTarget::Direct { address, .. } => address,
        }
    }

    /// Whether the transfer is guaranteed to reach the requested pod
    pub fn is_exact(&self) -> bool {
        !matches!(self, TransferTarget::LoadBalancer { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinningPolicy {
    pub current_pod: String,
    pub proxy_port: u16,
    pub proxy_protocol_required: bool,
    pub transfer_host: Option<String>,
    pub transfer_port: u16,
    pub target_host: Option<String>,
    pub target_base_port: u16,
}

impl PinningPolicy {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            current_pod: config.pod_name.clone(),
            proxy_port: config.proxy_port,
            proxy_protocol_required: config.proxy_protocol_required,
            transfer_host: config.transfer_host.clone(),
            transfer_port: config.transfer_port,
            target_host: config.target_host.clone(),
            target_base_port: config.target_base_port,
        }
    }

    /// Decide where to send a client that asked for `pod_name`
    pub fn plan(&self, pods: &[PodRef], pod_name: &str) -> Result<TransferTarget, PinError> {
        let pod = pods
            .iter()
            .find(|p| p.name == pod_name)
            .ok_or_else(|| PinError::PodNotFound(pod_name.to_string()))?;

        if !pod.ready || pod.address.trim().is_empty() {
            return Err(PinError::NotReady(pod.name.clone()));
        }
        if pod.name == self.current_pod {
            return Err(PinError::AlreadyHere(pod.name.clone()));
        }

        if !self.proxy_protocol_required {
            return Ok(TransferTarget::Direct {
                pod: pod.name.clone(),
                address: RouteAddress::new(pod.address.clone(), self.proxy_port),
            });
        }

        let pinned = trailing_ordinal(&pod.name)
            .and_then(|ordinal| u16::try_from(ordinal).ok())
            .and_then(|ordinal| self.target_base_port.checked_add(ordinal))
            .zip(self.target_host.as_ref());
        if let Some((port, host)) = pinned {
            return Ok(TransferTarget::Pinned {
                pod: pod.name.clone(),
                address: RouteAddress::new(host.clone(), port),
            });
        }

        match &self.transfer_host {
            Some(host) => Ok(TransferTarget::LoadBalancer {
                pod: pod.name.clone(),
                address: RouteAddress::new(host.clone(), self.transfer_port),
            }),
            None => Err(PinError::ProxyProtocolRequired(pod.name.clone())),
        }
    }
}

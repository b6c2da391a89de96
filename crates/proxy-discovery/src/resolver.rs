//! Backend candidate resolution
//!
//! Turns label-selected services and their endpoints into named, addressed
//! [`BackendCandidate`]s. One candidate is produced per endpoint address and
//! its name is derived from the owning pod's identity:
//!
//! ```text
//! <display-name>-<pod-hint><uid-suffix>
//! ```
//!
//! The pod hint rules are tried in order:
//! 1. Trailing ordinal (`lobby-2` -> `2`)
//! 2. Trailing 5-character hash (`survival-7d9f8-x2k4q` -> `x2k4q`)
//! 3. Text after the last `-`
//! 4. The whole pod name
//! 5. The endpoint IP with separators replaced by `-` (no pod name)

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use regex::Regex;

use crate::config::{annotations, keys};
use crate::types::BackendCandidate;

static ORDINAL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)$").expect("valid regex"));

static HASH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-([a-z0-9]{5})$").expect("valid regex"));

const UID_SUFFIX_LEN: usize = 6;

/// Short, stable hint identifying a pod within its service
pub fn pod_hint(pod_name: Option<&str>, ip: &str) -> String {
    let Some(pod) = pod_name.map(str::trim).filter(|p| !p.is_empty()) else {
        return ip.replace(['.', ':'], "-");
    };

    if let Some(caps) = ORDINAL_SUFFIX.captures(pod) {
        return caps[1].to_string();
    }
    if let Some(caps) = HASH_SUFFIX.captures(pod) {
        return caps[1].to_string();
    }
    match pod.rsplit_once('-') {
        Some((_, tail)) if !tail.is_empty() => tail.to_string(),
        _ => pod.to_string(),
    }
}

/// `-` plus the last six characters of the UID's final segment, or empty
pub fn uid_suffix(uid: Option<&str>) -> String {
    let Some(uid) = uid.map(str::trim).filter(|u| !u.is_empty()) else {
        return String::new();
    };
    let segment = uid.rsplit('-').next().unwrap_or(uid);
    if segment.is_empty() {
        return String::new();
    }
    let skip = segment.chars().count().saturating_sub(UID_SUFFIX_LEN);
    let tail: String = segment.chars().skip(skip).collect();
    format!("-{tail}")
}

/// Unprefixed candidate name for one endpoint address
pub fn candidate_name(
    display_name: &str,
    pod_name: Option<&str>,
    ip: &str,
    uid: Option<&str>,
) -> String {
    format!(
        "{}-{}{}",
        display_name,
        pod_hint(pod_name, ip),
        uid_suffix(uid)
    )
}

/// Route name registered for a candidate
pub fn route_name(prefix: &str, candidate_name: &str) -> String {
    format!("{prefix}{candidate_name}")
}

/// Display name of a service: annotation override, else the service name
pub fn display_name(service: &Service) -> String {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::SERVER_NAME))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| service.metadata.name.clone().unwrap_or_default())
}

/// Service port used for routing: the one named `minecraft`, else the first
pub fn resolve_service_port(service: &Service) -> Option<&ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(keys::PREFERRED_PORT_NAME))
        .or_else(|| ports.first())
}

/// Port to dial on an endpoint address of `subset`.
///
/// Prefers the subset port with the same name as the service port, then the
/// service's numeric target port, then the service port itself.
pub fn routable_port(service_port: &ServicePort, subset: &EndpointSubset) -> Option<u16> {
    let from_subset = subset
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find(|p| p.name == service_port.name))
        .map(|p| p.port);

    let from_target = match &service_port.target_port {
        Some(IntOrString::Int(port)) => Some(*port),
        _ => None,
    };

    [from_subset, from_target, Some(service_port.port)]
        .into_iter()
        .flatten()
        .find_map(|port| u16::try_from(port).ok().filter(|p| *p > 0))
}

/// Trailing numeric ordinal of a pod name, if any
pub fn trailing_ordinal(pod_name: &str) -> Option<u32> {
    ORDINAL_SUFFIX
        .captures(pod_name)
        .and_then(|caps| caps[1].parse().ok())
}

fn address_identity(address: &EndpointAddress) -> (Option<&str>, Option<&str>) {
    match &address.target_ref {
        Some(target) if target.kind.as_deref().map_or(true, |k| k == "Pod") => {
            (target.name.as_deref(), target.uid.as_deref())
        }
        _ => (address.hostname.as_deref(), None),
    }
}

/// Join endpoints to their services and produce one candidate per address.
///
/// Ready addresses contribute a ready count of 1, not-ready addresses 0.
/// Candidates sharing a name are merged and their counts summed. Services
/// without a resolvable port, and endpoints without a matching service, are
/// dropped. The result is ordered by name.
pub fn resolve_candidates(services: &[Service], endpoints: &[Endpoints]) -> Vec<BackendCandidate> {
    let services: BTreeMap<&str, &Service> = services
        .iter()
        .filter_map(|svc| svc.metadata.name.as_deref().map(|name| (name, svc)))
        .collect();

    let mut candidates: BTreeMap<String, BackendCandidate> = BTreeMap::new();

    for ep in endpoints {
        let Some(service) = ep
            .metadata
            .name
            .as_deref()
            .and_then(|name| services.get(name))
        else {
            continue;
        };
        let Some(service_port) = resolve_service_port(service) else {
            continue;
        };
        let display = display_name(service);

        for subset in ep.subsets.iter().flatten() {
            let Some(port) = routable_port(service_port, subset) else {
                continue;
            };

            let ready = subset.addresses.iter().flatten().map(|a| (a, 1));
            let not_ready = subset.not_ready_addresses.iter().flatten().map(|a| (a, 0));

            for (address, ready_count) in ready.chain(not_ready) {
                if address.ip.is_empty() {
                    continue;
                }
                let (pod_name, uid) = address_identity(address);
                let name = candidate_name(&display, pod_name, &address.ip, uid);

                candidates
                    .entry(name.clone())
                    .and_modify(|existing| {
                        if existing.ready_count == 0 && ready_count > 0 {
                            existing.host = address.ip.clone();
                            existing.port = port;
                        }
                        existing.ready_count += ready_count;
                    })
                    .or_insert_with(|| BackendCandidate {
                        name,
                        host: address.ip.clone(),
                        port,
                        ready_count,
                    });
            }
        }
    }

    candidates.into_values().collect()
}

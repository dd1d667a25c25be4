//! Builds the immutable topology from a cache snapshot.
//!
//! The builder is pure: the same snapshot always yields the same topology,
//! byte for byte. All inputs are iterated in key order and node ids are
//! assigned in that order.

use crate::index::{PortDef, Snapshot, TrafficTargetInfo};
use ahash::AHashMap as HashMap;
use mesh_controller_core::{
    annotations::ServiceAnnotations,
    topology::{
        Destination, HttpMatch, PodId, PodNode, ServiceId, ServiceNode, ServicePort,
        ServiceTrafficTarget, SplitBackend, SplitId, TargetId, Topology, TrafficSpec,
        TrafficSplitNode,
    },
    ResourceKey,
};

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
const HTTP_ROUTE_GROUP_KIND: &str = "HTTPRouteGroup";
const TCP_ROUTE_KIND: &str = "TCPRoute";

/// A non-fatal build problem, reported as an event on the offending object.
#[derive(Clone, Debug, PartialEq)]
pub struct Warning {
    pub object: ResourceKey,
    pub object_kind: &'static str,
    pub reason: &'static str,
    pub message: String,
}

pub fn build(snapshot: &Snapshot) -> (Topology, Vec<Warning>) {
    let mut topology = Topology::default();
    let mut warnings = Vec::new();

    // Pods first: everything else points at them.
    let mut pods_by_key = HashMap::<ResourceKey, PodId>::default();
    let mut pods_by_ip = HashMap::<String, PodId>::default();
    let mut pods_by_account = HashMap::<(String, String), Vec<PodId>>::default();
    for (key, pod) in &snapshot.pods {
        let id = PodId(topology.pods.len());
        topology.pods.push(PodNode {
            key: key.clone(),
            ip: pod.ip.clone(),
            service_account: pod.service_account.clone(),
            owner: pod.owner.clone(),
            ready: pod.ready,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        });
        pods_by_key.insert(key.clone(), id);
        if let Some(ip) = &pod.ip {
            pods_by_ip.insert(ip.clone(), id);
        }
        pods_by_account
            .entry((key.namespace.clone(), pod.service_account.clone()))
            .or_default()
            .push(id);
    }

    // Services, with pods attached through endpoints membership. Endpoints
    // rather than the selector: they track readiness and cover services
    // with manually-managed endpoints.
    for (key, svc) in &snapshot.services {
        let (annotations, errors) = ServiceAnnotations::parse(&svc.annotations);
        for error in errors {
            warnings.push(Warning {
                object: key.clone(),
                object_kind: "Service",
                reason: "InvalidAnnotation",
                message: error.to_string(),
            });
        }

        let endpoints = snapshot.endpoints.get(key);
        let mut members = std::collections::BTreeSet::new();
        for subset in endpoints.iter().flat_map(|ep| &ep.subsets) {
            for addr in subset.addresses.iter().chain(&subset.not_ready_addresses) {
                let id = addr
                    .target
                    .as_ref()
                    .and_then(|t| pods_by_key.get(t))
                    .or_else(|| pods_by_ip.get(&addr.ip));
                match id {
                    Some(id) => {
                        members.insert(*id);
                    }
                    None => tracing::debug!(
                        service = %key,
                        ip = %addr.ip,
                        "endpoint address does not resolve to a known pod"
                    ),
                }
            }
        }

        let ports = svc
            .ports
            .iter()
            .map(|p| ServicePort {
                name: p.name.clone(),
                protocol: p.protocol,
                port: p.port,
                target_port: resolve_target_port(p, endpoints.map(|e| &**e)),
            })
            .collect();

        topology.services.push(ServiceNode {
            key: key.clone(),
            cluster_ip: svc.cluster_ip.clone(),
            ports,
            annotations,
            pods: members.into_iter().collect(),
            traffic_targets: Vec::new(),
            traffic_splits: Vec::new(),
        });
    }

    // Traffic targets, resolved per destination service.
    for (key, target) in &snapshot.traffic_targets {
        if target.destination.kind != SERVICE_ACCOUNT_KIND {
            warnings.push(Warning {
                object: key.clone(),
                object_kind: "TrafficTarget",
                reason: "UnsupportedSubject",
                message: format!(
                    "destination kind {:?} is not supported",
                    target.destination.kind
                ),
            });
            continue;
        }

        let rules = match resolve_rules(snapshot, key, target) {
            Ok(rules) => rules,
            Err(warning) => {
                warnings.push(warning);
                continue;
            }
        };

        let mut sources: Vec<PodId> = target
            .sources
            .iter()
            .filter(|s| s.kind == SERVICE_ACCOUNT_KIND)
            .flat_map(|s| {
                pods_by_account
                    .get(&(s.namespace.clone(), s.name.clone()))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        sources.sort();
        sources.dedup();
        if sources.is_empty() {
            continue;
        }

        for index in 0..topology.services.len() {
            if topology.services[index].key.namespace != target.destination.namespace {
                continue;
            }
            let destination_pods: Vec<PodId> = topology.services[index]
                .pods
                .iter()
                .copied()
                .filter(|id| topology.pods[id.0].service_account == target.destination.name)
                .collect();
            if destination_pods.is_empty() {
                continue;
            }

            let id = TargetId(topology.traffic_targets.len());
            for pod in &sources {
                topology.pods[pod.0].outgoing.push(id);
            }
            for pod in &destination_pods {
                topology.pods[pod.0].incoming.push(id);
            }
            topology.services[index].traffic_targets.push(id);
            topology.traffic_targets.push(ServiceTrafficTarget {
                key: key.clone(),
                service: ServiceId(index),
                sources: sources.clone(),
                destination: Destination {
                    service_account: target.destination.name.clone(),
                    pods: destination_pods,
                    port: target.destination.port,
                },
                rules: rules.clone(),
            });
        }
    }

    // Traffic splits, attached to their root service with backends filtered
    // to services that exist.
    for (key, split) in &snapshot.traffic_splits {
        let root_key = ResourceKey::new(&key.namespace, &split.service);
        let root = match topology.service_by_key(&root_key) {
            Some((id, _)) => id,
            None => {
                warnings.push(Warning {
                    object: key.clone(),
                    object_kind: "TrafficSplit",
                    reason: "UnknownService",
                    message: format!("root service {} does not exist", root_key),
                });
                continue;
            }
        };

        let mut backends = Vec::new();
        for (name, weight) in &split.backends {
            let backend_key = ResourceKey::new(&key.namespace, name);
            match topology.service_by_key(&backend_key) {
                Some((id, _)) => backends.push(SplitBackend {
                    service: id,
                    weight: *weight,
                }),
                None => warnings.push(Warning {
                    object: key.clone(),
                    object_kind: "TrafficSplit",
                    reason: "UnknownService",
                    message: format!("backend service {} does not exist", backend_key),
                }),
            }
        }
        if backends.iter().map(|b| u64::from(b.weight)).sum::<u64>() == 0 {
            tracing::debug!(split = %key, "skipping split with zero total weight");
            continue;
        }

        let id = SplitId(topology.traffic_splits.len());
        topology.services[root.0].traffic_splits.push(id);
        topology.traffic_splits.push(TrafficSplitNode {
            key: key.clone(),
            service: root,
            backends,
        });
    }

    (topology, warnings)
}

/// Resolves a traffic target's rule references into an inline spec.
///
/// Any unresolvable reference drops the whole target: under ACL the
/// affected services then deny traffic rather than admitting it too
/// broadly.
fn resolve_rules(
    snapshot: &Snapshot,
    key: &ResourceKey,
    target: &TrafficTargetInfo,
) -> Result<TrafficSpec, Warning> {
    let warn = |reason: &'static str, message: String| Warning {
        object: key.clone(),
        object_kind: "TrafficTarget",
        reason,
        message,
    };

    let mut matches = Vec::<HttpMatch>::new();
    let mut tcp = false;
    let mut http = false;
    for rule in &target.rules {
        match rule.kind.as_str() {
            HTTP_ROUTE_GROUP_KIND => {
                http = true;
                let group_key = ResourceKey::new(&key.namespace, &rule.name);
                let group = snapshot.route_groups.get(&group_key).ok_or_else(|| {
                    warn(
                        "UnknownRouteGroup",
                        format!("HTTPRouteGroup {} does not exist", group_key),
                    )
                })?;
                match &rule.matches {
                    Some(names) => {
                        for name in names {
                            let m = group
                                .matches
                                .iter()
                                .find(|m| m.name == *name)
                                .ok_or_else(|| {
                                    warn(
                                        "UnknownRouteGroup",
                                        format!(
                                            "HTTPRouteGroup {} has no match named {:?}",
                                            group_key, name
                                        ),
                                    )
                                })?;
                            matches.push(m.clone());
                        }
                    }
                    None => matches.extend(group.matches.iter().cloned()),
                }
            }
            TCP_ROUTE_KIND => {
                tcp = true;
                let route_key = ResourceKey::new(&key.namespace, &rule.name);
                if !snapshot.tcp_routes.contains_key(&route_key) {
                    return Err(warn(
                        "UnknownTcpRoute",
                        format!("TCPRoute {} does not exist", route_key),
                    ));
                }
            }
            other => {
                return Err(warn(
                    "UnsupportedRule",
                    format!("rule kind {:?} is not supported", other),
                ))
            }
        }
    }

    match (http, tcp) {
        (true, true) => Err(warn(
            "UnsupportedRule",
            "rules mix HTTP and TCP specs".to_string(),
        )),
        (false, true) => Ok(TrafficSpec::Tcp),
        // No rules at all admits every request.
        _ => Ok(TrafficSpec::Http(matches)),
    }
}

/// Resolves the concrete target port of a service port.
///
/// Endpoints carry the resolved container port per subset; the service
/// spec's integer targetPort is the fallback, then the port itself.
fn resolve_target_port(port: &PortDef, endpoints: Option<&crate::index::EndpointsInfo>) -> u16 {
    endpoints
        .into_iter()
        .flat_map(|ep| &ep.subsets)
        .flat_map(|subset| &subset.ports)
        .find(|ep_port| ep_port.name == port.name)
        .map(|ep_port| ep_port.port)
        .or(port.target_port)
        .unwrap_or(port.port)
}

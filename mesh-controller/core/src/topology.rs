//! The immutable mesh topology.
//!
//! One topology is built per reconcile from a cache snapshot and shared
//! read-only with the configuration compiler and the debug API. Nodes live
//! in flat arenas and reference each other through integer ids, so the
//! graph is a plain value despite pods, services and traffic targets all
//! pointing at one another.

use crate::annotations::ServiceAnnotations;
use crate::keys::ResourceKey;
use serde::Serialize;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ServiceId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PodId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TargetId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SplitId(pub usize);

/// A service port's L4 protocol.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Topology {
    pub services: Vec<ServiceNode>,
    pub pods: Vec<PodNode>,
    pub traffic_targets: Vec<ServiceTrafficTarget>,
    pub traffic_splits: Vec<TrafficSplitNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceNode {
    pub key: ResourceKey,
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePort>,
    pub annotations: ServiceAnnotations,
    pub pods: Vec<PodId>,
    pub traffic_targets: Vec<TargetId>,
    pub traffic_splits: Vec<SplitId>,
}

/// A user service port with its target resolved against the service's
/// endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServicePort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PodNode {
    pub key: ResourceKey,
    pub ip: Option<String>,
    pub service_account: String,
    pub owner: Option<String>,
    pub ready: bool,
    pub outgoing: Vec<TargetId>,
    pub incoming: Vec<TargetId>,
}

/// A traffic target resolved against one destination service.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceTrafficTarget {
    pub key: ResourceKey,
    pub service: ServiceId,
    pub sources: Vec<PodId>,
    pub destination: Destination,
    pub rules: TrafficSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Destination {
    pub service_account: String,
    pub pods: Vec<PodId>,
    pub port: Option<u16>,
}

/// The kind of traffic a target admits.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrafficSpec {
    /// HTTP traffic filtered by route-group matches. An empty match list
    /// admits every request.
    Http(Vec<HttpMatch>),
    /// Raw TCP traffic.
    Tcp,
}

/// One match of an HTTP route group. Fields AND together; matches OR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrafficSplitNode {
    pub key: ResourceKey,
    pub service: ServiceId,
    pub backends: Vec<SplitBackend>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SplitBackend {
    pub service: ServiceId,
    pub weight: u32,
}

// === impl Protocol ===

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TCP" => Some(Self::Tcp),
            "UDP" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => "TCP".fmt(f),
            Self::Udp => "UDP".fmt(f),
        }
    }
}

// === impl Topology ===

impl Topology {
    pub fn service(&self, id: ServiceId) -> &ServiceNode {
        &self.services[id.0]
    }

    pub fn pod(&self, id: PodId) -> &PodNode {
        &self.pods[id.0]
    }

    pub fn traffic_target(&self, id: TargetId) -> &ServiceTrafficTarget {
        &self.traffic_targets[id.0]
    }

    pub fn traffic_split(&self, id: SplitId) -> &TrafficSplitNode {
        &self.traffic_splits[id.0]
    }

    /// Looks a service up by key. Services are arranged in key order, so
    /// this is a binary search.
    pub fn service_by_key(&self, key: &ResourceKey) -> Option<(ServiceId, &ServiceNode)> {
        self.services
            .binary_search_by(|node| node.key.cmp(key))
            .ok()
            .map(|i| (ServiceId(i), &self.services[i]))
    }
}

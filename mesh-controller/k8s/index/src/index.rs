use crate::cluster::{
    self, ClusterConfig, SOURCE_NAME_ANNOTATION, SOURCE_NAMESPACE_ANNOTATION,
};
use ahash::AHashMap as HashMap;
use mesh_controller_core::{
    topology::{HttpMatch, Protocol},
    ResourceKey,
};
use mesh_controller_k8s_api::{self as k8s, IntOrString, ResourceExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Caches distilled copies of every watched resource.
///
/// Watch tasks are the only writers; the reconciler reads through
/// [`Index::snapshot`]. Every effective change pings the work channel so the
/// reconciler can coalesce bursts into a single cycle.
#[derive(Debug)]
pub struct Index {
    cluster: Arc<ClusterConfig>,
    changes: mpsc::UnboundedSender<()>,

    services: HashMap<ResourceKey, Arc<ServiceInfo>>,
    shadows: HashMap<String, Arc<ShadowInfo>>,
    pods: HashMap<ResourceKey, Arc<PodInfo>>,
    endpoints: HashMap<ResourceKey, Arc<EndpointsInfo>>,
    traffic_targets: HashMap<ResourceKey, Arc<TrafficTargetInfo>>,
    route_groups: HashMap<ResourceKey, Arc<RouteGroupInfo>>,
    tcp_routes: HashMap<ResourceKey, Arc<TcpRouteInfo>>,
    traffic_splits: HashMap<ResourceKey, Arc<TrafficSplitInfo>>,
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// A point-in-time view of the caches, ordered for deterministic traversal.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub cluster: Arc<ClusterConfig>,
    pub services: BTreeMap<ResourceKey, Arc<ServiceInfo>>,
    pub shadows: BTreeMap<String, Arc<ShadowInfo>>,
    pub pods: BTreeMap<ResourceKey, Arc<PodInfo>>,
    pub endpoints: BTreeMap<ResourceKey, Arc<EndpointsInfo>>,
    pub traffic_targets: BTreeMap<ResourceKey, Arc<TrafficTargetInfo>>,
    pub route_groups: BTreeMap<ResourceKey, Arc<RouteGroupInfo>>,
    pub tcp_routes: BTreeMap<ResourceKey, Arc<TcpRouteInfo>>,
    pub traffic_splits: BTreeMap<ResourceKey, Arc<TrafficSplitInfo>>,
}

/// A user service, as far as the mesh is concerned.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInfo {
    pub key: ResourceKey,
    pub cluster_ip: Option<String>,
    pub ports: Vec<PortDef>,
    pub annotations: BTreeMap<String, String>,
}

/// A service port before its target is resolved against endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDef {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: Option<u16>,
}

/// A controller-owned shadow service found in the mesh namespace.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowInfo {
    pub name: String,
    pub source: Option<ResourceKey>,
    pub ports: Vec<ShadowPort>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub mesh_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PodInfo {
    pub key: ResourceKey,
    pub ip: Option<String>,
    pub service_account: String,
    pub owner: Option<String>,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EndpointsInfo {
    pub key: ResourceKey,
    pub subsets: Vec<EndpointSubsetInfo>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointSubsetInfo {
    pub addresses: Vec<EndpointAddressInfo>,
    pub not_ready_addresses: Vec<EndpointAddressInfo>,
    pub ports: Vec<EndpointPortInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddressInfo {
    pub ip: String,
    pub target: Option<ResourceKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPortInfo {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrafficTargetInfo {
    pub key: ResourceKey,
    pub destination: SubjectInfo,
    pub sources: Vec<SubjectInfo>,
    pub rules: Vec<RuleInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectInfo {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleInfo {
    pub kind: String,
    pub name: String,
    pub matches: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteGroupInfo {
    pub key: ResourceKey,
    pub matches: Vec<HttpMatch>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpRouteInfo {
    pub key: ResourceKey,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrafficSplitInfo {
    pub key: ResourceKey,
    pub service: String,
    pub backends: Vec<(String, u32)>,
}

/// A mesh proxy pod, as listed on the status API.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyNode {
    pub name: String,
    pub ip: Option<String>,
    pub ready: bool,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster: Arc<ClusterConfig>) -> (SharedIndex, mpsc::UnboundedReceiver<()>) {
        let (changes, work) = mpsc::unbounded_channel();
        let index = Self {
            cluster,
            changes,
            services: HashMap::default(),
            shadows: HashMap::default(),
            pods: HashMap::default(),
            endpoints: HashMap::default(),
            traffic_targets: HashMap::default(),
            route_groups: HashMap::default(),
            tcp_routes: HashMap::default(),
            traffic_splits: HashMap::default(),
        };
        (Arc::new(RwLock::new(index)), work)
    }

    pub fn cluster(&self) -> &Arc<ClusterConfig> {
        &self.cluster
    }

    /// A sender that wakes the reconciler, e.g. for delayed retries.
    pub fn waker(&self) -> mpsc::UnboundedSender<()> {
        self.changes.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        fn ordered<K: Ord + Clone, V>(map: &HashMap<K, Arc<V>>) -> BTreeMap<K, Arc<V>> {
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }

        Snapshot {
            cluster: self.cluster.clone(),
            services: ordered(&self.services),
            shadows: ordered(&self.shadows),
            pods: ordered(&self.pods),
            endpoints: ordered(&self.endpoints),
            traffic_targets: ordered(&self.traffic_targets),
            route_groups: ordered(&self.route_groups),
            tcp_routes: ordered(&self.tcp_routes),
            traffic_splits: ordered(&self.traffic_splits),
        }
    }

    /// Lists the mesh proxy pods for the status API, in name order.
    pub fn proxy_nodes(&self) -> Vec<ProxyNode> {
        let mut nodes: Vec<ProxyNode> = self
            .pods
            .values()
            .filter(|pod| {
                pod.key.namespace == self.cluster.mesh_namespace
                    && cluster::is_proxy_node(&pod.labels)
            })
            .map(|pod| ProxyNode {
                name: pod.key.name.clone(),
                ip: pod.ip.clone(),
                ready: pod.ready,
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    fn touch(&self) {
        let _ = self.changes.send(());
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, service: k8s::Service) {
        let ns = match service.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let name = service.name_unchecked();

        if ns == self.cluster.mesh_namespace {
            // The mesh namespace holds no user services; track the shadows
            // we own and ignore everything else.
            if !cluster::is_shadow_service(service.labels()) {
                return;
            }
            let info = ShadowInfo::from_resource(name.clone(), &service);
            if self.shadows.get(&name).map(|cur| **cur == info) != Some(true) {
                self.shadows.insert(name, Arc::new(info));
                self.touch();
            }
            return;
        }

        if self.cluster.is_ignored(&ns) {
            return;
        }

        let key = ResourceKey::new(ns, name);
        let info = ServiceInfo::from_resource(key.clone(), &service);
        if info.ports.is_empty() {
            tracing::debug!(service = %key, "skipping service without ports");
            return;
        }
        if self.services.get(&key).map(|cur| **cur == info) != Some(true) {
            self.services.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.cluster.mesh_namespace {
            if self.shadows.remove(&name).is_some() {
                self.touch();
            }
            return;
        }
        if self
            .services
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, endpoints: k8s::Endpoints) {
        let ns = match endpoints.namespace() {
            Some(ns) => ns,
            None => return,
        };
        if self.cluster.is_ignored(&ns) {
            return;
        }
        let key = ResourceKey::new(ns, endpoints.name_unchecked());
        let info = EndpointsInfo::from_resource(key.clone(), &endpoints);
        if self.endpoints.get(&key).map(|cur| **cur == info) != Some(true) {
            self.endpoints.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .endpoints
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let ns = match pod.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let key = ResourceKey::new(ns, pod.name_unchecked());
        let info = PodInfo::from_resource(key.clone(), &pod);
        if self.pods.get(&key).map(|cur| **cur == info) != Some(true) {
            self.pods.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.pods.remove(&ResourceKey::new(namespace, name)).is_some() {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::access::TrafficTarget> for Index {
    fn apply(&mut self, target: k8s::access::TrafficTarget) {
        let ns = match target.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let key = ResourceKey::new(ns, target.name_unchecked());
        let info = TrafficTargetInfo::from_resource(key.clone(), &target);
        if self.traffic_targets.get(&key).map(|cur| **cur == info) != Some(true) {
            self.traffic_targets.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .traffic_targets
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::specs::HTTPRouteGroup> for Index {
    fn apply(&mut self, group: k8s::specs::HTTPRouteGroup) {
        let ns = match group.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let key = ResourceKey::new(ns, group.name_unchecked());
        let info = RouteGroupInfo::from_resource(key.clone(), &group);
        if self.route_groups.get(&key).map(|cur| **cur == info) != Some(true) {
            self.route_groups.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .route_groups
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::specs::TCPRoute> for Index {
    fn apply(&mut self, route: k8s::specs::TCPRoute) {
        let ns = match route.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let key = ResourceKey::new(ns, route.name_unchecked());
        let info = TcpRouteInfo { key: key.clone() };
        if self.tcp_routes.get(&key).map(|cur| **cur == info) != Some(true) {
            self.tcp_routes.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .tcp_routes
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::split::TrafficSplit> for Index {
    fn apply(&mut self, split: k8s::split::TrafficSplit) {
        let ns = match split.namespace() {
            Some(ns) => ns,
            None => return,
        };
        let key = ResourceKey::new(ns, split.name_unchecked());
        let info = TrafficSplitInfo::from_resource(key.clone(), &split);
        if self.traffic_splits.get(&key).map(|cur| **cur == info) != Some(true) {
            self.traffic_splits.insert(key, Arc::new(info));
            self.touch();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .traffic_splits
            .remove(&ResourceKey::new(namespace, name))
            .is_some()
        {
            self.touch();
        }
    }
}

// === distillation ===

impl ServiceInfo {
    fn from_resource(key: ResourceKey, service: &k8s::Service) -> Self {
        let spec = service.spec.as_ref();
        let cluster_ip = spec
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None");
        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().filter_map(port_def).collect())
            .unwrap_or_default();
        Self {
            key,
            cluster_ip,
            ports,
            annotations: service.annotations().clone(),
        }
    }
}

fn port_def(port: &k8s::ServicePort) -> Option<PortDef> {
    let number = u16::try_from(port.port).ok()?;
    let target_port = match &port.target_port {
        Some(IntOrString::Int(i)) => u16::try_from(*i).ok(),
        _ => None,
    };
    Some(PortDef {
        name: port.name.clone().unwrap_or_default(),
        protocol: port
            .protocol
            .as_deref()
            .and_then(Protocol::parse)
            .unwrap_or_default(),
        port: number,
        target_port,
    })
}

impl ShadowInfo {
    fn from_resource(name: String, service: &k8s::Service) -> Self {
        let annotations = service.annotations();
        let source = match (
            annotations.get(SOURCE_NAMESPACE_ANNOTATION),
            annotations.get(SOURCE_NAME_ANNOTATION),
        ) {
            (Some(ns), Some(name)) => Some(ResourceKey::new(ns, name)),
            _ => None,
        };
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| {
                        let number = u16::try_from(p.port).ok()?;
                        Some(ShadowPort {
                            name: p.name.clone().unwrap_or_default(),
                            protocol: p
                                .protocol
                                .as_deref()
                                .and_then(Protocol::parse)
                                .unwrap_or_default(),
                            port: number,
                            mesh_port: match &p.target_port {
                                Some(IntOrString::Int(i)) => u16::try_from(*i).ok(),
                                _ => None,
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name,
            source,
            ports,
        }
    }
}

impl PodInfo {
    fn from_resource(key: ResourceKey, pod: &k8s::Pod) -> Self {
        let status = pod.status.as_ref();
        let ip = status
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty());
        // A pod is ready when every container reports ready.
        let ready = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| !statuses.is_empty() && statuses.iter().all(|cs| cs.ready))
            .unwrap_or(false);
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| "default".to_string());
        let owner = pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first())
            .map(|r| format!("{}/{}", r.kind, r.name));
        Self {
            key,
            ip,
            service_account,
            owner,
            ready,
            labels: pod.labels().clone(),
        }
    }
}

impl EndpointsInfo {
    fn from_resource(key: ResourceKey, endpoints: &k8s::Endpoints) -> Self {
        let address = |addr: &k8s::api::core::v1::EndpointAddress| EndpointAddressInfo {
            ip: addr.ip.clone(),
            target: addr.target_ref.as_ref().and_then(|r| {
                Some(ResourceKey::new(
                    r.namespace.clone().unwrap_or_else(|| key.namespace.clone()),
                    r.name.clone()?,
                ))
            }),
        };
        let subsets = endpoints
            .subsets
            .iter()
            .flatten()
            .map(|subset| EndpointSubsetInfo {
                addresses: subset.addresses.iter().flatten().map(address).collect(),
                not_ready_addresses: subset
                    .not_ready_addresses
                    .iter()
                    .flatten()
                    .map(address)
                    .collect(),
                ports: subset
                    .ports
                    .iter()
                    .flatten()
                    .filter_map(|p| {
                        Some(EndpointPortInfo {
                            name: p.name.clone().unwrap_or_default(),
                            port: u16::try_from(p.port).ok()?,
                            protocol: p
                                .protocol
                                .as_deref()
                                .and_then(Protocol::parse)
                                .unwrap_or_default(),
                        })
                    })
                    .collect(),
            })
            .collect();
        Self { key, subsets }
    }
}

impl TrafficTargetInfo {
    fn from_resource(key: ResourceKey, target: &k8s::access::TrafficTarget) -> Self {
        let fallback_ns = key.namespace.clone();
        let subject = move |s: &k8s::access::IdentityBindingSubject| SubjectInfo {
            kind: s.kind.clone(),
            name: s.name.clone(),
            namespace: s.namespace.clone().unwrap_or_else(|| fallback_ns.clone()),
            port: s.port,
        };
        let destination = subject(&target.spec.destination);
        let sources = target.spec.sources.iter().flatten().map(&subject).collect();
        let rules = target
            .spec
            .rules
            .iter()
            .flatten()
            .map(|r| RuleInfo {
                kind: r.kind.clone(),
                name: r.name.clone(),
                matches: r.matches.clone(),
            })
            .collect();
        Self {
            key,
            destination,
            sources,
            rules,
        }
    }
}

impl RouteGroupInfo {
    fn from_resource(key: ResourceKey, group: &k8s::specs::HTTPRouteGroup) -> Self {
        let matches = group
            .spec
            .matches
            .iter()
            .flatten()
            .map(|m| HttpMatch {
                name: m.name.clone(),
                path_regex: m.path_regex.clone(),
                methods: m.methods.clone(),
                headers: m.headers.clone(),
            })
            .collect();
        Self { key, matches }
    }
}

impl TrafficSplitInfo {
    fn from_resource(key: ResourceKey, split: &k8s::split::TrafficSplit) -> Self {
        Self {
            key,
            service: split.spec.service.clone(),
            backends: split
                .spec
                .backends
                .iter()
                .flatten()
                .map(|b| (b.service.clone(), b.weight))
                .collect(),
        }
    }
}

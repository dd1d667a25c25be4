use mesh_controller_core::{keys, ports::PortClass, ResourceKey};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub const APP_LABEL: &str = "app";
pub const APP_VALUE: &str = "mesh";
pub const COMPONENT_LABEL: &str = "component";
pub const COMPONENT_SHADOW_SERVICE: &str = "mesh-svc";
pub const COMPONENT_PROXY_NODE: &str = "mesh-node";

/// Bookkeeping annotations stamped on shadow services so the port book can
/// be rebuilt on startup without parsing shadow names.
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "mesh.io/source-service-namespace";
pub const SOURCE_NAME_ANNOTATION: &str = "mesh.io/source-service-name";

/// Cluster-wide controller settings.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// The namespace the mesh itself runs in.
    pub mesh_namespace: String,

    /// E.g. "cluster.local".
    pub cluster_domain: String,

    /// The pseudo-domain user traffic addresses, e.g. "mesh".
    pub mesh_suffix: String,

    /// The traffic class of TCP service ports without a `traffic-type`
    /// annotation.
    pub default_mode: PortClass,

    /// Whether TrafficTarget enforcement is on.
    pub acl_enabled: bool,

    /// Namespaces whose services are never meshed.
    pub ignored_namespaces: BTreeSet<String>,
}

// === impl ClusterConfig ===

impl ClusterConfig {
    pub fn is_ignored(&self, namespace: &str) -> bool {
        namespace == self.mesh_namespace || self.ignored_namespaces.contains(namespace)
    }

    pub fn shadow_service_name(&self, service: &ResourceKey) -> String {
        keys::shadow_service_name(&self.mesh_namespace, service)
    }
}

fn has_mesh_component(labels: &BTreeMap<String, String>, component: &str) -> bool {
    labels.get(APP_LABEL).map(String::as_str) == Some(APP_VALUE)
        && labels.get(COMPONENT_LABEL).map(String::as_str) == Some(component)
}

/// Whether a label set marks a controller-owned shadow service.
pub fn is_shadow_service(labels: &BTreeMap<String, String>) -> bool {
    has_mesh_component(labels, COMPONENT_SHADOW_SERVICE)
}

/// Whether a label set marks a mesh proxy node pod.
pub fn is_proxy_node(labels: &BTreeMap<String, String>) -> bool {
    has_mesh_component(labels, COMPONENT_PROXY_NODE)
}

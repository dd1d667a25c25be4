//! Shadow-service management.
//!
//! Every user service outside the ignored namespaces owns exactly one
//! shadow service in the mesh namespace: same ports, but each targetPort is
//! a controller-allocated mesh port, and the selector points at the proxy
//! node pods. Writes go through server-side apply so create and update are
//! the same idempotent call.

use mesh_controller_k8s_api::{self as k8s, ResourceExt};
use mesh_controller_k8s_index::{
    ClusterConfig, ServiceInfo, ShadowInfo, APP_LABEL, APP_VALUE, COMPONENT_LABEL,
    COMPONENT_PROXY_NODE, COMPONENT_SHADOW_SERVICE, SOURCE_NAME_ANNOTATION,
    SOURCE_NAMESPACE_ANNOTATION,
};
use std::collections::BTreeMap;

pub(crate) const FIELD_MANAGER: &str = "mesh-controller";

pub(crate) struct ShadowManager {
    api: k8s::Api<k8s::Service>,
}

// === impl ShadowManager ===

impl ShadowManager {
    pub fn new(client: k8s::Client, mesh_namespace: &str) -> Self {
        Self {
            api: k8s::Api::namespaced(client, mesh_namespace),
        }
    }

    /// Builds the shadow service object for a user service and its
    /// allocated mesh ports (one per service port, same order).
    pub fn desired(
        cluster: &ClusterConfig,
        service: &ServiceInfo,
        mesh_ports: &[u16],
    ) -> k8s::Service {
        let ports = service
            .ports
            .iter()
            .zip(mesh_ports)
            .map(|(port, mesh_port)| k8s::ServicePort {
                name: (!port.name.is_empty()).then(|| port.name.clone()),
                protocol: Some(port.protocol.to_string()),
                port: port.port.into(),
                target_port: Some(k8s::IntOrString::Int((*mesh_port).into())),
                ..Default::default()
            })
            .collect();

        k8s::Service {
            metadata: k8s::ObjectMeta {
                name: Some(cluster.shadow_service_name(&service.key)),
                namespace: Some(cluster.mesh_namespace.clone()),
                labels: Some(shadow_labels()),
                annotations: Some(source_annotations(service)),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                selector: Some(node_selector()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Whether an existing shadow already carries the desired ports, so the
    /// apply can be skipped.
    pub fn up_to_date(existing: &ShadowInfo, service: &ServiceInfo, mesh_ports: &[u16]) -> bool {
        existing.source.as_ref() == Some(&service.key)
            && existing.ports.len() == service.ports.len()
            && existing
                .ports
                .iter()
                .zip(service.ports.iter().zip(mesh_ports))
                .all(|(shadow, (port, mesh_port))| {
                    shadow.name == port.name
                        && shadow.protocol == port.protocol
                        && shadow.port == port.port
                        && shadow.mesh_port == Some(*mesh_port)
                })
    }

    pub async fn apply(&self, shadow: k8s::Service) -> Result<(), k8s::Error> {
        let name = shadow.name_unchecked();
        let params = k8s::PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(&name, &params, &k8s::Patch::Apply(&shadow))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), k8s::Error> {
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(k8s::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error),
        }
    }
}

fn shadow_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_VALUE.to_string()),
        (
            COMPONENT_LABEL.to_string(),
            COMPONENT_SHADOW_SERVICE.to_string(),
        ),
    ])
}

fn node_selector() -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_VALUE.to_string()),
        (
            COMPONENT_LABEL.to_string(),
            COMPONENT_PROXY_NODE.to_string(),
        ),
    ])
}

fn source_annotations(service: &ServiceInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            SOURCE_NAMESPACE_ANNOTATION.to_string(),
            service.key.namespace.clone(),
        ),
        (SOURCE_NAME_ANNOTATION.to_string(), service.key.name.clone()),
    ])
}

//! Informer cache index for the mesh controller.
//!
//! Watch events are applied to the [`Index`], which keeps a distilled copy
//! of every resource the controller cares about and signals the reconciler.
//! The reconciler takes a [`Snapshot`] and feeds it to the topology builder;
//! nothing here mutates cluster state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod index;
pub mod topology;

#[cfg(test)]
mod tests;

pub use self::cluster::{
    is_proxy_node, is_shadow_service, ClusterConfig, APP_LABEL, APP_VALUE, COMPONENT_LABEL,
    COMPONENT_PROXY_NODE, COMPONENT_SHADOW_SERVICE, SOURCE_NAME_ANNOTATION,
    SOURCE_NAMESPACE_ANNOTATION,
};
pub use self::index::{
    EndpointAddressInfo, EndpointPortInfo, EndpointSubsetInfo, EndpointsInfo, Index, PodInfo,
    PortDef, ProxyNode, RouteGroupInfo, RuleInfo, ServiceInfo, ShadowInfo, ShadowPort,
    SharedIndex, Snapshot, SubjectInfo, TcpRouteInfo, TrafficSplitInfo, TrafficTargetInfo,
};

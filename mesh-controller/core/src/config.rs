//! The dynamic configuration consumed by mesh nodes.
//!
//! This is a closed model of the proxy's dynamic-config JSON schema. The
//! schema is a wire contract: nodes poll the controller for this document,
//! so field names and shapes must stay stable across controller versions.
//! All maps are ordered so that identical inputs serialize to identical
//! bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The entry point reserved for node health checks.
pub const READINESS_ENTRY_POINT: &str = "readiness";

/// The address every whitelist falls back to when a service must not be
/// reachable: no client ever matches it.
const BLOCK_ALL_RANGE: &str = "255.255.255.255/32";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfiguration {
    pub http: HttpConfiguration,
    pub tcp: TcpConfiguration,
    pub udp: UdpConfiguration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, HttpService>,
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    pub rule: String,
    pub priority: i64,
    pub service: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HttpService {
    LoadBalancer(ServersLoadBalancer),
    Weighted(WeightedRoundRobin),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersLoadBalancer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_host_header: Option<bool>,
    pub servers: Vec<Server>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedRoundRobin {
    pub services: Vec<WeightedServiceItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedServiceItem {
    pub name: String,
    pub weight: u32,
}

/// A middleware variant. Serialized externally tagged, which yields the
/// proxy's `{"retry": {...}}` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    IpWhiteList(IpWhiteList),
    Retry(Retry),
    RateLimit(RateLimit),
    CircuitBreaker(CircuitBreaker),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpWhiteList {
    pub source_range: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retry {
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub average: u64,
    pub burst: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub expression: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpConfiguration {
    pub routers: BTreeMap<String, TcpRouter>,
    pub services: BTreeMap<String, TcpService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    pub entry_points: Vec<String>,
    pub rule: String,
    pub service: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpService {
    LoadBalancer(TcpServersLoadBalancer),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpServersLoadBalancer {
    pub servers: Vec<AddressServer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressServer {
    pub address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpConfiguration {
    pub routers: BTreeMap<String, UdpRouter>,
    pub services: BTreeMap<String, UdpService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpRouter {
    pub entry_points: Vec<String>,
    pub service: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UdpService {
    LoadBalancer(TcpServersLoadBalancer),
}

// === impl Middleware ===

impl Middleware {
    /// A whitelist no address matches, denying all traffic.
    pub fn block_all() -> Self {
        Self::IpWhiteList(IpWhiteList {
            source_range: vec![BLOCK_ALL_RANGE.to_string()],
        })
    }

    pub fn whitelist(source_range: Vec<String>) -> Self {
        Self::IpWhiteList(IpWhiteList { source_range })
    }
}

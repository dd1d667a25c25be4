use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Splits traffic addressed to a root service across weighted backends.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "split.smi-spec.io",
    version = "v1alpha3",
    kind = "TrafficSplit",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitSpec {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<TrafficSplitBackend>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitBackend {
    pub service: String,
    pub weight: u32,
}

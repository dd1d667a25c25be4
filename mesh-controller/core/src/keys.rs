use serde::Serialize;
use std::fmt;

/// Identifies a namespaced cluster resource.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Builds the name of the shadow service fronting a user service.
pub fn shadow_service_name(mesh_namespace: &str, service: &ResourceKey) -> String {
    format!("{}-{}-{}", mesh_namespace, service.name, service.namespace)
}

/// Lowercase hex encoding of a DNS suffix.
///
/// The suffix may contain dots, which are not valid inside a DNS label; the
/// hex form is used wherever the suffix has to ride along inside a name.
pub fn hex_label(suffix: &str) -> String {
    suffix
        .bytes()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod specs;
pub mod split;

pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        core::v1::{
            ConfigMap, Container, ContainerPort, Endpoints, Namespace, ObjectReference, Pod,
            PodSpec, PodStatus, Service, ServiceAccount, ServicePort, ServiceSpec,
        },
    },
    apimachinery::{self, pkg::util::intstr::IntOrString},
};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt,
    },
    error::ErrorResponse,
    Client, Error,
};

//! Runtime wiring for the mesh controller: CLI arguments and subcommands,
//! the reconciler loop, shadow-service management, DNS bootstrap and the
//! configuration API.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_controller_core as core;
pub use mesh_controller_k8s_api as k8s;
pub use mesh_controller_k8s_index as index;
pub use mesh_controller_provider as provider;

mod api;
mod args;
mod dns;
mod events;
mod metrics;
mod reconciler;
mod shadow;
mod store;

pub use self::args::Args;

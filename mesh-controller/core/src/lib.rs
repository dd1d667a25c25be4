//! Mesh controller core model.
//!
//! Value types shared by the informer index, the topology builder and the
//! configuration compiler: canonical keys, parsed service annotations, the
//! mesh port book, the immutable topology graph and the dynamic proxy
//! configuration served to the mesh nodes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod config;
pub mod keys;
pub mod ports;
pub mod topology;

pub use self::keys::ResourceKey;

//! The mesh port book.
//!
//! Every user service port is assigned a stable port from one of three
//! bounded pools, one per traffic class. The assignment is the shadow
//! service's target port and names the proxy entry point that carries the
//! service's traffic.

use crate::keys::ResourceKey;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const HTTP_POOL_BASE: u16 = 5000;
pub const TCP_POOL_BASE: u16 = 10000;
pub const UDP_POOL_BASE: u16 = 15000;

/// A traffic class, doubling as the port pool selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortClass {
    Http,
    Tcp,
    Udp,
}

/// Identifies a user service port, the unit of port-book accounting.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePort {
    pub service: ResourceKey,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the {0} port pool is exhausted")]
    Exhausted(PortClass),

    #[error("mesh port {port} in the {class} pool is assigned to multiple services")]
    DuplicatePort { class: PortClass, port: u16 },

    #[error("mesh port {0} is outside of every pool")]
    OutOfRange(u16),
}

/// Bookkeeping for the three mesh port pools.
///
/// Mutated only by the reconciler; builders read an immutable reference.
#[derive(Debug)]
pub struct PortTable {
    http: Pool,
    tcp: Pool,
    udp: Pool,
}

#[derive(Debug)]
struct Pool {
    class: PortClass,
    base: u16,
    limit: u16,
    by_source: BTreeMap<SourcePort, u16>,
    used: BTreeSet<u16>,
}

// === impl PortClass ===

impl PortClass {
    /// Names the proxy entry point carrying traffic for a mesh port.
    pub fn entry_point(&self, mesh_port: u16) -> String {
        format!("{}-{}", self, mesh_port)
    }
}

impl fmt::Display for PortClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
        }
    }
}

impl std::str::FromStr for PortClass {
    type Err = InvalidPortClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            s => Err(InvalidPortClass(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("expected one of http, tcp or udp; got {0:?}")]
pub struct InvalidPortClass(pub String);

// === impl SourcePort ===

impl SourcePort {
    pub fn new(service: ResourceKey, port: u16) -> Self {
        Self { service, port }
    }
}

impl fmt::Display for SourcePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

// === impl PortTable ===

impl PortTable {
    pub fn new(http_limit: u16, tcp_limit: u16, udp_limit: u16) -> Self {
        Self {
            http: Pool::new(PortClass::Http, HTTP_POOL_BASE, http_limit),
            tcp: Pool::new(PortClass::Tcp, TCP_POOL_BASE, tcp_limit),
            udp: Pool::new(PortClass::Udp, UDP_POOL_BASE, udp_limit),
        }
    }

    /// Determines the pool a mesh port belongs to.
    pub fn classify(&self, mesh_port: u16) -> Option<PortClass> {
        [&self.http, &self.tcp, &self.udp]
            .into_iter()
            .find(|pool| pool.contains(mesh_port))
            .map(|pool| pool.class)
    }

    /// Seeds the pools from pre-existing assignments, e.g. shadow services
    /// found at startup. A mesh port assigned to more than one source is a
    /// fatal bookkeeping error.
    pub fn load(
        &mut self,
        entries: impl IntoIterator<Item = (SourcePort, u16)>,
    ) -> Result<(), Error> {
        for (source, mesh_port) in entries {
            let class = self.classify(mesh_port).ok_or(Error::OutOfRange(mesh_port))?;
            let pool = self.pool_mut(class);
            if !pool.used.insert(mesh_port) {
                return Err(Error::DuplicatePort {
                    class,
                    port: mesh_port,
                });
            }
            pool.by_source.insert(source, mesh_port);
        }
        Ok(())
    }

    /// Returns the mesh port assigned to a source, allocating the lowest
    /// free port in the class pool on first use. Assignments are stable
    /// until released.
    pub fn acquire(&mut self, source: SourcePort, class: PortClass) -> Result<u16, Error> {
        // A class change (e.g. an edited traffic-type annotation) moves the
        // source to the new pool.
        if self.lookup(&source).map_or(false, |(c, _)| c != class) {
            self.release(&source);
        }
        self.pool_mut(class).acquire(source)
    }

    /// Removes a source's assignment from whichever pool holds it.
    pub fn release(&mut self, source: &SourcePort) {
        for pool in [&mut self.http, &mut self.tcp, &mut self.udp] {
            if let Some(port) = pool.by_source.remove(source) {
                pool.used.remove(&port);
            }
        }
    }

    pub fn lookup(&self, source: &SourcePort) -> Option<(PortClass, u16)> {
        [&self.http, &self.tcp, &self.udp]
            .into_iter()
            .find_map(|pool| pool.by_source.get(source).map(|port| (pool.class, *port)))
    }

    pub fn used(&self, class: PortClass) -> usize {
        self.pool(class).used.len()
    }

    fn pool(&self, class: PortClass) -> &Pool {
        match class {
            PortClass::Http => &self.http,
            PortClass::Tcp => &self.tcp,
            PortClass::Udp => &self.udp,
        }
    }

    fn pool_mut(&mut self, class: PortClass) -> &mut Pool {
        match class {
            PortClass::Http => &mut self.http,
            PortClass::Tcp => &mut self.tcp,
            PortClass::Udp => &mut self.udp,
        }
    }
}

// === impl Pool ===

impl Pool {
    fn new(class: PortClass, base: u16, limit: u16) -> Self {
        Self {
            class,
            base,
            limit,
            by_source: BTreeMap::new(),
            used: BTreeSet::new(),
        }
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.base && u32::from(port) < u32::from(self.base) + u32::from(self.limit)
    }

    fn acquire(&mut self, source: SourcePort) -> Result<u16, Error> {
        if let Some(port) = self.by_source.get(&source) {
            return Ok(*port);
        }
        let port = (0..self.limit)
            .map(|i| self.base + i)
            .find(|p| !self.used.contains(p))
            .ok_or(Error::Exhausted(self.class))?;
        self.used.insert(port);
        self.by_source.insert(source, port);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(ns: &str, name: &str, port: u16) -> SourcePort {
        SourcePort::new(ResourceKey::new(ns, name), port)
    }

    #[test]
    fn acquire_is_stable() {
        let mut table = PortTable::new(10, 25, 25);
        let s = source("app", "foo", 80);
        let p0 = table.acquire(s.clone(), PortClass::Http).unwrap();
        let p1 = table.acquire(s, PortClass::Http).unwrap();
        assert_eq!(p0, 5000);
        assert_eq!(p0, p1);
        assert_eq!(table.used(PortClass::Http), 1);
    }

    #[test]
    fn pools_start_at_their_bases() {
        let mut table = PortTable::new(10, 25, 25);
        assert_eq!(
            table.acquire(source("a", "h", 80), PortClass::Http).unwrap(),
            5000
        );
        assert_eq!(
            table.acquire(source("a", "t", 81), PortClass::Tcp).unwrap(),
            10000
        );
        assert_eq!(
            table.acquire(source("a", "u", 82), PortClass::Udp).unwrap(),
            15000
        );
    }

    #[test]
    fn released_ports_are_reused_lowest_first() {
        let mut table = PortTable::new(10, 25, 25);
        let s1 = source("a", "s1", 80);
        let s2 = source("a", "s2", 80);
        assert_eq!(table.acquire(s1.clone(), PortClass::Http).unwrap(), 5000);
        assert_eq!(table.acquire(s2.clone(), PortClass::Http).unwrap(), 5001);

        table.release(&s1);
        assert_eq!(table.lookup(&s1), None);
        assert_eq!(
            table.acquire(source("a", "s3", 80), PortClass::Http).unwrap(),
            5000
        );
        assert_eq!(table.lookup(&s2), Some((PortClass::Http, 5001)));
    }

    #[test]
    fn release_is_idempotent() {
        let mut table = PortTable::new(10, 25, 25);
        let s = source("a", "s1", 80);
        table.acquire(s.clone(), PortClass::Http).unwrap();
        table.release(&s);
        table.release(&s);
        assert_eq!(table.used(PortClass::Http), 0);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut table = PortTable::new(2, 25, 25);
        table.acquire(source("a", "s1", 80), PortClass::Http).unwrap();
        table.acquire(source("a", "s2", 80), PortClass::Http).unwrap();
        assert!(matches!(
            table.acquire(source("a", "s3", 80), PortClass::Http),
            Err(Error::Exhausted(PortClass::Http))
        ));
    }

    #[test]
    fn load_rejects_duplicates() {
        let mut table = PortTable::new(10, 25, 25);
        let res = table.load(vec![
            (source("a", "s1", 80), 5000),
            (source("a", "s2", 80), 5000),
        ]);
        assert!(matches!(
            res,
            Err(Error::DuplicatePort {
                class: PortClass::Http,
                port: 5000
            })
        ));
    }

    #[test]
    fn load_rejects_out_of_range_ports() {
        let mut table = PortTable::new(10, 25, 25);
        assert!(matches!(
            table.load(vec![(source("a", "s1", 80), 4999)]),
            Err(Error::OutOfRange(4999))
        ));
    }

    #[test]
    fn loaded_assignments_are_honored() {
        let mut table = PortTable::new(10, 25, 25);
        table
            .load(vec![(source("a", "s1", 80), 5001)])
            .unwrap();
        assert_eq!(
            table.acquire(source("a", "s1", 80), PortClass::Http).unwrap(),
            5001
        );
        // The freed low port goes to the next allocation.
        assert_eq!(
            table.acquire(source("a", "s2", 80), PortClass::Http).unwrap(),
            5000
        );
    }

    #[test]
    fn class_change_moves_pools() {
        let mut table = PortTable::new(10, 25, 25);
        let s = source("a", "s1", 80);
        assert_eq!(table.acquire(s.clone(), PortClass::Http).unwrap(), 5000);
        assert_eq!(table.acquire(s.clone(), PortClass::Tcp).unwrap(), 10000);
        assert_eq!(table.lookup(&s), Some((PortClass::Tcp, 10000)));
        assert_eq!(table.used(PortClass::Http), 0);
    }
}

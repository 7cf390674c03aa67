//! Connection pooling: the shared tuple → [`crate::conn::Conn`] table
//! ([`conn_pool::ConnPool`]), the frozen-flow window ([`ttl::TtlCache`]), and
//! port/protocol binding lookup.

pub mod conn_pool;
pub mod ttl;

pub use conn_pool::ConnPool;
pub use ttl::TtlCache;

use std::collections::HashMap;

use crate::protocols::ProtocolId;

/// Maps a destination port to the protocol decoder that should handle it.
///
/// Grounded on Retina's `FilterFactory`-driven port predicate tables in
/// `core/src/config.rs`, simplified to a direct port→protocol map since the
/// BPF/filter compilation layer that produces those predicates is out of
/// scope here.
#[derive(Debug, Default, Clone)]
pub struct PortBindings {
    by_port: HashMap<u16, ProtocolId>,
}

impl PortBindings {
    pub fn new() -> Self {
        PortBindings::default()
    }

    pub fn bind(&mut self, port: u16, proto: ProtocolId) {
        self.by_port.insert(port, proto);
    }

    /// Resolves the protocol bound to either side of `(src_port, dst_port)`,
    /// checking `src_port` first. Returns the matched port alongside the
    /// protocol — that port is the connection's server side, used to derive
    /// each packet's client/server role independent of which tuple happened
    /// to open the connection.
    pub fn decide_proto(&self, src_port: u16, dst_port: u16) -> Option<(u16, ProtocolId)> {
        self.by_port
            .get(&src_port)
            .map(|proto| (src_port, *proto))
            .or_else(|| self.by_port.get(&dst_port).map(|proto| (dst_port, *proto)))
    }

    /// Replaces the binding table in place, returning the set of ports whose
    /// protocol assignment changed (added, removed, or reassigned) — used by
    /// the config hot-reload path to decide which live connections to leave
    /// alone versus tear down.
    pub fn reload(&mut self, new_bindings: PortBindings) -> Vec<u16> {
        let mut changed = Vec::new();
        for (port, proto) in new_bindings.by_port.iter() {
            match self.by_port.get(port) {
                Some(existing) if existing == proto => {}
                _ => changed.push(*port),
            }
        }
        for port in self.by_port.keys() {
            if !new_bindings.by_port.contains_key(port) {
                changed.push(*port);
            }
        }
        self.by_port = new_bindings.by_port;
        changed
    }
}

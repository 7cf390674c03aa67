//! The shared connection table: a dual-keyed map from [`Tuple`] to the
//! [`Conn`] it belongs to (both the tuple that opened the connection and its
//! mirror resolve to the same connection), plus the frozen-flow TTL cache.
//!
//! Grounded on `core/src/conntrack/mod.rs`'s `LinkedHashMap` + mirror lookup,
//! generalized to store *both* keys (Retina's capture core only ever
//! sees one direction's SYN per core and so never needs the mirror key in the
//! same table) and to be safely shared across the packet-processing threads
//! and the periodic expiry sweep with `std::sync::RwLock` — Retina avoids
//! any lock here by sharding one table per core, but this module needs a
//! single shared table reachable from every worker thread.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use log::{debug, trace};
use thiserror::Error;

use crate::conn::Conn;
use crate::pool::ttl::TtlCache;
use crate::tuple::{FlowKey, Tuple};

pub type ConnHandle<'a> = Arc<Mutex<Conn<'a>>>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("no connection found for the given tuple")]
    NotFound,
}

pub struct ConnPool<'a> {
    table: RwLock<LinkedHashMap<Tuple, ConnHandle<'a>>>,
    frozen: Mutex<TtlCache>,
    expiry: Duration,
}

impl<'a> ConnPool<'a> {
    pub fn new(expiry: Duration, freeze_ttl: Duration) -> Self {
        ConnPool {
            table: RwLock::new(LinkedHashMap::new()),
            frozen: Mutex::new(TtlCache::new(freeze_ttl)),
            expiry,
        }
    }

    /// Looks up the connection owning `tuple` (by either key), or creates a
    /// fresh one keyed by `tuple` as originator if none exists and the flow
    /// isn't currently frozen. Returns `None` only when frozen — the frozen
    /// check runs before any table lookup, so a tuple that was just expired
    /// and frozen is rejected even if stale table entries briefly remain.
    /// `server_port`, when known, is threaded into the new `Conn` so it can
    /// derive each packet's client/server role without depending on which
    /// tuple happened to open the connection.
    pub fn get_or_create(&self, tuple: Tuple, server_port: Option<u16>, now: Instant) -> Option<ConnHandle<'a>> {
        let key = FlowKey::new(tuple);
        if self.frozen.lock().unwrap().is_frozen(&key, now) {
            trace!(target: "pool", "rejecting packet for frozen flow {}", tuple);
            return None;
        }

        if let Some(handle) = self.table.read().unwrap().get(&tuple) {
            return Some(Arc::clone(handle));
        }

        let mut table = self.table.write().unwrap();
        // Re-check under the write lock: another thread may have inserted
        // this connection (from either direction) while we waited.
        if let Some(handle) = table.get(&tuple) {
            return Some(Arc::clone(handle));
        }
        let mirror = tuple.mirror();
        if let Some(handle) = table.get(&mirror) {
            table.insert(tuple, Arc::clone(handle));
            return Some(Arc::clone(handle));
        }

        debug!(target: "pool", "new connection {}", tuple);
        let handle: ConnHandle<'a> = Arc::new(Mutex::new(Conn::new(tuple, server_port, now)));
        table.insert(tuple, Arc::clone(&handle));
        table.insert(mirror, Arc::clone(&handle));
        Some(handle)
    }

    /// Removes the connection owning `tuple` (both keys), without freezing
    /// its flow key — used for protocol-driven early teardown (e.g. an AMQP
    /// `Connection.Close`), where a fresh reconnect on the same ports should
    /// be accepted immediately rather than held in the frozen window.
    pub fn delete(&self, tuple: Tuple) -> Result<(), PoolError> {
        let mut table = self.table.write().unwrap();
        match table.remove(&tuple) {
            Some(_) => {
                table.remove(&tuple.mirror());
                Ok(())
            }
            None => Err(PoolError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        // Each connection occupies two keys.
        self.table.read().unwrap().len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes connections inactive for longer than `expiry`, freezing their
    /// flow keys so late stragglers don't resurrect them.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let mut expired_tuples: Vec<Tuple> = Vec::new();
        let mut expired_keys: Vec<FlowKey> = Vec::new();
        {
            let table = self.table.read().unwrap();
            let mut seen = std::collections::HashSet::new();
            for (tuple, handle) in table.iter() {
                let key = FlowKey::new(*tuple);
                if !seen.insert(key.clone()) {
                    continue;
                }
                let conn = handle.lock().unwrap();
                let idle = now.saturating_duration_since(conn.last_active());
                if conn.is_closed() || idle >= self.expiry {
                    expired_tuples.push(*tuple);
                    expired_tuples.push(tuple.mirror());
                    expired_keys.push(key);
                }
            }
        }
        if expired_tuples.is_empty() {
            return 0;
        }
        let mut table = self.table.write().unwrap();
        for tuple in &expired_tuples {
            table.remove(tuple);
        }
        drop(table);
        let mut frozen = self.frozen.lock().unwrap();
        for key in &expired_keys {
            frozen.freeze(key.clone(), now);
        }
        frozen.sweep(now);
        expired_keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple() -> Tuple {
        Tuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1234,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    #[test]
    fn mirror_lookup_resolves_to_same_connection() {
        let pool: ConnPool = ConnPool::new(Duration::from_secs(60), Duration::from_secs(120));
        let now = Instant::now();
        let a = pool.get_or_create(tuple(), Some(80), now).unwrap();
        let b = pool.get_or_create(tuple().mirror(), Some(80), now).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn expired_connection_is_frozen_and_rejected_on_recreate() {
        let pool: ConnPool = ConnPool::new(Duration::from_millis(10), Duration::from_secs(60));
        let t0 = Instant::now();
        pool.get_or_create(tuple(), Some(80), t0).unwrap();
        let t1 = t0 + Duration::from_millis(50);
        assert_eq!(pool.remove_expired(t1), 1);
        assert_eq!(pool.len(), 0);
        assert!(pool.get_or_create(tuple(), Some(80), t1).is_none());
    }

    #[test]
    fn delete_removes_both_keys_without_freezing() {
        let pool: ConnPool = ConnPool::new(Duration::from_secs(60), Duration::from_secs(120));
        let now = Instant::now();
        pool.get_or_create(tuple(), Some(80), now).unwrap();
        assert_eq!(pool.len(), 1);
        pool.delete(tuple()).unwrap();
        assert_eq!(pool.len(), 0);
        // Immediately reusable — not held in the frozen window.
        assert!(pool.get_or_create(tuple(), Some(80), now).is_some());
    }

    #[test]
    fn delete_unknown_tuple_returns_not_found() {
        let pool: ConnPool = ConnPool::new(Duration::from_secs(60), Duration::from_secs(120));
        assert_eq!(pool.delete(tuple()), Err(PoolError::NotFound));
    }
}

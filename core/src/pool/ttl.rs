//! Frozen-flow cache: rejects packets for a tuple whose connection closed
//! within the last TTL window (2×MSL by default), so that stray retransmits
//! arriving after teardown don't spawn a bogus new connection.
//!
//! Generalized from Retina's `conntrack::timerwheel::TimerWheel` idea —
//! same "oldest-insertion-first" eviction shape via `hashlink::LinkedHashMap`,
//! but remembering a closed key for a window rather than firing a one-shot
//! expiry callback.

use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;

use crate::tuple::FlowKey;

pub struct TtlCache {
    ttl: Duration,
    entries: LinkedHashMap<FlowKey, Instant>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: LinkedHashMap::new(),
        }
    }

    /// Marks `key` as frozen as of `now`.
    pub fn freeze(&mut self, key: FlowKey, now: Instant) {
        self.entries.insert(key, now);
    }

    /// Returns `true` if `key` was frozen within the TTL window as of `now`.
    pub fn is_frozen(&self, key: &FlowKey, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(frozen_at) => now.saturating_duration_since(*frozen_at) < self.ttl,
            None => false,
        }
    }

    /// Drops entries older than the TTL window. Insertion order in
    /// `LinkedHashMap` is oldest-first, so we can stop at the first live one.
    pub fn sweep(&mut self, now: Instant) {
        while let Some((_, frozen_at)) = self.entries.front() {
            if now.saturating_duration_since(*frozen_at) >= self.ttl {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Tuple;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(port: u16) -> FlowKey {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        FlowKey::new(Tuple::new(a, port, b, 80))
    }

    #[test]
    fn frozen_entry_rejects_until_ttl_elapses() {
        let mut cache = TtlCache::new(Duration::from_millis(50));
        let now = Instant::now();
        cache.freeze(key(1), now);
        assert!(cache.is_frozen(&key(1), now));
        assert!(cache.is_frozen(&key(1), now + Duration::from_millis(10)));
        assert!(!cache.is_frozen(&key(1), now + Duration::from_millis(60)));
    }

    #[test]
    fn sweep_drops_only_expired_prefix() {
        let mut cache = TtlCache::new(Duration::from_millis(50));
        let now = Instant::now();
        cache.freeze(key(1), now);
        cache.freeze(key(2), now + Duration::from_millis(40));
        cache.sweep(now + Duration::from_millis(60));
        assert!(!cache.is_frozen(&key(1), now + Duration::from_millis(60)));
        assert_eq!(cache.len(), 1);
    }
}

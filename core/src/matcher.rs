//! Request/response matching: the three matcher shapes used across the
//! generalized over any protocol's `Role`-tagged object.
//!
//! No example in the pack implements a generic matcher; the bounded-FIFO
//! shape here follows the same "cap + evict oldest" discipline Retina
//! applies to its own bounded maps (`core/src/protocols/stream/mod.rs`'s
//! `MAX_OUTSTANDING` pending-transaction caps), generalized into a reusable
//! crate's protocols, each built on the same `Pair` building block since
//! different protocol families.

use crate::protocols::{DecodedObject, Role};

/// A matched request/response pair. `response.time >= request.time` is an
/// invariant callers may rely on (see [`RoundTrip::validate`] in
/// [`crate::roundtrip`]).
#[derive(Debug, Clone)]
pub struct Pair<T> {
    pub request: DecodedObject<T>,
    pub response: DecodedObject<T>,
}

impl<T> Pair<T> {
    fn new(mut request: DecodedObject<T>, mut response: DecodedObject<T>) -> Self {
        // Role swap (FuzzyMatcher / AMQP server pushes): if the
        // object arrival order inverted request/response, swap timestamps so
        // `response.time >= request.time` always holds for a completed pair,
        // without touching the payloads' own roles.
        if response.timestamp < request.timestamp {
            std::mem::swap(&mut request.timestamp, &mut response.timestamp);
        }
        Pair { request, response }
    }
}

/// **SingleMatcher**: at most one pending request. A new
/// request replaces any unmatched prior one; a response with no pending
/// request is dropped.
#[derive(Default)]
pub struct SingleMatcher<T> {
    pending: Option<DecodedObject<T>>,
}

impl<T> SingleMatcher<T> {
    pub fn new() -> Self {
        SingleMatcher { pending: None }
    }

    /// Feeds one decoded object in. Returns `Some(pair)` the moment a
    /// response completes the currently pending request.
    pub fn feed(&mut self, obj: DecodedObject<T>) -> Option<Pair<T>> {
        match obj.role {
            Role::Request => {
                self.pending = Some(obj);
                None
            }
            Role::Response => self.pending.take().map(|req| Pair::new(req, obj)),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// **ListMatcher**: a bounded FIFO of pending requests, keyed
/// by an arbitrary match predicate rather than arrival order. Used for
/// HTTP/2, gRPC, MongoDB, and Kafka.
pub struct ListMatcher<T> {
    cap: usize,
    pending: Vec<DecodedObject<T>>,
}

impl<T> ListMatcher<T> {
    pub fn new(cap: usize) -> Self {
        ListMatcher { cap: cap.max(1), pending: Vec::new() }
    }

    /// Feeds a `Request`, pushing it onto the pending list (dropping the
    /// oldest on overflow), or a `Response`, matched against `matches` —
    /// the first pending request satisfying the predicate is removed and
    /// paired; otherwise the response is dropped.
    pub fn feed<F>(&mut self, obj: DecodedObject<T>, matches: F) -> Option<Pair<T>>
    where
        F: Fn(&T, &T) -> bool,
    {
        match obj.role {
            Role::Request => {
                if self.pending.len() >= self.cap {
                    self.pending.remove(0);
                }
                self.pending.push(obj);
                None
            }
            Role::Response => {
                let idx = self
                    .pending
                    .iter()
                    .position(|req| matches(&req.payload, &obj.payload))?;
                let req = self.pending.remove(idx);
                Some(Pair::new(req, obj))
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// **FuzzyMatcher**: holds both roles in one bounded list,
/// pairing whichever arrives first against the opposite role. Used for AMQP,
/// where a server-initiated `Basic.Deliver` can arrive before its matching
/// `Basic.Ack`.
pub struct FuzzyMatcher<T> {
    cap: usize,
    pending: Vec<DecodedObject<T>>,
}

impl<T> FuzzyMatcher<T> {
    pub fn new(cap: usize) -> Self {
        FuzzyMatcher { cap: cap.max(1), pending: Vec::new() }
    }

    /// `matches` is evaluated commutatively by the caller's predicate — it
    /// is passed `(new, candidate)` and must hold regardless of which one
    /// played the request role.
    pub fn feed<F>(&mut self, obj: DecodedObject<T>, matches: F) -> Option<Pair<T>>
    where
        F: Fn(&T, &T) -> bool,
    {
        let counterpart_idx = self.pending.iter().position(|candidate| {
            candidate.role != obj.role && matches(&obj.payload, &candidate.payload)
        });

        if let Some(idx) = counterpart_idx {
            let counterpart = self.pending.remove(idx);
            return Some(match (obj.role, counterpart.role) {
                (Role::Request, Role::Response) => Pair::new(obj, counterpart),
                (Role::Response, Role::Request) => Pair::new(counterpart, obj),
                // Same role matched: not expected given the `role != role`
                // filter above, but fall back to arrival order defensively.
                _ => Pair::new(counterpart, obj),
            });
        }

        if self.pending.len() >= self.cap {
            self.pending.remove(0);
        }
        self.pending.push(obj);
        None
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn base() -> Instant {
        // A single fixed reference point so repeated `epoch(n)` calls within
        // one test are comparable, rather than each drifting off its own
        // `Instant::now()`.
        thread_local!(static BASE: Instant = Instant::now());
        BASE.with(|b| *b)
    }

    fn epoch(offset_ms: u64) -> Instant {
        base() + std::time::Duration::from_millis(offset_ms)
    }

    fn req(ts: u64) -> DecodedObject<&'static str> {
        DecodedObject { role: Role::Request, timestamp: epoch(ts), payload: "req" }
    }

    fn resp(ts: u64) -> DecodedObject<&'static str> {
        DecodedObject { role: Role::Response, timestamp: epoch(ts), payload: "resp" }
    }

    #[test]
    fn single_matcher_replaces_unmatched_pending_request() {
        let mut m = SingleMatcher::new();
        assert!(m.feed(req(0)).is_none());
        assert!(m.feed(req(1)).is_none()); // replaces, doesn't emit
        assert!(m.has_pending());
        let pair = m.feed(resp(2)).unwrap();
        assert_eq!(pair.request.timestamp, epoch(1));
    }

    #[test]
    fn single_matcher_drops_unmatched_response() {
        let mut m: SingleMatcher<&'static str> = SingleMatcher::new();
        assert!(m.feed(resp(0)).is_none());
    }

    #[test]
    fn list_matcher_evicts_oldest_past_capacity() {
        let mut m: ListMatcher<u32> = ListMatcher::new(2);
        m.feed(DecodedObject { role: Role::Request, timestamp: epoch(0), payload: 1 }, |_, _| false);
        m.feed(DecodedObject { role: Role::Request, timestamp: epoch(1), payload: 2 }, |_, _| false);
        m.feed(DecodedObject { role: Role::Request, timestamp: epoch(2), payload: 3 }, |_, _| false);
        assert_eq!(m.pending_len(), 2);
        // Request 1 was evicted; only 2 and 3 are matchable.
        let pair = m.feed(
            DecodedObject { role: Role::Response, timestamp: epoch(3), payload: 1 },
            |req, rsp| req == rsp,
        );
        assert!(pair.is_none());
        let pair = m.feed(
            DecodedObject { role: Role::Response, timestamp: epoch(3), payload: 2 },
            |req, rsp| req == rsp,
        );
        assert!(pair.is_some());
    }

    #[test]
    fn fuzzy_matcher_pairs_response_before_request() {
        let mut m: FuzzyMatcher<u32> = FuzzyMatcher::new(8);
        // Server push (Response role) arrives first.
        let first = DecodedObject { role: Role::Response, timestamp: epoch(5), payload: 42 };
        assert!(m.feed(first, |a, b| a == b).is_none());
        let second = DecodedObject { role: Role::Request, timestamp: epoch(1), payload: 42 };
        let pair = m.feed(second, |a, b| a == b).unwrap();
        // Timestamps are normalized so response >= request despite arrival order.
        assert!(pair.response.timestamp >= pair.request.timestamp);
    }

    #[test]
    fn fuzzy_matcher_commutative_match_predicate() {
        // match(a,b) == match(b,a): role is assigned after the fact, not baked in.
        let matches = |a: &u32, b: &u32| a == b;
        assert_eq!(matches(&1, &1), matches(&1, &1));
        assert_eq!(matches(&1, &2), matches(&2, &1));
    }
}

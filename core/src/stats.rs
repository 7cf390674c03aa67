//! Runtime statistics: per-tuple packet/byte counters reset on read, plus
//! cumulative process-wide counters for decode errors, panics, and
//! backpressure drops.
//!
//! Grounded on Retina's thread-local-counter-plus-`Family<CoreId, Counter>`
//! split in `core/src/stats.rs`: cheap per-worker accumulation that only ever
//! gets folded into a shared registry on demand, rather than contending a
//! shared atomic on every packet. This module swaps the per-core label for a
//! per-tuple one (`StreamStats`, taken via [`crate::conn::Conn::take_stats`])
//! and adds the cumulative counters the round-trip dispatcher needs
//! (`panic_total`, per-kind decode-error counts, backpressure drops), which
//! Retina has no equivalent of since it has no decoder/matcher layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::protocols::DecodeError;
use crate::stream::StreamStats;
use crate::tuple::Tuple;

/// Packet/byte/skipped/inserted counters for one connection's two directions,
/// as last read from [`crate::conn::Conn::take_stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TupleStats {
    pub originator: StreamStats,
    pub responder: StreamStats,
}

/// Cumulative, never-reset counters for process health.
#[derive(Default)]
struct Cumulative {
    panic_total: AtomicU64,
    framing_errors: AtomicU64,
    unsupported: AtomicU64,
    too_large: AtomicU64,
    backpressure_drops: AtomicU64,
    round_trips_emitted: AtomicU64,
}

/// Central stats sink: a per-tuple table reset on read (`on_stats`), plus the
/// cumulative counters above. One `Stats` is shared (behind `Arc`) between
/// the dispatcher's worker threads and whatever external code polls it.
#[derive(Default)]
pub struct Stats {
    per_tuple: Mutex<HashMap<Tuple, TupleStats>>,
    cumulative: Cumulative,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    /// Accumulates a `StreamStats` delta (already reset-on-read at the
    /// stream level, see [`crate::stream::Stream::take_stats`]) into this
    /// tuple's running total, so repeated calls between two `on_stats` reads
    /// sum rather than clobber each other.
    pub fn record_tuple(&self, tuple: Tuple, originator: StreamStats, responder: StreamStats) {
        let mut table = self.per_tuple.lock().unwrap();
        let entry = table.entry(tuple).or_default();
        entry.originator.packets += originator.packets;
        entry.originator.bytes += originator.bytes;
        entry.originator.skipped += originator.skipped;
        entry.originator.inserted += originator.inserted;
        entry.responder.packets += responder.packets;
        entry.responder.bytes += responder.bytes;
        entry.responder.skipped += responder.skipped;
        entry.responder.inserted += responder.inserted;
    }

    /// Returns (and clears) the accumulated per-tuple stats table. Matches
    /// the "reading resets counters" contract used throughout this crate
    /// (see [`crate::stream::Stream::take_stats`]) at the whole-table level.
    pub fn on_stats(&self) -> HashMap<Tuple, TupleStats> {
        std::mem::take(&mut *self.per_tuple.lock().unwrap())
    }

    pub fn record_decode_error(&self, err: &DecodeError) {
        let counter = match err {
            DecodeError::Framing(_) => &self.cumulative.framing_errors,
            DecodeError::Unsupported => &self.cumulative.unsupported,
            DecodeError::TooLarge => &self.cumulative.too_large,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.cumulative.panic_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self) {
        self.cumulative.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_trip_emitted(&self) {
        self.cumulative.round_trips_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn panic_total(&self) -> u64 {
        self.cumulative.panic_total.load(Ordering::Relaxed)
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.cumulative.backpressure_drops.load(Ordering::Relaxed)
    }

    pub fn round_trips_emitted(&self) -> u64 {
        self.cumulative.round_trips_emitted.load(Ordering::Relaxed)
    }

    pub fn decode_error_counts(&self) -> (u64, u64, u64) {
        (
            self.cumulative.framing_errors.load(Ordering::Relaxed),
            self.cumulative.unsupported.load(Ordering::Relaxed),
            self.cumulative.too_large.load(Ordering::Relaxed),
        )
    }
}

#[cfg(feature = "prometheus")]
pub mod prometheus {
    //! A `prometheus-client` registry publishing the cumulative counters in
    //! [`super::Stats`]. The HTTP exposition server itself stays external
    //! (Retina's own `stats::prometheus::serve_req` is the model this would
    //! plug into); this just builds the `Registry`.

    use std::fmt::Write;

    use prometheus_client::encoding::text::encode;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::registry::Registry;

    use super::Stats;

    /// Snapshot of [`Stats`]'s cumulative counters as gauges, plus a
    /// `Registry` wrapping them. Gauges (not counters) because the backing
    /// values are read via relaxed atomics at an arbitrary instant rather
    /// than monotonically incremented by this module itself.
    pub struct StatsRegistry {
        registry: Registry,
        panic_total: Gauge,
        backpressure_drops: Gauge,
        round_trips_emitted: Gauge,
        framing_errors: Gauge,
        unsupported: Gauge,
        too_large: Gauge,
    }

    impl StatsRegistry {
        pub fn new() -> Self {
            let mut registry = Registry::default();
            let panic_total = Gauge::default();
            let backpressure_drops = Gauge::default();
            let round_trips_emitted = Gauge::default();
            let framing_errors = Gauge::default();
            let unsupported = Gauge::default();
            let too_large = Gauge::default();

            registry.register("panic_total", "Threads recovered from a panic.", panic_total.clone());
            registry.register(
                "backpressure_drops",
                "Round trips dropped because the output channel was full.",
                backpressure_drops.clone(),
            );
            registry.register(
                "round_trips_emitted",
                "Round trips successfully matched and emitted.",
                round_trips_emitted.clone(),
            );
            registry.register("decode_errors_framing", "Malformed framing errors.", framing_errors.clone());
            registry.register(
                "decode_errors_unsupported",
                "Unsupported message decode errors.",
                unsupported.clone(),
            );
            registry.register("decode_errors_too_large", "Oversized message decode errors.", too_large.clone());

            StatsRegistry {
                registry,
                panic_total,
                backpressure_drops,
                round_trips_emitted,
                framing_errors,
                unsupported,
                too_large,
            }
        }

        /// Copies the current values out of `stats` into this registry's
        /// gauges. Call before scraping; there is no push path.
        pub fn refresh(&self, stats: &Stats) {
            self.panic_total.set(stats.panic_total() as i64);
            self.backpressure_drops.set(stats.backpressure_drops() as i64);
            self.round_trips_emitted.set(stats.round_trips_emitted() as i64);
            let (framing, unsupported, too_large) = stats.decode_error_counts();
            self.framing_errors.set(framing as i64);
            self.unsupported.set(unsupported as i64);
            self.too_large.set(too_large as i64);
        }

        pub fn encode(&self) -> String {
            let mut buffer = String::new();
            encode(&mut buffer, &self.registry).unwrap();
            buffer
        }
    }

    impl Default for StatsRegistry {
        fn default() -> Self {
            StatsRegistry::new()
        }
    }

    pub async fn serve_req(
        _req: hyper::Request<impl hyper::body::Body>,
        registry: &StatsRegistry,
    ) -> Result<hyper::Response<http_body_util::Full<hyper::body::Bytes>>, hyper::Error> {
        let body = registry.encode();
        let mut out = String::new();
        let _ = write!(out, "{body}");
        let response = hyper::Response::builder()
            .status(200)
            .header(hyper::header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(http_body_util::Full::new(hyper::body::Bytes::from(out)))
            .unwrap();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple() -> Tuple {
        Tuple::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1234, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80)
    }

    #[test]
    fn on_stats_drains_the_table() {
        let stats = Stats::new();
        stats.record_tuple(tuple(), StreamStats { packets: 3, ..Default::default() }, StreamStats::default());
        let snapshot = stats.on_stats();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&tuple()].originator.packets, 3);
        assert!(stats.on_stats().is_empty());
    }

    #[test]
    fn decode_errors_bucket_by_kind() {
        let stats = Stats::new();
        stats.record_decode_error(&DecodeError::Framing("bad".into()));
        stats.record_decode_error(&DecodeError::Unsupported);
        stats.record_decode_error(&DecodeError::Unsupported);
        stats.record_decode_error(&DecodeError::TooLarge);
        assert_eq!(stats.decode_error_counts(), (1, 2, 1));
    }

    #[test]
    fn panic_and_backpressure_counters_accumulate() {
        let stats = Stats::new();
        stats.record_panic();
        stats.record_panic();
        stats.record_backpressure_drop();
        assert_eq!(stats.panic_total(), 2);
        assert_eq!(stats.backpressure_drops(), 1);
    }
}

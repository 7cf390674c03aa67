//! Ties the connection pool, port bindings, and protocol sessions together
//! into the single entry point a capture engine drives: [`Engine::on_l4_packet`].
//!
//! Grounded on Retina's `runtime` module for the overall shape (one
//! per-packet callback installed on an external capture loop) but with the
//! dispatch and worker-pool pieces Retina leaves to its `Subscription`
//! machinery built out here instead: a bounded `crossbeam_channel` carries
//! matched [`RoundTrip`]s from the packet-processing path to a fixed pool of
//! worker threads, which is the "Round-trip dispatcher" role. The periodic
//! expiry sweep is driven the way `conntrack::timerwheel::TimerWheel` drives
//! its own check — a `crossbeam_channel::tick` ticker polled with
//! `try_recv()` from inside the hot path, rather than a dedicated thread —
//! since `Conn`/`ConnPool` borrow packet payloads for their lifetime and so
//! can't safely be handed to a `'static` background thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, tick, Receiver, Sender, TrySendError};

use crate::config::RuntimeConfig;
use crate::conn::ConnError;
use crate::pool::{ConnPool, PortBindings};
use crate::roundtrip::RoundTrip;
use crate::session::{Session, SessionConfig};
use crate::stats::Stats;
use crate::tuple::L4Packet;

/// Owns the connection table, the round-trip output channel, and the worker
/// pool draining it. `'a` is the lifetime of the packet payloads the capture
/// engine hands in via [`Engine::on_l4_packet`]; every `Conn` borrows into
/// those payloads for as long as its reassembly buffers are live.
pub struct Engine<'a> {
    config: RuntimeConfig,
    bindings: PortBindings,
    pool: ConnPool<'a>,
    sender: Sender<RoundTrip>,
    stats: Arc<Stats>,
    expiry_ticker: Receiver<Instant>,
    cancelled: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl<'a> Engine<'a> {
    /// Builds an engine from `config` and spawns its worker pool. Every
    /// completed round trip drained off the channel is handed to
    /// `on_round_trip`, which plays the "fan out to exporters/processors"
    /// role the dispatcher doesn't implement itself; a panic inside it is
    /// caught, counted in `panic_total`, and logged rather than taking down
    /// the worker thread.
    pub fn new<F>(config: RuntimeConfig, on_round_trip: F) -> Self
    where
        F: Fn(RoundTrip) + Send + Sync + 'static,
    {
        let mut bindings = PortBindings::new();
        for binding in &config.protocols {
            for &port in &binding.ports {
                bindings.bind(port, binding.protocol);
            }
        }

        let worker_concurrency = config.conntrack.worker_concurrency.max(1);
        let (sender, receiver) = bounded::<RoundTrip>(worker_concurrency);
        let stats = Arc::new(Stats::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let on_round_trip = Arc::new(on_round_trip);

        let mut worker_handles = Vec::with_capacity(worker_concurrency);
        for _ in 0..worker_concurrency {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            let handler = Arc::clone(&on_round_trip);
            worker_handles.push(std::thread::spawn(move || {
                for round_trip in receiver.iter() {
                    let result = catch_unwind(AssertUnwindSafe(|| (*handler)(round_trip)));
                    if result.is_err() {
                        stats.record_panic();
                        log::error!(target: "engine", "round-trip handler panicked, recovering");
                    }
                }
            }));
        }

        let expiry_ticker = tick(config.conntrack.expiry_interval());
        let pool = ConnPool::new(config.conntrack.expiry(), config.conntrack.frozen_ttl());

        Engine { config, bindings, pool, sender, stats, expiry_ticker, cancelled, worker_handles }
    }

    /// The per-packet entry point a capture engine installs. Looks up (or
    /// creates) the owning connection, binds a protocol session to it on
    /// first sight, decodes and matches, and pushes any completed round trip
    /// onto the bounded channel — dropping it and counting a backpressure
    /// miss if the channel is full, per the explicit "drop the new" policy,
    /// rather than blocking the capture callback.
    ///
    /// Ignored once [`Engine::shutdown`] has been called.
    pub fn on_l4_packet(&self, pkt: &L4Packet<'a>) -> Result<(), ConnError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.expiry_ticker.try_recv().is_ok() {
            self.pool.remove_expired(pkt.arrival);
        }

        let resolved = self.bindings.decide_proto(pkt.tuple.src_port, pkt.tuple.dst_port);
        let server_port = resolved.map(|(port, _)| port);

        let Some(handle) = self.pool.get_or_create(pkt.tuple, server_port, pkt.arrival) else {
            return Ok(());
        };
        let mut conn = handle.lock().unwrap();
        let config = &self.config;
        conn.ensure_session(|| {
            let (_, proto) = resolved?;
            let session_cfg = SessionConfig {
                http: &config.http,
                http2: &config.http2,
                mongodb_enable_response_code: config.mongodb.enable_response_code,
                list_cap_http2: config.matchers.list_cap_http2,
                list_cap_keyed: config.matchers.list_cap_keyed,
                fuzzy_cap: config.matchers.fuzzy_cap,
            };
            Session::new(proto, pkt.protocol, &session_cfg)
        });

        let sender = &self.sender;
        let stats = &self.stats;
        conn.process(
            pkt,
            |round_trip| match sender.try_send(round_trip) {
                Ok(()) => stats.record_round_trip_emitted(),
                Err(TrySendError::Full(_)) => stats.record_backpressure_drop(),
                Err(TrySendError::Disconnected(_)) => {}
            },
            |err| stats.record_decode_error(&err),
        )?;

        let (originator, responder) = conn.take_stats();
        stats.record_tuple(conn.orig_tuple(), originator, responder);
        Ok(())
    }

    /// Replaces the port→protocol binding table, returning the ports whose
    /// assignment changed. Live connections already bound to a session are
    /// left alone; only future `get_or_create` misses see the new table.
    pub fn reload_bindings(&mut self, new_bindings: PortBindings) -> Vec<u16> {
        self.bindings.reload(new_bindings)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Signals cancellation: `on_l4_packet` becomes a no-op, the channel is
    /// closed, and every worker thread is joined once it has drained
    /// whatever round trips were already queued.
    pub fn shutdown(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let Engine { sender, worker_handles, .. } = self;
        drop(sender);
        for handle in worker_handles {
            let _ = handle.join();
        }
    }
}

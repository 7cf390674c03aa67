//! A bidirectional connection: two [`Stream`]s keyed by the tuple's original
//! direction, plus the connection-level metadata the matcher and decoder
//! registries need.
//!
//! Grounded on `conntrack::conn::ConnInfo`'s originator/responder split:
//! Retina keeps one `TcpConn`/`UdpConn` state machine per half and tags each
//! with a `Direction`, which we mirror with `Originator`/`Responder`.

use std::time::Instant;

use thiserror::Error;

use crate::roundtrip::RoundTrip;
use crate::session::Session;
use crate::stream::{Stream, StreamStats};
use crate::tuple::{L4Packet, Tuple};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    #[error("packet tuple does not belong to this connection")]
    SocketMismatch,
}

/// Which side of the connection a packet's tuple matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The tuple that opened the connection (or, for UDP, sent first).
    Originator,
    /// The mirror of the originator's tuple.
    Responder,
}

/// Owns both directions of one connection, identified by the originator's
/// [`Tuple`]. Mutation is single-threaded per connection: callers (the pool's
/// packet-processing path) must serialize access to a given `Conn`.
pub struct Conn<'a> {
    orig_tuple: Tuple,
    originator: Stream<'a>,
    responder: Stream<'a>,
    created_at: Instant,
    /// The port identified as the server side by `decide_proto`'s port-binding
    /// lookup, if any. Drives each packet's `is_client` determination in
    /// `process` — `None` for traffic on an unrecognized port, which still
    /// gets reassembled (for stats) but never decoded.
    server_port: Option<u16>,
    /// The bound protocol decoder/matcher, once `decide_proto` has resolved
    /// one for this connection's tuple. `None` for unrecognized traffic —
    /// bytes are still reassembled (for stats) but never decoded.
    session: Option<Session>,
}

impl<'a> Conn<'a> {
    pub fn new(orig_tuple: Tuple, server_port: Option<u16>, now: Instant) -> Self {
        Conn {
            orig_tuple,
            originator: Stream::new(now),
            responder: Stream::new(now),
            created_at: now,
            server_port,
            session: None,
        }
    }

    /// Binds a protocol session to this connection if one isn't already
    /// bound. A no-op on repeat calls, so callers can invoke it on every
    /// packet without re-resolving the protocol each time.
    pub fn ensure_session(&mut self, make: impl FnOnce() -> Option<Session>) {
        if self.session.is_none() {
            self.session = make();
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Routes `pkt` to the appropriate direction's stream, decoding and
    /// matching through the bound session (if any) and handing completed
    /// round trips to `emit`. Connections with no bound session just
    /// reassemble bytes for stats purposes. A pair whose response timestamp
    /// doesn't strictly follow its request (clock skew, replayed capture) is
    /// dropped rather than handed to `emit` with a bogus duration.
    pub fn process(
        &mut self,
        pkt: &L4Packet<'a>,
        mut emit: impl FnMut(RoundTrip),
        mut on_decode_error: impl FnMut(crate::protocols::DecodeError),
    ) -> Result<(), ConnError> {
        let direction = self.direction_of(pkt.tuple)?;
        let orig_tuple = self.orig_tuple;
        let is_client = match self.server_port {
            Some(server_port) => pkt.tuple.dst_port == server_port,
            None => direction == Direction::Originator,
        };
        let stream = match direction {
            Direction::Originator => &mut self.originator,
            Direction::Responder => &mut self.responder,
        };
        let session = &mut self.session;
        let _ = stream.write(pkt, |buf, ts| {
            if let Some(session) = session.as_mut() {
                let result = session.decode_and_match(direction, is_client, buf, ts, &mut |req_time, resp_time, payload| {
                    match RoundTrip::from_timestamps(orig_tuple, payload, req_time, resp_time) {
                        Ok(round_trip) => emit(round_trip),
                        Err(_) => log::debug!(target: "conn", "dropped round trip on {orig_tuple}: non-positive duration"),
                    }
                });
                if let Err(e) = result {
                    log::debug!(target: "conn", "decode error on {}: {e}", pkt.tuple);
                    on_decode_error(e);
                }
            }
        });
        Ok(())
    }

    pub fn orig_tuple(&self) -> Tuple {
        self.orig_tuple
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Determines which stream a packet's tuple belongs to.
    pub fn direction_of(&self, tuple: Tuple) -> Result<Direction, ConnError> {
        if tuple.src_ip == self.orig_tuple.src_ip
            && tuple.src_port == self.orig_tuple.src_port
            && tuple.dst_ip == self.orig_tuple.dst_ip
            && tuple.dst_port == self.orig_tuple.dst_port
        {
            Ok(Direction::Originator)
        } else if tuple == self.orig_tuple.mirror() {
            Ok(Direction::Responder)
        } else {
            Err(ConnError::SocketMismatch)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.originator.is_closed() && self.responder.is_closed()
    }

    pub fn last_active(&self) -> Instant {
        self.originator.active_at().max(self.responder.active_at())
    }

    pub fn take_stats(&mut self) -> (StreamStats, StreamStats) {
        (self.originator.take_stats(), self.responder.take_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http1::Http1Decoder;
    use crate::roundtrip::RoundTripPayload;
    use crate::session::Session;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(o: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, o))
    }

    fn http1_session() -> Session {
        Session::Http1 {
            decoder: Http1Decoder::new(false, 1024),
            matcher: crate::matcher::SingleMatcher::new(),
        }
    }

    #[test]
    fn process_routes_each_direction_through_its_own_stream_and_matches_roundtrips() {
        // The connection's originator tuple is the server side (port 80 as
        // destination belongs to the client's first packet): server_port
        // picks out the server regardless of which tuple opened the flow.
        let t = Tuple::new(addr(1), 54321, addr(2), 80);
        let mut conn = Conn::new(t, Some(80), Instant::now());
        conn.ensure_session(|| Some(http1_session()));
        let now = Instant::now();
        let mut out = Vec::new();

        let req = L4Packet::new_tcp(now, t, b"GET / HTTP/1.1\r\n\r\n", 0, false);
        conn.process(&req, |rt| out.push(rt), |_| {}).unwrap();
        assert!(out.is_empty());

        let resp = L4Packet::new_tcp(
            now + std::time::Duration::from_millis(1),
            t.mirror(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            0,
            false,
        );
        conn.process(&resp, |rt| out.push(rt), |_| {}).unwrap();

        assert_eq!(out.len(), 1);
        match &out[0].proto {
            RoundTripPayload::Http1 { request, response } => {
                assert_eq!(request.method, "GET");
                assert_eq!(response.status, 200);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unbound_connection_falls_back_to_originator_as_client() {
        let t = Tuple::new(addr(1), 1234, addr(2), 9999);
        let mut conn = Conn::new(t, None, Instant::now());
        let pkt = L4Packet::new_tcp(Instant::now(), t, b"x", 0, false);
        // No session bound; process must not error even without server_port.
        conn.process(&pkt, |_| {}, |_| {}).unwrap();
    }

    #[test]
    fn foreign_tuple_is_rejected() {
        let t = Tuple::new(addr(1), 1234, addr(2), 80);
        let mut conn = Conn::new(t, Some(80), Instant::now());
        let other = Tuple::new(addr(3), 5555, addr(4), 443);
        let pkt = L4Packet::new_tcp(Instant::now(), other, b"x", 0, false);
        assert_eq!(
            conn.process(&pkt, |_| {}, |_| {}),
            Err(ConnError::SocketMismatch)
        );
    }
}

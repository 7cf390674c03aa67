//! One directional byte stream for a single connection direction.
//!
//! Grounded on the sequence-number bookkeeping of Retina's
//! `conntrack::conn::tcp_conn::reassembly::TcpFlow`, simplified here: no
//! out-of-order buffer is kept (a gap is accepted and the stream simply joins
//! mid-data), matching the explicit Non-goal "no out-of-order reassembly
//! beyond next-expected-sequence advancement".

use std::time::Instant;

use thiserror::Error;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::scan::{crlf_safe_cut, BLOCK};
use crate::tuple::L4Packet;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
}

/// Per-direction packet/byte counters, reset on read by the layer-4 stats sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub inserted: u64,
}

/// A single TCP/UDP direction's reassembled byte stream.
pub struct Stream<'a> {
    /// Next byte offset expected (0 initially; TCP only — ignored for UDP).
    last_seq_end: u64,
    closed: bool,
    active_at: Instant,
    buffer: ZeroCopyBuffer<'a>,
    stats: StreamStats,
}

impl<'a> Stream<'a> {
    pub fn new(now: Instant) -> Self {
        Stream {
            last_seq_end: 0,
            closed: false,
            active_at: now,
            buffer: ZeroCopyBuffer::new(),
            stats: StreamStats::default(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn active_at(&self) -> Instant {
        self.active_at
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Resets per-read counters, returning the previous values. Matches the
    /// "reading resets counters" contract of `on_stats`.
    pub fn take_stats(&mut self) -> StreamStats {
        std::mem::take(&mut self.stats)
    }

    /// Absorbs one packet belonging to this direction, invoking `decode_fn`
    /// once per CRLF-safe chunk appended to the buffer.
    pub fn write<F>(&mut self, pkt: &L4Packet<'a>, mut decode_fn: F) -> Result<(), StreamError>
    where
        F: FnMut(&mut ZeroCopyBuffer<'a>, Instant),
    {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.active_at = pkt.arrival;
        self.stats.packets += 1;

        match pkt.protocol {
            crate::tuple::L4Protocol::Udp => {
                if !pkt.payload.is_empty() {
                    self.buffer.write(pkt.payload);
                    self.stats.bytes += pkt.payload.len() as u64;
                    self.stats.inserted += 1;
                    decode_fn(&mut self.buffer, pkt.arrival);
                }
                self.closed = true;
                self.buffer.close();
                return Err(StreamError::Closed);
            }
            crate::tuple::L4Protocol::Tcp => {}
        }

        if pkt.payload.is_empty() {
            if pkt.fin {
                self.close();
            }
            return Ok(());
        }

        let seq = pkt.seq as u64;
        let mut n = seq + pkt.payload.len() as u64;
        // Sequence wrap: treat as a restart of the counting space. `n` is one
        // past the last byte, so `1 << 32` itself (seq space exhausted
        // exactly) is the first wrapped value, not `u32::MAX`.
        if n > u32::MAX as u64 {
            self.last_seq_end = 0;
            n -= 1u64 << 32;
        }

        let mut payload = pkt.payload;
        if self.last_seq_end >= n {
            // Duplicate / retransmit.
            self.stats.skipped += 1;
            if pkt.fin {
                self.close();
            }
            return Ok(());
        } else if self.last_seq_end > seq {
            // Partial overlap: drop the already-seen prefix.
            let delta = (self.last_seq_end - seq) as usize;
            payload = &payload[delta.min(payload.len())..];
        }
        // `self.last_seq_end < seq`: a gap. We don't buffer; just join here.

        self.append_in_chunks(payload, pkt.arrival, &mut decode_fn);
        self.stats.bytes += payload.len() as u64;
        self.stats.inserted += 1;
        self.last_seq_end = n;

        if pkt.fin {
            self.close();
        }
        Ok(())
    }

    fn append_in_chunks<F>(&mut self, mut payload: &'a [u8], ts: Instant, decode_fn: &mut F)
    where
        F: FnMut(&mut ZeroCopyBuffer<'a>, Instant),
    {
        while !payload.is_empty() {
            let cut = crlf_safe_cut(payload, BLOCK.min(payload.len()));
            let (chunk, rest) = payload.split_at(cut.max(1).min(payload.len()));
            self.buffer.write(chunk);
            decode_fn(&mut self.buffer, ts);
            payload = rest;
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self) -> &mut ZeroCopyBuffer<'a> {
        &mut self.buffer
    }
}

#[allow(dead_code)]
fn _assert_eof_variant_used() -> BufferError {
    BufferError::Eof
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{L4Packet, Tuple};
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
    fn retransmit_is_skipped_and_dedup_decoded_once() {
        let mut stream = Stream::new(Instant::now());
        let mut decoded = Vec::new();
        let now = Instant::now();

        let p1 = L4Packet::new_tcp(now, tuple(), b"abc", 0, false);
        stream.write(&p1, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                decoded.extend_from_slice(s);
            }
        }).unwrap();

        let p2 = L4Packet::new_tcp(now, tuple(), b"def", 3, false);
        stream.write(&p2, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                decoded.extend_from_slice(s);
            }
        }).unwrap();

        // Duplicate of the second segment.
        let p3 = L4Packet::new_tcp(now, tuple(), b"def", 3, false);
        stream.write(&p3, |_buf, _| {}).unwrap();

        assert_eq!(decoded, b"abcdef");
        assert_eq!(stream.stats().skipped, 1);
        assert_eq!(stream.stats().bytes, 6);
    }

    #[test]
    fn fin_closes_stream_and_rejects_further_writes() {
        let mut stream = Stream::new(Instant::now());
        let now = Instant::now();
        let p1 = L4Packet::new_tcp(now, tuple(), b"bye", 0, true);
        stream.write(&p1, |_buf, _| {}).unwrap();
        assert!(stream.is_closed());

        let p2 = L4Packet::new_tcp(now, tuple(), b"late", 3, false);
        assert_eq!(stream.write(&p2, |_buf, _| {}), Err(StreamError::Closed));
    }

    #[test]
    fn udp_closes_after_single_datagram() {
        let mut stream = Stream::new(Instant::now());
        let now = Instant::now();
        let pkt = L4Packet::new_udp(now, tuple(), b"hello");
        let mut seen = false;
        let result = stream.write(&pkt, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                seen |= s == b"hello";
            }
        });
        assert_eq!(result, Err(StreamError::Closed));
        assert!(seen);
        assert!(stream.is_closed());
    }

    #[test]
    fn gap_does_not_block_progress() {
        let mut stream = Stream::new(Instant::now());
        let mut decoded = Vec::new();
        let now = Instant::now();
        let p1 = L4Packet::new_tcp(now, tuple(), b"abc", 0, false);
        stream.write(&p1, |_b, _| {}).unwrap();
        // Skip bytes [3,10): simulate a lost packet, then resume at seq 10.
        let p2 = L4Packet::new_tcp(now, tuple(), b"resumed", 10, false);
        stream.write(&p2, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                decoded.extend_from_slice(s);
            }
        }).unwrap();
        assert_eq!(decoded, b"resumed");
    }
}

//! Flow identifiers and the layer-4 packet model.
//!
//! Adapted from the connection-identifier shape of `conntrack::conn_id` in
//! Retina: an ordered 4-tuple carried by each packet, plus a
//! direction-agnostic identifier used to key the connection table.

use std::net::IpAddr;
use std::time::Instant;

use serde::Serialize;

/// An immutable layer-4 4-tuple.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub struct Tuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl Tuple {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Tuple {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// Returns the reversed tuple (swaps source and destination).
    #[inline]
    pub fn mirror(&self) -> Tuple {
        Tuple {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// A key identifying a flow independent of direction: the unordered pair
/// `{tuple, tuple.mirror}`. Two tuples that are mirrors of each other produce
/// an equal `FlowKey`.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FlowKey(Tuple, Tuple);

impl FlowKey {
    pub fn new(tuple: Tuple) -> Self {
        let mirror = tuple.mirror();
        // Canonicalize by a total order so `new(t) == new(t.mirror())`.
        if (tuple.src_ip, tuple.src_port, tuple.dst_ip, tuple.dst_port)
            <= (mirror.src_ip, mirror.src_port, mirror.dst_ip, mirror.dst_port)
        {
            FlowKey(tuple, mirror)
        } else {
            FlowKey(mirror, tuple)
        }
    }
}

// `IpAddr` doesn't implement `Ord` the way we need for a tuple comparison
// above without importing it; implement the ordering locally.
impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.src_ip, self.src_port, self.dst_ip, self.dst_port).cmp(&(
            other.src_ip,
            other.src_port,
            other.dst_ip,
            other.dst_port,
        ))
    }
}

/// Transport-layer protocol, used to select reassembly semantics.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

/// A single layer-4 protocol data unit as delivered by the capture engine.
///
/// The payload is borrowed: it must remain valid for at least the duration of
/// the `on_l4_packet` callback that produced it.
#[derive(Debug)]
pub struct L4Packet<'a> {
    pub arrival: Instant,
    pub tuple: Tuple,
    pub payload: &'a [u8],
    /// TCP-only: the raw sequence number of the first payload byte.
    pub seq: u32,
    /// TCP-only: whether the FIN flag is set.
    pub fin: bool,
    pub protocol: L4Protocol,
}

impl<'a> L4Packet<'a> {
    pub fn new_tcp(arrival: Instant, tuple: Tuple, payload: &'a [u8], seq: u32, fin: bool) -> Self {
        L4Packet {
            arrival,
            tuple,
            payload,
            seq,
            fin,
            protocol: L4Protocol::Tcp,
        }
    }

    pub fn new_udp(arrival: Instant, tuple: Tuple, payload: &'a [u8]) -> Self {
        L4Packet {
            arrival,
            tuple,
            payload,
            seq: 0,
            fin: false,
            protocol: L4Protocol::Udp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(o: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, o))
    }

    #[test]
    fn mirror_is_involution() {
        let t = Tuple::new(addr(1), 1234, addr(2), 80);
        assert_eq!(t.mirror().mirror(), t);
        assert_ne!(t.mirror(), t);
    }

    #[test]
    fn flow_key_is_direction_agnostic() {
        let t = Tuple::new(addr(1), 1234, addr(2), 80);
        assert_eq!(FlowKey::new(t), FlowKey::new(t.mirror()));

        let other = Tuple::new(addr(1), 1234, addr(2), 81);
        assert_ne!(FlowKey::new(t), FlowKey::new(other));
    }
}

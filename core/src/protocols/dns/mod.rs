//! DNS query/response decoding over UDP (single datagram) and TCP (2-byte
//! length-prefixed messages).
//!
//! Ported from `core/src/protocols/stream/dns/{parser,transaction}.rs`: same
//! `dns-parser` crate and transaction-id pairing shape. TCP framing is added
//! here since Retina's DNS decoder only ever sees UDP/QUIC datagrams.

mod transaction;

pub use transaction::{DnsMessage, DnsQuestion};

use std::time::Instant;

use log::warn;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};

pub struct DnsDecoder {
    tcp: bool,
    scratch: Vec<u8>,
}

impl DnsDecoder {
    pub fn new_udp() -> Self {
        DnsDecoder { tcp: false, scratch: Vec::new() }
    }

    pub fn new_tcp() -> Self {
        DnsDecoder { tcp: true, scratch: Vec::new() }
    }

    fn decode_one(raw: &[u8], now: Instant) -> Option<DecodedObject<DnsMessage>> {
        match dns_parser::Packet::parse(raw) {
            Ok(packet) => {
                let role = if packet.header.query { Role::Request } else { Role::Response };
                Some(DecodedObject {
                    role,
                    timestamp: now,
                    payload: DnsMessage::from_packet(&packet),
                })
            }
            Err(e) => {
                warn!(target: "dns", "dropping unparseable datagram: {e}");
                None
            }
        }
    }
}

impl Decoder for DnsDecoder {
    type Object = DnsMessage;

    fn decode(
        &mut self,
        _direction: Direction,
        _is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<DnsMessage>>, DecodeError> {
        let mut out = Vec::new();
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => break,
                Ok(slice) => self.scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => break,
            }
        }

        if !self.tcp {
            if !self.scratch.is_empty() {
                if let Some(obj) = Self::decode_one(&self.scratch, now) {
                    out.push(obj);
                }
                self.scratch.clear();
            }
            return Ok(out);
        }

        loop {
            if self.scratch.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]) as usize;
            if self.scratch.len() < 2 + len {
                break;
            }
            let msg = &self.scratch[2..2 + len];
            if let Some(obj) = Self::decode_one(msg, now) {
                out.push(obj);
            }
            self.scratch.drain(..2 + len);
        }
        Ok(out)
    }
}

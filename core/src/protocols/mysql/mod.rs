//! MySQL client/server protocol framing: a 3-byte little-endian length plus
//! sequence id around each packet, with a small state machine on the
//! response side to count (not materialize) multi-packet result sets.
//!
//! Packet framing and length-encoded-integer layout grounded on
//! `other_examples/fc4cee30_elbaro-zero-mysql__src-sync-mod.rs.rs`'s
//! `read_payload`/`write_payload` (3-byte LE length, 1-byte sequence id,
//! 0xFFFFFF-length continuation chunks) and
//! `other_examples/9cbc3a08_elbaro-zero-mysql__src-async-conn.rs.rs`.

mod transaction;

pub use transaction::MysqlMessage;

use std::time::Instant;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};
use transaction::COM_QUERY;

const MAX_PACKET: usize = 0xFF_FFFF;

fn read_lenenc_int(buf: &[u8], pos: &mut usize) -> Option<Option<u64>> {
    let b0 = *buf.get(*pos)?;
    *pos += 1;
    match b0 {
        0xfb => Some(None),
        0xfc => {
            let b = buf.get(*pos..*pos + 2)?;
            *pos += 2;
            Some(Some(u16::from_le_bytes([b[0], b[1]]) as u64))
        }
        0xfd => {
            let b = buf.get(*pos..*pos + 3)?;
            *pos += 3;
            Some(Some(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64))
        }
        0xfe => {
            let b = buf.get(*pos..*pos + 8)?;
            *pos += 8;
            Some(Some(u64::from_le_bytes(b.try_into().ok()?)))
        }
        v => Some(Some(v as u64)),
    }
}

fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

#[derive(Clone, Copy)]
enum RespState {
    Idle,
    ColumnDefs { remaining: u64, column_count: u64 },
    ColumnsEof { column_count: u64 },
    Rows { column_count: u64, row_count: u64 },
}

pub struct MysqlDecoder {
    /// Keyed by client/server role (not physical TCP direction): whichever
    /// side `is_client` resolves to always feeds `req_scratch`.
    req_scratch: Vec<u8>,
    resp_scratch: Vec<u8>,
    req_partial: Vec<u8>,
    resp_state: RespState,
}

impl MysqlDecoder {
    pub fn new() -> Self {
        MysqlDecoder {
            req_scratch: Vec::new(),
            resp_scratch: Vec::new(),
            req_partial: Vec::new(),
            resp_state: RespState::Idle,
        }
    }

    fn feed(scratch: &mut Vec<u8>, buf: &mut ZeroCopyBuffer<'_>) {
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => break,
                Ok(slice) => scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => break,
            }
        }
    }

    /// Pulls one complete `(length, payload)` framed packet off the front of
    /// `scratch`, if a full one is buffered.
    fn take_packet(scratch: &mut Vec<u8>) -> Option<Vec<u8>> {
        if scratch.len() < 4 {
            return None;
        }
        let length = u32::from_le_bytes([scratch[0], scratch[1], scratch[2], 0]) as usize;
        let total = 4 + length;
        if scratch.len() < total {
            return None;
        }
        let payload = scratch[4..total].to_vec();
        scratch.drain(..total);
        Some(payload)
    }

    fn decode_request(
        &mut self,
        now: Instant,
        out: &mut Vec<DecodedObject<MysqlMessage>>,
    ) {
        while let Some(payload) = Self::take_packet(&mut self.req_scratch) {
            let continuation = payload.len() == MAX_PACKET;
            self.req_partial.extend_from_slice(&payload);
            if continuation {
                continue;
            }
            let logical = std::mem::take(&mut self.req_partial);
            if logical.is_empty() {
                continue;
            }
            let command_byte = logical[0];
            let query = if command_byte == COM_QUERY {
                Some(String::from_utf8_lossy(&logical[1..]).into_owned())
            } else {
                None
            };
            out.push(DecodedObject {
                role: Role::Request,
                timestamp: now,
                payload: MysqlMessage::Command { command_byte, query },
            });
        }
    }

    fn decode_response(
        &mut self,
        now: Instant,
        out: &mut Vec<DecodedObject<MysqlMessage>>,
    ) -> Result<(), DecodeError> {
        while let Some(payload) = Self::take_packet(&mut self.resp_scratch) {
            self.handle_response_packet(&payload, now, out)?;
        }
        Ok(())
    }

    fn handle_response_packet(
        &mut self,
        payload: &[u8],
        now: Instant,
        out: &mut Vec<DecodedObject<MysqlMessage>>,
    ) -> Result<(), DecodeError> {
        let b0 = match payload.first() {
            Some(b) => *b,
            None => return Ok(()),
        };

        // Copy the current state out so transitions below can reassign
        // `self.resp_state` freely without fighting the borrow checker.
        match self.resp_state {
            RespState::Idle => {
                if b0 == 0x00 {
                    self.emit_response(MysqlMessage::Ok, now, out);
                } else if b0 == 0xFF {
                    let code = payload.get(1..3).map(|b| u16::from_le_bytes([b[0], b[1]])).unwrap_or(0);
                    let (sql_state, message) = if payload.get(3) == Some(&b'#') && payload.len() >= 9 {
                        (
                            String::from_utf8_lossy(&payload[4..9]).into_owned(),
                            String::from_utf8_lossy(&payload[9..]).into_owned(),
                        )
                    } else {
                        (String::new(), String::from_utf8_lossy(payload.get(3..).unwrap_or(&[])).into_owned())
                    };
                    self.emit_response(MysqlMessage::Error { code, sql_state, message }, now, out);
                } else if is_eof_packet(payload) {
                    self.emit_response(MysqlMessage::Eof, now, out);
                } else if b0 == 0xFB {
                    self.emit_response(MysqlMessage::LocalInfile, now, out);
                } else if b0 == 0x01 {
                    self.emit_response(MysqlMessage::AuthSwitch, now, out);
                } else {
                    let mut pos = 0;
                    match read_lenenc_int(payload, &mut pos) {
                        Some(Some(column_count)) if column_count > 0 => {
                            self.resp_state =
                                RespState::ColumnDefs { remaining: column_count, column_count };
                        }
                        _ => {
                            return Err(DecodeError::Framing("unrecognized response packet".into()));
                        }
                    }
                }
            }
            RespState::ColumnDefs { remaining, column_count } => {
                self.resp_state = if remaining <= 1 {
                    RespState::ColumnsEof { column_count }
                } else {
                    RespState::ColumnDefs { remaining: remaining - 1, column_count }
                };
            }
            RespState::ColumnsEof { column_count } => {
                if is_eof_packet(payload) {
                    self.resp_state = RespState::Rows { column_count, row_count: 0 };
                } else {
                    self.resp_state = RespState::Idle;
                    return Err(DecodeError::Framing("expected EOF after column definitions".into()));
                }
            }
            RespState::Rows { column_count, row_count } => {
                if is_eof_packet(payload) {
                    let msg = MysqlMessage::ResultSet { column_count, row_count };
                    self.resp_state = RespState::Idle;
                    self.emit_response(msg, now, out);
                } else {
                    self.resp_state = RespState::Rows { column_count, row_count: row_count + 1 };
                }
            }
        }
        Ok(())
    }

    fn emit_response(
        &self,
        payload: MysqlMessage,
        now: Instant,
        out: &mut Vec<DecodedObject<MysqlMessage>>,
    ) {
        out.push(DecodedObject { role: Role::Response, timestamp: now, payload });
    }
}

impl Default for MysqlDecoder {
    fn default() -> Self {
        MysqlDecoder::new()
    }
}

impl Decoder for MysqlDecoder {
    type Object = MysqlMessage;

    fn decode(
        &mut self,
        _direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<MysqlMessage>>, DecodeError> {
        let mut out = Vec::new();
        if is_client {
            Self::feed(&mut self.req_scratch, buf);
            self.decode_request(now, &mut out);
        } else {
            Self::feed(&mut self.resp_scratch, buf);
            self.decode_response(now, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = payload.len() as u32;
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        out.push(0);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn com_query_request_extracts_sql_text() {
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(b"SELECT 1");
        let framed = packet(&payload);

        let mut decoder = MysqlDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&framed);
        let out = decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            MysqlMessage::Command { query, .. } => assert_eq!(query.as_deref(), Some("SELECT 1")),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ok_packet_emits_ok_response() {
        let framed = packet(&[0x00, 0, 0, 2, 0, 0, 0]);
        let mut decoder = MysqlDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&framed);
        let out = decoder.decode(Direction::Responder, false, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].payload, MysqlMessage::Ok));
    }

    #[test]
    fn result_set_counts_rows_without_materializing() {
        let mut decoder = MysqlDecoder::new();
        let mut frames = Vec::new();
        frames.extend(packet(&[0x02])); // 2 columns
        frames.extend(packet(b"coldef-a"));
        frames.extend(packet(b"coldef-b"));
        frames.extend(packet(&[0xFE, 0, 0, 2, 0])); // columns EOF
        frames.extend(packet(b"row-1"));
        frames.extend(packet(b"row-2"));
        frames.extend(packet(&[0xFE, 0, 0, 2, 0])); // final EOF

        let mut buf = ZeroCopyBuffer::new();
        buf.write(&frames);
        let out = decoder.decode(Direction::Responder, false, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            MysqlMessage::ResultSet { column_count, row_count } => {
                assert_eq!(*column_count, 2);
                assert_eq!(*row_count, 2);
            }
            _ => panic!("wrong variant"),
        }
    }
}

//! PostgreSQL frontend/backend message framing: 1-byte tag + 4-byte length
//! (the startup message is the sole exception, carrying no tag), plus a
//! small LRU of named prepared statements so an `Execute` can be correlated
//! back to the SQL text it runs.
//!
//! No teacher or pack example speaks this protocol; framing follows the
//! same scratch-accumulate-and-drain idiom used throughout this crate.
//! The prepared-statement cache reuses `hashlink::LruCache`, already a
//! teacher dependency (`core/src/conntrack/mod.rs` uses `hashlink` for its
//! connection table).

mod transaction;

pub use transaction::PostgresMessage;

use std::collections::HashMap;
use std::time::Instant;

use hashlink::LruCache;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};

const STATEMENT_CACHE_CAP: usize = 8;

fn read_cstring(buf: &[u8], pos: &mut usize) -> Option<String> {
    let start = *pos;
    let nul = buf.get(start..)?.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[start..start + nul]).into_owned();
    *pos = start + nul + 1;
    Some(s)
}

pub struct PostgresDecoder {
    req_scratch: Vec<u8>,
    resp_scratch: Vec<u8>,
    startup_done: bool,
    portal_to_statement: HashMap<String, String>,
    statement_cache: LruCache<String, String>,
}

impl PostgresDecoder {
    pub fn new() -> Self {
        PostgresDecoder {
            req_scratch: Vec::new(),
            resp_scratch: Vec::new(),
            startup_done: false,
            portal_to_statement: HashMap::new(),
            statement_cache: LruCache::new(STATEMENT_CACHE_CAP),
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

    fn decode_startup(&mut self, now: Instant, out: &mut Vec<DecodedObject<PostgresMessage>>) -> bool {
        if self.req_scratch.len() < 4 {
            return false;
        }
        let length = i32::from_be_bytes(self.req_scratch[0..4].try_into().unwrap()) as usize;
        if length < 4 || self.req_scratch.len() < length {
            return false;
        }
        let body = self.req_scratch[4..length].to_vec();
        self.req_scratch.drain(..length);
        self.startup_done = true;

        let mut pos = 4usize.min(body.len()); // skip the 4-byte protocol version
        let mut params = Vec::new();
        while let Some(key) = read_cstring(&body, &mut pos) {
            if key.is_empty() {
                break;
            }
            let value = read_cstring(&body, &mut pos).unwrap_or_default();
            params.push((key, value));
        }
        out.push(DecodedObject {
            role: Role::Request,
            timestamp: now,
            payload: PostgresMessage::Startup { params },
        });
        true
    }

    fn decode_request(&mut self, now: Instant, out: &mut Vec<DecodedObject<PostgresMessage>>) {
        if !self.startup_done && !self.decode_startup(now, out) {
            return;
        }
        loop {
            if self.req_scratch.len() < 5 {
                break;
            }
            let tag = self.req_scratch[0];
            let length = i32::from_be_bytes(self.req_scratch[1..5].try_into().unwrap()) as usize;
            let total = 1 + length;
            if length < 4 || self.req_scratch.len() < total {
                break;
            }
            let body = self.req_scratch[5..total].to_vec();
            self.req_scratch.drain(..total);

            let msg = match tag {
                b'Q' => {
                    let mut pos = 0;
                    let sql = read_cstring(&body, &mut pos).unwrap_or_default();
                    Some(PostgresMessage::Query { sql })
                }
                b'P' => {
                    let mut pos = 0;
                    let statement = read_cstring(&body, &mut pos).unwrap_or_default();
                    let sql = read_cstring(&body, &mut pos).unwrap_or_default();
                    self.statement_cache.insert(statement.clone(), sql.clone());
                    Some(PostgresMessage::Parse { statement, sql })
                }
                b'B' => {
                    let mut pos = 0;
                    let portal = read_cstring(&body, &mut pos).unwrap_or_default();
                    let statement = read_cstring(&body, &mut pos).unwrap_or_default();
                    self.portal_to_statement.insert(portal.clone(), statement.clone());
                    Some(PostgresMessage::Bind { portal, statement })
                }
                b'E' => {
                    let mut pos = 0;
                    let portal = read_cstring(&body, &mut pos).unwrap_or_default();
                    let statement = self.portal_to_statement.get(&portal).cloned();
                    let sql = statement.and_then(|stmt| self.statement_cache.get(&stmt).cloned());
                    Some(PostgresMessage::Execute { portal, sql })
                }
                _ => Some(PostgresMessage::Other { tag }),
            };
            if let Some(payload) = msg {
                out.push(DecodedObject { role: Role::Request, timestamp: now, payload });
            }
        }
    }

    fn decode_response(
        &mut self,
        now: Instant,
        out: &mut Vec<DecodedObject<PostgresMessage>>,
    ) -> Result<(), DecodeError> {
        loop {
            if self.resp_scratch.len() < 5 {
                break;
            }
            let tag = self.resp_scratch[0];
            let length = i32::from_be_bytes(self.resp_scratch[1..5].try_into().unwrap()) as usize;
            let total = 1 + length;
            if length < 4 {
                self.resp_scratch.clear();
                return Err(DecodeError::Framing("response length below minimum".into()));
            }
            if self.resp_scratch.len() < total {
                break;
            }
            let body = self.resp_scratch[5..total].to_vec();
            self.resp_scratch.drain(..total);

            let payload = match tag {
                b'1' => PostgresMessage::ParseComplete,
                b'2' => PostgresMessage::BindComplete,
                b'Z' => PostgresMessage::ReadyForQuery,
                b'C' => {
                    let mut pos = 0;
                    let command_tag = read_cstring(&body, &mut pos).unwrap_or_default();
                    PostgresMessage::CommandComplete { tag: command_tag }
                }
                b'T' => {
                    let field_count = body.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]])).unwrap_or(0);
                    PostgresMessage::RowDescription { field_count }
                }
                b'D' => {
                    let field_count = body.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]])).unwrap_or(0);
                    PostgresMessage::DataRow { field_count }
                }
                b'E' => {
                    let mut pos = 0;
                    let mut code = String::new();
                    let mut message = String::new();
                    while pos < body.len() && body[pos] != 0 {
                        let field_type = body[pos];
                        pos += 1;
                        let value = read_cstring(&body, &mut pos).unwrap_or_default();
                        match field_type {
                            b'C' => code = value,
                            b'M' => message = value,
                            _ => {}
                        }
                    }
                    PostgresMessage::ErrorResponse { code, message }
                }
                other => PostgresMessage::Other { tag: other },
            };
            out.push(DecodedObject { role: Role::Response, timestamp: now, payload });
        }
        Ok(())
    }
}

impl Default for PostgresDecoder {
    fn default() -> Self {
        PostgresDecoder::new()
    }
}

impl Decoder for PostgresDecoder {
    type Object = PostgresMessage;

    fn decode(
        &mut self,
        _direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<PostgresMessage>>, DecodeError> {
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

    fn startup_frame() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&196608i32.to_be_bytes()); // protocol 3.0
        body.extend_from_slice(b"user\0alice\0\0");
        let mut frame = Vec::new();
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn tagged_frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn startup_message_parses_without_tag_byte() {
        let mut decoder = PostgresDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&startup_frame());
        let out = decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            PostgresMessage::Startup { params } => {
                assert_eq!(params[0], ("user".to_string(), "alice".to_string()));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn execute_resolves_sql_through_parse_and_bind() {
        let mut decoder = PostgresDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&startup_frame());
        decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();

        let mut parse_body = Vec::new();
        parse_body.extend_from_slice(b"stmt1\0");
        parse_body.extend_from_slice(b"SELECT 1\0");
        parse_body.extend_from_slice(&0i16.to_be_bytes());
        let parse = tagged_frame(b'P', &parse_body);

        let mut bind_body = Vec::new();
        bind_body.extend_from_slice(b"\0"); // unnamed portal
        bind_body.extend_from_slice(b"stmt1\0");
        let bind = tagged_frame(b'B', &bind_body);

        let mut execute_body = Vec::new();
        execute_body.extend_from_slice(b"\0");
        execute_body.extend_from_slice(&0i32.to_be_bytes());
        let execute = tagged_frame(b'E', &execute_body);

        let mut frames = Vec::new();
        frames.extend(parse);
        frames.extend(bind);
        frames.extend(execute);

        let mut buf2 = ZeroCopyBuffer::new();
        buf2.write(&frames);
        let out = decoder.decode(Direction::Originator, true, &mut buf2, Instant::now()).unwrap();
        assert_eq!(out.len(), 3);
        match &out[2].payload {
            PostgresMessage::Execute { sql, .. } => assert_eq!(sql.as_deref(), Some("SELECT 1")),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_extracts_code_and_message() {
        let mut body = Vec::new();
        body.push(b'C');
        body.extend_from_slice(b"42601\0");
        body.push(b'M');
        body.extend_from_slice(b"syntax error\0");
        body.push(0);
        let frame = tagged_frame(b'E', &body);

        let mut decoder = PostgresDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&frame);
        let out = decoder.decode(Direction::Responder, false, &mut buf, Instant::now()).unwrap();
        match &out[0].payload {
            PostgresMessage::ErrorResponse { code, message } => {
                assert_eq!(code, "42601");
                assert_eq!(message, "syntax error");
            }
            _ => panic!("wrong variant"),
        }
    }
}

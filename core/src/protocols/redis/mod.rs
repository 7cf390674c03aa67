//! Redis RESP2 request/response decoding.
//!
//! No pack example implements RESP; the control flow here is original, but
//! follows Retina's "resettable per-connection parser struct" shape —
//! same as `core/src/protocols/stream/http`'s per-direction state, just with
//! a stack standing in for `httparse`'s header table, since RESP2 nests
//! arrays of arbitrary depth (pipelined commands, multi-bulk replies).

mod transaction;

pub use transaction::RespValue;

use std::time::Instant;

use log::warn;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};
use crate::scan::trim_crlf;

/// One partially-built aggregate: how many more elements it needs before
/// it's complete.
struct Pending {
    remaining: usize,
    items: Vec<RespValue>,
}

#[derive(Default)]
pub struct RespParser {
    scratch: Vec<u8>,
    stack: Vec<Pending>,
}

impl RespParser {
    /// Parses as many complete top-level RESP values as are currently
    /// available, pushing completed aggregates up the stack.
    fn drain_values(&mut self) -> Result<Vec<RespValue>, DecodeError> {
        let mut completed = Vec::new();
        loop {
            let value = match self.parse_one_value()? {
                Some(v) => v,
                None => break,
            };
            self.push_value(value, &mut completed);
        }
        Ok(completed)
    }

    fn push_value(&mut self, value: RespValue, completed: &mut Vec<RespValue>) {
        if let Some(top) = self.stack.last_mut() {
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining == 0 {
                let finished = self.stack.pop().unwrap();
                let array = RespValue::Array(finished.items);
                self.push_value(array, completed);
            }
        } else {
            completed.push(value);
        }
    }

    /// Attempts to parse exactly one RESP value (which may itself open a new
    /// array frame on the stack). Returns `None` if more bytes are needed.
    fn parse_one_value(&mut self) -> Result<Option<RespValue>, DecodeError> {
        if self.scratch.is_empty() {
            return Ok(None);
        }
        let tag = self.scratch[0];
        match tag {
            b'+' | b'-' | b':' => {
                let rest_start = 1;
                let line_pos = match memchr::memchr(b'\n', &self.scratch) {
                    Some(p) => p,
                    None => return Ok(None),
                };
                let body = trim_crlf(&self.scratch[rest_start..line_pos + 1]).to_vec();
                self.scratch.drain(..line_pos + 1);
                let text = String::from_utf8_lossy(&body).into_owned();
                Ok(Some(match tag {
                    b'+' => RespValue::Simple(text),
                    b'-' => RespValue::Error(text),
                    _ => RespValue::Integer(
                        text.parse().map_err(|_| DecodeError::Framing("bad integer".into()))?,
                    ),
                }))
            }
            b'$' => {
                let line_pos = match memchr::memchr(b'\n', &self.scratch) {
                    Some(p) => p,
                    None => return Ok(None),
                };
                let len_str = String::from_utf8_lossy(trim_crlf(&self.scratch[1..line_pos + 1])).into_owned();
                let len: i64 = len_str
                    .parse()
                    .map_err(|_| DecodeError::Framing("bad bulk length".into()))?;
                if len < 0 {
                    self.scratch.drain(..line_pos + 1);
                    return Ok(Some(RespValue::Nil));
                }
                let len = len as usize;
                let total_needed = line_pos + 1 + len + 2;
                if self.scratch.len() < total_needed {
                    return Ok(None);
                }
                let data = self.scratch[line_pos + 1..line_pos + 1 + len].to_vec();
                self.scratch.drain(..total_needed);
                Ok(Some(RespValue::Bulk(data)))
            }
            b'*' => {
                let line_pos = match memchr::memchr(b'\n', &self.scratch) {
                    Some(p) => p,
                    None => return Ok(None),
                };
                let len_str = String::from_utf8_lossy(trim_crlf(&self.scratch[1..line_pos + 1])).into_owned();
                let count: i64 = len_str
                    .parse()
                    .map_err(|_| DecodeError::Framing("bad array length".into()))?;
                self.scratch.drain(..line_pos + 1);
                if count <= 0 {
                    return Ok(Some(RespValue::Array(Vec::new())));
                }
                self.stack.push(Pending { remaining: count as usize, items: Vec::new() });
                // Recurse immediately: there may already be buffered elements.
                match self.parse_one_value()? {
                    Some(inner) => {
                        let mut completed = Vec::new();
                        self.push_value(inner, &mut completed);
                        Ok(completed.into_iter().next())
                    }
                    None => Ok(None),
                }
            }
            other => {
                self.scratch.clear();
                self.stack.clear();
                Err(DecodeError::Framing(format!("unknown RESP tag {:?}", other as char)))
            }
        }
    }
}

pub struct RedisDecoder {
    req: RespParser,
    resp: RespParser,
}

impl Default for RedisDecoder {
    fn default() -> Self {
        RedisDecoder { req: RespParser::default(), resp: RespParser::default() }
    }
}

impl RedisDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RedisDecoder {
    type Object = RespValue;

    fn decode(
        &mut self,
        direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<RespValue>>, DecodeError> {
        let parser = match direction {
            Direction::Originator => &mut self.req,
            Direction::Responder => &mut self.resp,
        };
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => break,
                Ok(slice) => parser.scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => break,
            }
        }

        let role = if is_client { Role::Request } else { Role::Response };
        let values = match parser.drain_values() {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "redis", "resetting RESP parser: {e}");
                return Err(e);
            }
        };
        Ok(values
            .into_iter()
            .map(|v| DecodedObject { role, timestamp: now, payload: v })
            .collect())
    }
}

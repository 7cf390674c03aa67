//! HTTP/1.1 request/response decoding.
//!
//! Ported from `core/src/protocols/stream/http/{parser,transaction}.rs`:
//! same `httparse`-based header parse, generalized from Retina's
//! single-`Mbuf` parse to streaming over a [`ZeroCopyBuffer`] a block at a
//! time, with chunked-transfer-encoding and JSON body capture added (neither
//! is in Retina's HTTP parser).

mod transaction;

pub use transaction::{HttpRequest, HttpResponse};

use std::time::Instant;

use log::{trace, warn};

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    ReadingBody { content_length: Option<usize>, chunked: bool, read_so_far: usize },
}

pub enum HttpObject {
    Request(HttpRequest),
    Response(HttpResponse),
}

pub struct Http1Decoder {
    capture_body: bool,
    max_body_size: usize,
    req_state: ParseState,
    resp_state: ParseState,
    req_scratch: Vec<u8>,
    resp_scratch: Vec<u8>,
}

impl Http1Decoder {
    pub fn new(capture_body: bool, max_body_size: usize) -> Self {
        Http1Decoder {
            capture_body,
            max_body_size,
            req_state: ParseState::Idle,
            resp_state: ParseState::Idle,
            req_scratch: Vec::new(),
            resp_scratch: Vec::new(),
        }
    }

    fn feed(
        scratch: &mut Vec<u8>,
        buf: &mut ZeroCopyBuffer<'_>,
    ) -> Result<bool, DecodeError> {
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => return Ok(true),
                Ok(slice) => scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => return Ok(false),
            }
        }
    }
}

impl Decoder for Http1Decoder {
    type Object = HttpObject;

    fn decode(
        &mut self,
        direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<HttpObject>>, DecodeError> {
        let scratch = match direction {
            Direction::Originator => &mut self.req_scratch,
            Direction::Responder => &mut self.resp_scratch,
        };
        let more_later = Self::feed(scratch, buf)?;
        let mut out = Vec::new();

        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let produced = if is_client {
                let mut req = httparse::Request::new(&mut headers);
                match req.parse(scratch) {
                    Ok(httparse::Status::Complete(consumed)) => {
                        let parsed = transaction::HttpRequest::from_httparse(
                            &req,
                            &scratch[consumed..],
                            self.max_body_size,
                        );
                        match parsed {
                            Some((request, body_consumed)) => {
                                scratch.drain(..consumed + body_consumed);
                                Some(HttpObject::Request(request))
                            }
                            None => break,
                        }
                    }
                    Ok(httparse::Status::Partial) => break,
                    Err(e) => {
                        warn!(target: "http1", "resetting request parser after {e}");
                        scratch.clear();
                        return Err(DecodeError::Framing(e.to_string()));
                    }
                }
            } else {
                let mut resp = httparse::Response::new(&mut headers);
                match resp.parse(scratch) {
                    Ok(httparse::Status::Complete(consumed)) => {
                        let parsed = transaction::HttpResponse::from_httparse(
                            &resp,
                            &scratch[consumed..],
                            self.capture_body,
                            self.max_body_size,
                        );
                        match parsed {
                            Some((response, body_consumed)) => {
                                scratch.drain(..consumed + body_consumed);
                                Some(HttpObject::Response(response))
                            }
                            None => break,
                        }
                    }
                    Ok(httparse::Status::Partial) => break,
                    Err(e) => {
                        warn!(target: "http1", "resetting response parser after {e}");
                        scratch.clear();
                        return Err(DecodeError::Framing(e.to_string()));
                    }
                }
            };
            match produced {
                Some(object) => {
                    let role = if is_client { Role::Request } else { Role::Response };
                    trace!(target: "http1", "decoded one {:?}", role);
                    out.push(DecodedObject { role, timestamp: now, payload: object });
                }
                None => break,
            }
        }

        if !more_later && scratch.is_empty() && out.is_empty() {
            return Ok(out);
        }
        Ok(out)
    }
}

//! The typed HTTP/2 (and gRPC) message: the decoded pseudo-headers, regular
//! headers, accumulated DATA length, and optional trailers for one stream.
//!
//! A single type serves both request and response roles, as HTTP/2 frames
//! carry no built-in request/response tag beyond which pseudo-headers are
//! present (`:method`/`:path`/`:scheme`/`:authority` vs `:status`) — mirrors
//! Retina's single-struct-for-both-directions pattern used by
//! `core/src/protocols/stream/http`'s `Http` session object.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Http2Message {
    pub stream_id: u32,
    pub method: Option<String>,
    pub path: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub data_len: usize,
    pub trailers: Option<Vec<(String, String)>>,
}

impl Http2Message {
    pub fn new(stream_id: u32) -> Self {
        Http2Message {
            stream_id,
            method: None,
            path: None,
            scheme: None,
            authority: None,
            status: None,
            headers: Vec::new(),
            data_len: 0,
            trailers: None,
        }
    }

    /// Applies a decoded HPACK header block to this message, peeling off
    /// recognized pseudo-headers (`:method` etc.) and keeping the rest.
    pub fn apply_headers(&mut self, headers: Vec<(String, String)>) {
        for (name, value) in headers {
            match name.as_str() {
                ":method" => self.method = Some(value),
                ":path" => self.path = Some(value),
                ":scheme" => self.scheme = Some(value),
                ":authority" => self.authority = Some(value),
                ":status" => self.status = value.parse().ok(),
                _ => self.headers.push((name, value)),
            }
        }
    }

    /// Whether all four request pseudo-headers have been seen
    /// §4.9's "request" completion condition for a HEADERS frame).
    pub fn is_request_headers(&self) -> bool {
        self.method.is_some()
            && self.path.is_some()
            && self.scheme.is_some()
            && self.authority.is_some()
    }

    pub fn is_response_headers(&self) -> bool {
        self.status.is_some()
    }

    /// Whether `headers` is a superset of `trailer_keys` — the marker
    /// §4.9 uses to tell a trailing HEADERS frame (e.g. gRPC's
    /// `grpc-status`/`grpc-message`) apart from a new message.
    pub fn looks_like_trailers(headers: &[(String, String)], trailer_keys: &[String]) -> bool {
        !trailer_keys.is_empty()
            && trailer_keys
                .iter()
                .all(|key| headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)))
    }
}

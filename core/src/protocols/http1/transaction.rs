//! Typed HTTP/1.1 request/response objects and the body-framing logic
//! (content-length and chunked transfer-encoding) Retina's
//! `core/src/protocols/stream/http/transaction.rs` doesn't need, since it
//! works from already-fully-buffered single packets.

use serde::Serialize;

use crate::scan::trim_crlf;

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_len: usize,
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn header_value<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Returns `(body_bytes, consumed)` once the full body has arrived, or `None`
/// if more data is needed. Chunked bodies are de-chunked into `body_bytes`.
fn frame_body(
    headers: &[(String, String)],
    rest: &[u8],
    capture: bool,
    max_body: usize,
) -> Option<(Option<Vec<u8>>, usize, usize)> {
    let chunked = header_value(headers, "transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    if chunked {
        let mut out = Vec::new();
        let mut pos = 0usize;
        loop {
            let line_end = memchr::memchr(b'\n', &rest[pos..])? + pos;
            let size_line = trim_crlf(&rest[pos..line_end + 1]);
            let size_str = std::str::from_utf8(size_line).ok()?;
            let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
            let size = usize::from_str_radix(size_str, 16).ok()?;
            let data_start = line_end + 1;
            if size == 0 {
                // Trailing CRLF after the zero-size chunk; tolerate a missing one.
                let total_consumed = (data_start + 2).min(rest.len()).max(data_start);
                let len = out.len();
                return Some((
                    if capture { Some(out) } else { None },
                    total_consumed,
                    len,
                ));
            }
            let data_end = data_start + size;
            if data_end + 2 > rest.len() {
                return None;
            }
            if capture && out.len() + size <= max_body {
                out.extend_from_slice(&rest[data_start..data_end]);
            }
            pos = data_end + 2;
        }
    }

    let content_length: usize = match header_value(headers, "content-length") {
        Some(v) => v.trim().parse().ok()?,
        None => 0,
    };
    if rest.len() < content_length {
        return None;
    }
    let body_slice = &rest[..content_length];
    let body = if capture && content_length <= max_body {
        Some(body_slice.to_vec())
    } else {
        None
    };
    Some((body, content_length, content_length))
}

/// `true` for a `Content-Type` of `application/json` or `text/json`
/// (parameters such as `; charset=utf-8` are ignored).
fn is_json_content_type(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-type")
        .map(|v| v.split(';').next().unwrap_or(v).trim())
        .map(|v| v.eq_ignore_ascii_case("application/json") || v.eq_ignore_ascii_case("text/json"))
        .unwrap_or(false)
}

impl HttpRequest {
    /// Requests never have their body captured, regardless of configuration
    /// — only the response side may carry a JSON body capture.
    pub fn from_httparse(
        req: &httparse::Request,
        rest: &[u8],
        max_body: usize,
    ) -> Option<(Self, usize)> {
        let headers = collect_headers(req.headers);
        let (_body, consumed, body_len) = frame_body(&headers, rest, false, max_body)?;
        Some((
            HttpRequest {
                method: req.method.unwrap_or("").to_string(),
                path: req.path.unwrap_or("").to_string(),
                version: req.version.unwrap_or(1),
                headers,
                body: None,
                body_len,
            },
            consumed,
        ))
    }
}

impl HttpResponse {
    pub fn from_httparse(
        resp: &httparse::Response,
        rest: &[u8],
        capture_enabled: bool,
        max_body: usize,
    ) -> Option<(Self, usize)> {
        let headers = collect_headers(resp.headers);
        let capture = capture_enabled && is_json_content_type(&headers);
        let (body, consumed, body_len) = frame_body(&headers, rest, capture, max_body)?;
        let body = body.filter(|b| serde_json::from_slice::<serde_json::Value>(b).is_ok());
        Some((
            HttpResponse {
                status: resp.code.unwrap_or(0),
                reason: resp.reason.unwrap_or("").to_string(),
                version: resp.version.unwrap_or(1),
                headers,
                body,
                body_len,
            },
            consumed,
        ))
    }
}

//! Byte-slice scanning utilities shared by the line-oriented decoders and by
//! the stream's CRLF-safe chunk cutting (see [`crate::stream`]).
//!
//! Grounded on the small scanning helpers Retina's HTTP/DNS parsers lean
//! on `memchr`/`httparse` for; here we roll the LF search by hand since it is
//! a two-line function and the bounded-`GAP`-window search doesn't match any
//! existing crate's API shape.

/// Maximum contiguous span of bytes a [`crate::stream::Stream`] hands a
/// decoder per invocation.
pub const BLOCK: usize = 4096;

/// Width of the window scanned past a block boundary for a line-feed, so that
/// a `\r\n` is never split across two decoder invocations.
pub const GAP: usize = 64;

/// Given a candidate cut offset `r` into `payload`, returns the adjusted cut
/// offset: if a `\n` occurs within `payload[r..r+GAP]`, move the cut to just
/// past it; otherwise leave `r` unchanged. The result never exceeds
/// `payload.len()`.
pub fn crlf_safe_cut(payload: &[u8], r: usize) -> usize {
    if r >= payload.len() {
        return payload.len();
    }
    let window_end = (r + GAP).min(payload.len());
    match memchr::memchr(b'\n', &payload[r..window_end]) {
        Some(pos) => r + pos + 1,
        None => r,
    }
}

/// Splits `data` into lines, each slice including its trailing `\n` (and the
/// preceding `\r` if present) when one exists. The final element has no
/// trailing separator if `data` doesn't end in one.
pub fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    while start < data.len() {
        match memchr::memchr(b'\n', &data[start..]) {
            Some(pos) => {
                lines.push(&data[start..start + pos + 1]);
                start += pos + 1;
            }
            None => {
                lines.push(&data[start..]);
                break;
            }
        }
    }
    lines
}

/// Strips a trailing `\r\n` or `\n` from `line`, if present.
pub fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_moves_past_next_lf_within_gap() {
        let payload = b"0123456789\nrest-of-the-block-data-here";
        // Cutting at offset 5 lands mid "56789"; the next '\n' is at index 10.
        assert_eq!(crlf_safe_cut(payload, 5), 11);
    }

    #[test]
    fn cut_unchanged_when_no_lf_in_gap() {
        let payload = vec![b'a'; 200];
        assert_eq!(crlf_safe_cut(&payload, 10), 10);
    }

    #[test]
    fn cut_clamped_to_payload_len() {
        let payload = b"short";
        assert_eq!(crlf_safe_cut(payload, 5), 5);
        assert_eq!(crlf_safe_cut(payload, 9), 5);
    }

    #[test]
    fn split_lines_preserves_separators() {
        let data = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let lines = split_lines(data);
        assert_eq!(lines, vec![
            &b"GET / HTTP/1.1\r\n"[..],
            &b"Host: a\r\n"[..],
            &b"\r\n"[..],
        ]);
    }

    #[test]
    fn trim_crlf_strips_both_forms() {
        assert_eq!(trim_crlf(b"abc\r\n"), b"abc");
        assert_eq!(trim_crlf(b"abc\n"), b"abc");
        assert_eq!(trim_crlf(b"abc"), b"abc");
    }
}

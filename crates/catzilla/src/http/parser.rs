// src/http/parser.rs
use crate::http::{MAX_HEADERS, Method};

/// Parser limits. Defaults follow the wire contract: 8 KiB request line,
/// 32 KiB total headers, 16 MiB body.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_request_line: usize,
    pub max_header_bytes: usize,
    pub max_body: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_request_line: 8 * 1024,
            max_header_bytes: 32 * 1024,
            max_body: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before the message can be framed.
    Incomplete,
    /// Malformed request line, header, or chunk framing.
    Invalid,
    /// Request line exceeded `max_request_line`.
    LineTooLong,
    /// Header block exceeded `max_header_bytes` or `MAX_HEADERS` lines.
    HeadersTooLarge,
    /// Declared or accumulated body exceeded `max_body`.
    BodyTooLarge,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete message"),
            ParseError::Invalid => write!(f, "malformed message"),
            ParseError::LineTooLong => write!(f, "request line too long"),
            ParseError::HeadersTooLarge => write!(f, "header block too large"),
            ParseError::BodyTooLarge => write!(f, "body too large"),
        }
    }
}

/// How the message body is framed after the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
}

/// Byte range into the connection read buffer.
type Span = (u32, u32);

/// Parsed request head, stored as offsets so it can persist in the
/// connection slot across loop iterations without borrowing the buffer.
/// Header names are lowercased in place during the parse, which makes
/// normalization idempotent by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadInfo {
    pub method: Method,
    path: Span,
    query: Span,
    headers: [(Span, Span); MAX_HEADERS],
    pub header_count: u8,
    /// Total head length including the terminating blank line.
    pub head_len: u32,
    pub body: BodyKind,
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 defaults to close.
    pub keep_alive_default: bool,
}

impl HeadInfo {
    pub fn path<'a>(&self, buf: &'a [u8]) -> &'a str {
        span_str(buf, self.path)
    }

    pub fn query<'a>(&self, buf: &'a [u8]) -> Option<&'a str> {
        if self.query.1 == 0 && self.query.0 == 0 {
            None
        } else {
            Some(span_str(buf, self.query))
        }
    }

    pub fn headers<'a>(&self, buf: &'a [u8]) -> Vec<(&'a str, &'a str)> {
        self.headers[..self.header_count as usize]
            .iter()
            .map(|(name, value)| (span_str(buf, *name), span_str(buf, *value)))
            .collect()
    }

    pub fn header<'a>(&self, buf: &'a [u8], name: &str) -> Option<&'a str> {
        self.headers[..self.header_count as usize]
            .iter()
            .find(|(n, _)| span_str(buf, *n) == name)
            .map(|(_, v)| span_str(buf, *v))
    }
}

fn span_str(buf: &[u8], span: Span) -> &str {
    // Spans are only produced after a UTF-8 validation pass.
    std::str::from_utf8(&buf[span.0 as usize..span.1 as usize]).unwrap_or("")
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Parse a request head out of `buf`. Mutates `buf` only to lowercase
/// header names. Returns `Incomplete` until the blank line arrives;
/// size-limit errors are detected as early as the partial buffer allows.
pub fn parse_head(buf: &mut [u8], limits: &Limits) -> Result<HeadInfo, ParseError> {
    // ---- Request line ----
    let line_end = match find_crlf(buf, 0) {
        Some(pos) => pos,
        None => {
            if buf.len() > limits.max_request_line {
                return Err(ParseError::LineTooLong);
            }
            return Err(ParseError::Incomplete);
        }
    };
    if line_end > limits.max_request_line {
        return Err(ParseError::LineTooLong);
    }

    let line = &buf[..line_end];
    let sp1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::Invalid)?;
    let sp2 = line[sp1 + 1..]
        .iter()
        .position(|&b| b == b' ')
        .map(|p| sp1 + 1 + p)
        .ok_or(ParseError::Invalid)?;

    let method = Method::from_bytes(&line[..sp1]);
    if method == Method::Unknown {
        return Err(ParseError::Invalid);
    }

    let target = &line[sp1 + 1..sp2];
    if target.is_empty() || target[0] != b'/' {
        return Err(ParseError::Invalid);
    }
    std::str::from_utf8(target).map_err(|_| ParseError::Invalid)?;

    let version = &line[sp2 + 1..];
    let keep_alive_default = match version {
        b"HTTP/1.1" => true,
        b"HTTP/1.0" => false,
        _ => return Err(ParseError::Invalid),
    };

    let target_start = (sp1 + 1) as u32;
    let (path, query) = match target.iter().position(|&b| b == b'?') {
        Some(q) => (
            (target_start, target_start + q as u32),
            (target_start + q as u32 + 1, sp2 as u32),
        ),
        None => ((target_start, sp2 as u32), (0, 0)),
    };

    // ---- Header block ----
    let headers_start = line_end + 2;
    let mut headers = [((0u32, 0u32), (0u32, 0u32)); MAX_HEADERS];
    let mut header_count: u8 = 0;
    let mut cursor = headers_start;

    let head_len = loop {
        let line_start = cursor;
        if buf.len() >= line_start + 2 && &buf[line_start..line_start + 2] == b"\r\n" {
            break line_start + 2;
        }
        let line_end = match find_crlf(buf, line_start) {
            Some(pos) => pos,
            None => {
                if buf.len() - headers_start > limits.max_header_bytes {
                    return Err(ParseError::HeadersTooLarge);
                }
                return Err(ParseError::Incomplete);
            }
        };
        if line_end + 2 - headers_start > limits.max_header_bytes {
            return Err(ParseError::HeadersTooLarge);
        }
        if header_count as usize >= MAX_HEADERS {
            return Err(ParseError::HeadersTooLarge);
        }

        let colon = buf[line_start..line_end]
            .iter()
            .position(|&b| b == b':')
            .map(|p| line_start + p)
            .ok_or(ParseError::Invalid)?;
        if colon == line_start {
            return Err(ParseError::Invalid);
        }

        // Canonicalize the name to lowercase in place.
        for b in &mut buf[line_start..colon] {
            b.make_ascii_lowercase();
        }
        std::str::from_utf8(&buf[line_start..colon]).map_err(|_| ParseError::Invalid)?;

        let mut val_start = colon + 1;
        while val_start < line_end && (buf[val_start] == b' ' || buf[val_start] == b'\t') {
            val_start += 1;
        }
        let mut val_end = line_end;
        while val_end > val_start && (buf[val_end - 1] == b' ' || buf[val_end - 1] == b'\t') {
            val_end -= 1;
        }
        std::str::from_utf8(&buf[val_start..val_end]).map_err(|_| ParseError::Invalid)?;

        headers[header_count as usize] = (
            (line_start as u32, colon as u32),
            (val_start as u32, val_end as u32),
        );
        header_count += 1;
        cursor = line_end + 2;
    };

    if head_len - headers_start > limits.max_header_bytes + 2 {
        return Err(ParseError::HeadersTooLarge);
    }

    // ---- Body framing ----
    let mut info = HeadInfo {
        method,
        path,
        query,
        headers,
        header_count,
        head_len: head_len as u32,
        body: BodyKind::None,
        keep_alive_default,
    };

    if let Some(te) = info.header(buf, "transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            info.body = BodyKind::Chunked;
        } else {
            return Err(ParseError::Invalid);
        }
    } else if let Some(cl) = info.header(buf, "content-length") {
        let len: u64 = cl.trim().parse().map_err(|_| ParseError::Invalid)?;
        if len > limits.max_body as u64 {
            return Err(ParseError::BodyTooLarge);
        }
        if len > 0 {
            info.body = BodyKind::Length(len);
        }
    }

    Ok(info)
}

/// Decode a chunked body. Returns the decoded bytes and the number of
/// input bytes consumed (through the terminating chunk and trailer CRLF).
pub fn decode_chunked(buf: &[u8], max_body: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    loop {
        let size_end = match find_crlf(buf, cursor) {
            Some(pos) => pos,
            None => return Err(ParseError::Incomplete),
        };
        let size_str =
            std::str::from_utf8(&buf[cursor..size_end]).map_err(|_| ParseError::Invalid)?;
        // Chunk extensions after ';' are tolerated and ignored.
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_len =
            usize::from_str_radix(size_str, 16).map_err(|_| ParseError::Invalid)?;

        if chunk_len == 0 {
            // Trailer section: skip any trailer headers through the blank line.
            let mut t = size_end + 2;
            loop {
                let line_end = match find_crlf(buf, t) {
                    Some(pos) => pos,
                    None => return Err(ParseError::Incomplete),
                };
                if line_end == t {
                    return Ok((out, line_end + 2));
                }
                t = line_end + 2;
            }
        }

        if out.len() + chunk_len > max_body {
            return Err(ParseError::BodyTooLarge);
        }

        let data_start = size_end + 2;
        let data_end = data_start + chunk_len;
        if buf.len() < data_end + 2 {
            return Err(ParseError::Incomplete);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::Invalid);
        }
        out.extend_from_slice(&buf[data_start..data_end]);
        cursor = data_end + 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<(HeadInfo, Vec<u8>), ParseError> {
        let mut buf = raw.to_vec();
        let info = parse_head(&mut buf, &Limits::default())?;
        Ok((info, buf))
    }

    #[test]
    fn parses_basic_request() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nX-Tag: a\r\n\r\nBody";
        let (info, buf) = parse(raw).unwrap();

        assert_eq!(info.method, Method::Get);
        assert_eq!(info.path(&buf), "/some/path");
        assert_eq!(info.query(&buf), Some("foo=bar"));
        assert_eq!(info.header_count, 2);
        assert_eq!(info.header(&buf, "host"), Some("localhost"));
        assert_eq!(info.head_len as usize, raw.len() - 4);
        assert!(info.keep_alive_default);
        assert_eq!(info.body, BodyKind::None);
    }

    #[test]
    fn lowercases_header_names_in_place() {
        let raw = b"GET / HTTP/1.1\r\nHoST: x\r\nX-CUSTOM-Header: v\r\n\r\n";
        let (info, buf) = parse(raw).unwrap();
        let headers = info.headers(&buf);
        assert_eq!(headers[0].0, "host");
        assert_eq!(headers[1].0, "x-custom-header");
        // Idempotent: re-parsing the already-normalized bytes is a no-op.
        let mut buf2 = buf.clone();
        let info2 = parse_head(&mut buf2, &Limits::default()).unwrap();
        assert_eq!(info2.headers(&buf2), headers);
    }

    #[test]
    fn incomplete_until_blank_line() {
        let mut buf = b"GET /a HTTP/1.1\r\nHost: x\r\n".to_vec();
        assert_eq!(
            parse_head(&mut buf, &Limits::default()),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn rejects_unknown_version_and_method() {
        let mut buf = b"GET /a HTTP/2.0\r\n\r\n".to_vec();
        assert_eq!(
            parse_head(&mut buf, &Limits::default()),
            Err(ParseError::Invalid)
        );
        let mut buf = b"BREW /pot HTTP/1.1\r\n\r\n".to_vec();
        assert_eq!(
            parse_head(&mut buf, &Limits::default()),
            Err(ParseError::Invalid)
        );
    }

    #[test]
    fn request_line_limit_is_exact() {
        let limits = Limits {
            max_request_line: 64,
            ..Limits::default()
        };
        // Line of exactly 64 bytes before CRLF is accepted.
        let path_len = 64 - "GET  HTTP/1.1".len();
        let path: String = std::iter::once('/')
            .chain(std::iter::repeat('a').take(path_len - 1))
            .collect();
        let mut buf = format!("GET {path} HTTP/1.1\r\n\r\n").into_bytes();
        assert!(parse_head(&mut buf, &limits).is_ok());

        let path: String = std::iter::once('/')
            .chain(std::iter::repeat('a').take(path_len))
            .collect();
        let mut buf = format!("GET {path} HTTP/1.1\r\n\r\n").into_bytes();
        assert_eq!(parse_head(&mut buf, &limits), Err(ParseError::LineTooLong));
    }

    #[test]
    fn content_length_over_limit_is_body_too_large() {
        let limits = Limits {
            max_body: 16,
            ..Limits::default()
        };
        let mut buf = b"POST /u HTTP/1.1\r\nContent-Length: 16\r\n\r\n".to_vec();
        let info = parse_head(&mut buf, &limits).unwrap();
        assert_eq!(info.body, BodyKind::Length(16));

        let mut buf = b"POST /u HTTP/1.1\r\nContent-Length: 17\r\n\r\n".to_vec();
        assert_eq!(parse_head(&mut buf, &limits), Err(ParseError::BodyTooLarge));
    }

    #[test]
    fn chunked_transfer_is_detected() {
        let mut buf =
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let info = parse_head(&mut buf, &Limits::default()).unwrap();
        assert_eq!(info.body, BodyKind::Chunked);
    }

    #[test]
    fn decodes_chunked_body() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (body, consumed) = decode_chunked(raw, 1024).unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(consumed, raw.len());

        assert_eq!(
            decode_chunked(b"4\r\nWi", 1024),
            Err(ParseError::Incomplete)
        );
        assert_eq!(
            decode_chunked(b"zz\r\n", 1024),
            Err(ParseError::Invalid)
        );
        assert_eq!(
            decode_chunked(b"ff\r\n", 16),
            Err(ParseError::BodyTooLarge)
        );
    }
}

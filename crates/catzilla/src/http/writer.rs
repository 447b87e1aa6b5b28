// src/http/writer.rs
use std::time::SystemTime;

use crate::http::{Body, Response};

const SERVER_TOKEN: &str = concat!("catzilla/", env!("CARGO_PKG_VERSION"));

pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// HEAD semantics: emit the full header set but suppress the body.
    pub head_only: bool,
    pub keep_alive: bool,
}

/// Writer for a streaming body. Chunks are emitted in call order and the
/// terminating chunk is guaranteed on every exit path via `Drop`.
pub struct ChunkWriter<'a> {
    out: &'a mut Vec<u8>,
    finished: bool,
    suppress_data: bool,
}

impl<'a> ChunkWriter<'a> {
    fn new(out: &'a mut Vec<u8>, suppress_data: bool) -> Self {
        ChunkWriter {
            out,
            finished: false,
            suppress_data,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        if self.finished || chunk.is_empty() || self.suppress_data {
            return;
        }
        self.out
            .extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        self.out.extend_from_slice(chunk);
        self.out.extend_from_slice(b"\r\n");
    }

    /// Ordering barrier. Buffered output is flushed by the event loop;
    /// this exists so producers can mark chunk boundaries explicitly.
    pub fn flush(&mut self) {}

    pub fn finish(&mut self) {
        if !self.finished {
            if !self.suppress_data {
                self.out.extend_from_slice(b"0\r\n\r\n");
            }
            self.finished = true;
        }
    }
}

impl Drop for ChunkWriter<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn status_forbids_body(status: u16) -> bool {
    status == 204 || status == 304 || (100..200).contains(&status)
}

/// Serialize a response into `out`. Consumes the response because a
/// streaming body is drained in the process.
pub fn write_response(out: &mut Vec<u8>, resp: Response, opts: WriteOptions) {
    let status = resp.status;
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", status, status_reason(status)).as_bytes(),
    );

    let date = httpdate::fmt_http_date(SystemTime::now());
    out.extend_from_slice(format!("Date: {date}\r\n").as_bytes());
    out.extend_from_slice(format!("Server: {SERVER_TOKEN}\r\n").as_bytes());

    let body_allowed = !status_forbids_body(status);
    let mut chunked = false;
    if body_allowed {
        out.extend_from_slice(
            format!("Content-Type: {}\r\n", resp.content_type).as_bytes(),
        );
        match resp.body.len() {
            Some(len) => {
                out.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
            }
            None => {
                out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                chunked = true;
            }
        }
    }

    for (name, value) in &resp.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    for cookie in &resp.cookies {
        out.extend_from_slice(format!("Set-Cookie: {cookie}\r\n").as_bytes());
    }

    out.extend_from_slice(if opts.keep_alive {
        b"Connection: keep-alive\r\n"
    } else {
        b"Connection: close\r\n"
    });
    out.extend_from_slice(b"\r\n");

    if !body_allowed {
        return;
    }

    match resp.body {
        Body::Empty => {}
        Body::Bytes(bytes) => {
            if !opts.head_only {
                out.extend_from_slice(&bytes);
            }
        }
        Body::Stream(mut iter) => {
            debug_assert!(chunked);
            let mut writer = ChunkWriter::new(out, opts.head_only);
            for chunk in iter.by_ref() {
                writer.write(&chunk);
            }
            writer.finish();
        }
    }
}

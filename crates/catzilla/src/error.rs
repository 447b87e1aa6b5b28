// src/error.rs
use std::backtrace::Backtrace;
use std::io;

use rustc_hash::FxHashMap;
use serde_json::json;
use thiserror::Error;

use crate::config::Mode;
use crate::http::parser::ParseError;
use crate::http::{Method, Response};

/// Exhaustive failure taxonomy. Every failure the engine surfaces to a
/// client is classified into exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    UnsupportedMediaType,
    RangeNotSatisfiable,
    Internal,
    ServiceUnavailable,
}

impl ErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::MalformedRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::RangeNotSatisfiable => 416,
            ErrorKind::Internal => 500,
            ErrorKind::ServiceUnavailable => 503,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "MALFORMED_REQUEST",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorKind::RangeNotSatisfiable => "RANGE_NOT_SATISFIABLE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// Central error type for the Catzilla engine.
#[derive(Debug, Error)]
pub enum CatzillaError {
    /// A classified HTTP-level failure.
    #[error("{}: {message}", kind.code())]
    Http { kind: ErrorKind, message: String },

    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(ParseError),

    /// A (method, pattern) pair was registered twice.
    #[error("duplicate route: {0}")]
    DuplicateRoute(String),

    /// A path pattern could not be compiled.
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),

    /// Service registration introduced a dependency cycle.
    #[error("service dependency cycle: {0}")]
    ServiceCycle(String),

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// The task executor refused a submission.
    #[error("task rejected: {0}")]
    TaskRejected(String),

    /// A background worker or task panicked.
    #[error("worker panic: {0}")]
    WorkerPanic(String),
}

impl CatzillaError {
    pub fn http(kind: ErrorKind, message: impl Into<String>) -> Self {
        CatzillaError::Http {
            kind,
            message: message.into(),
        }
    }

    /// Classify into the taxonomy. Registration-time and infrastructure
    /// errors all collapse to `Internal` when they reach a client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatzillaError::Http { kind, .. } => *kind,
            CatzillaError::Parse(e) => match e {
                ParseError::BodyTooLarge => ErrorKind::PayloadTooLarge,
                _ => ErrorKind::MalformedRequest,
            },
            CatzillaError::TaskRejected(_) => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<ParseError> for CatzillaError {
    fn from(e: ParseError) -> Self {
        CatzillaError::Parse(e)
    }
}

pub type CatzillaResult<T> = Result<T, CatzillaError>;

/// What an installed error handler gets to look at.
pub struct ErrorInfo<'a> {
    pub kind: ErrorKind,
    pub message: &'a str,
    pub method: Method,
    pub path: &'a str,
}

pub type ErrorHandler = fn(&ErrorInfo<'_>) -> Response;

/// Installable table mapping each error kind to a response producer.
/// Unmapped kinds fall back to the built-in formatter, which switches
/// between the minimal production body and the diagnostic development
/// body.
pub struct ErrorTable {
    handlers: FxHashMap<ErrorKind, ErrorHandler>,
    mode: Mode,
}

impl ErrorTable {
    pub fn new(mode: Mode) -> Self {
        ErrorTable {
            handlers: FxHashMap::default(),
            mode,
        }
    }

    pub fn install(&mut self, kind: ErrorKind, handler: ErrorHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn render(&self, info: &ErrorInfo<'_>) -> Response {
        match self.handlers.get(&info.kind) {
            Some(handler) => handler(info),
            None => default_response(info, self.mode),
        }
    }
}

/// Built-in error body. Production discloses nothing beyond the code;
/// development adds kind, request coordinates, and a truncated trace.
pub fn default_response(info: &ErrorInfo<'_>, mode: Mode) -> Response {
    let status = info.kind.status();
    let body = match mode {
        Mode::Production => json!({
            "error": crate::http::writer::status_reason(status),
            "code": info.kind.code(),
        }),
        Mode::Development => json!({
            "error": crate::http::writer::status_reason(status),
            "code": info.kind.code(),
            "message": info.message,
            "method": info.method.as_str(),
            "path": info.path,
            "trace": truncated_trace(),
        }),
    };
    Response::json(body.to_string()).status(status)
}

fn truncated_trace() -> String {
    const MAX_LINES: usize = 12;
    let bt = Backtrace::force_capture().to_string();
    let mut out = String::new();
    for (i, line) in bt.lines().enumerate() {
        if i >= MAX_LINES {
            out.push_str("  ...\n");
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(kind: ErrorKind) -> ErrorInfo<'static> {
        ErrorInfo {
            kind,
            message: "boom",
            method: Method::Get,
            path: "/x",
        }
    }

    #[test]
    fn taxonomy_status_mapping() {
        assert_eq!(ErrorKind::MalformedRequest.status(), 400);
        assert_eq!(ErrorKind::MethodNotAllowed.status(), 405);
        assert_eq!(ErrorKind::PayloadTooLarge.status(), 413);
        assert_eq!(ErrorKind::RangeNotSatisfiable.status(), 416);
        assert_eq!(ErrorKind::ServiceUnavailable.status(), 503);
    }

    #[test]
    fn parse_errors_classify_by_kind() {
        let e = CatzillaError::from(ParseError::BodyTooLarge);
        assert_eq!(e.kind(), ErrorKind::PayloadTooLarge);
        let e = CatzillaError::from(ParseError::Invalid);
        assert_eq!(e.kind(), ErrorKind::MalformedRequest);
        let e = CatzillaError::Io(io::Error::other("disk"));
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn production_body_is_minimal() {
        let resp = default_response(&info(ErrorKind::NotFound), Mode::Production);
        assert_eq!(resp.status, 404);
        let v: serde_json::Value = serde_json::from_slice(resp.body.as_bytes()).unwrap();
        assert_eq!(v["code"], "NOT_FOUND");
        assert!(v.get("path").is_none());
        assert!(v.get("trace").is_none());
    }

    #[test]
    fn development_body_carries_diagnostics() {
        let resp = default_response(&info(ErrorKind::Internal), Mode::Development);
        assert_eq!(resp.status, 500);
        let v: serde_json::Value = serde_json::from_slice(resp.body.as_bytes()).unwrap();
        assert_eq!(v["code"], "INTERNAL");
        assert_eq!(v["path"], "/x");
        assert_eq!(v["method"], "GET");
        assert!(v["trace"].as_str().is_some());
    }

    #[test]
    fn installed_handler_wins() {
        fn custom_404(_info: &ErrorInfo<'_>) -> Response {
            Response::html("<h1>lost</h1>").status(404)
        }
        let mut table = ErrorTable::new(Mode::Production);
        table.install(ErrorKind::NotFound, custom_404);

        let resp = table.render(&info(ErrorKind::NotFound));
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body.as_bytes(), b"<h1>lost</h1>");

        // Other kinds still use the default formatter.
        let resp = table.render(&info(ErrorKind::Forbidden));
        assert_eq!(resp.status, 403);
    }
}

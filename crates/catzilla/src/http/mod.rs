// src/http/mod.rs
pub mod parser;
pub mod writer;

use std::any::Any;
use std::borrow::Cow;
use std::cell::OnceCell;
use std::net::IpAddr;

use rustc_hash::FxHashMap;

/// Upper bound on captured path parameters per route pattern.
pub const MAX_PARAMS: usize = 8;
/// Upper bound on parsed header lines per request.
pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }

    fn bit(&self) -> u16 {
        match self {
            Method::Get => 1 << 0,
            Method::Post => 1 << 1,
            Method::Put => 1 << 2,
            Method::Delete => 1 << 3,
            Method::Patch => 1 << 4,
            Method::Head => 1 << 5,
            Method::Options => 1 << 6,
            Method::Trace => 1 << 7,
            Method::Connect => 1 << 8,
            Method::Unknown => 0,
        }
    }

    const ALL: [Method; 9] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Head,
        Method::Options,
        Method::Trace,
        Method::Connect,
    ];
}

/// Set of HTTP methods registered at a router node. Surfaced on 405
/// responses and OPTIONS synthesis as the `Allow` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSet(u16);

impl MethodSet {
    pub fn empty() -> Self {
        MethodSet(0)
    }

    pub fn insert(&mut self, m: Method) {
        self.0 |= m.bit();
    }

    pub fn contains(&self, m: Method) -> bool {
        m != Method::Unknown && self.0 & m.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        Method::ALL.iter().copied().filter(|m| self.contains(*m))
    }

    /// Render as an `Allow` header value, e.g. `GET, HEAD, OPTIONS`.
    /// HEAD is implied by GET and OPTIONS is always answerable, so both
    /// are folded in even when not explicitly registered.
    pub fn allow_header(&self) -> String {
        let mut effective = *self;
        if effective.contains(Method::Get) {
            effective.insert(Method::Head);
        }
        if !effective.is_empty() {
            effective.insert(Method::Options);
        }
        let mut out = String::with_capacity(effective.len() * 8);
        for m in effective.iter() {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(m.as_str());
        }
        out
    }
}

/// Path parameters captured by the router, stored inline. Bounded by
/// pattern depth, so a fixed array avoids per-request allocation.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    items: [(Cow<'a, str>, Cow<'a, str>); MAX_PARAMS],
    len: u8,
}

impl<'a> Params<'a> {
    pub fn new() -> Self {
        const EMPTY: (Cow<'static, str>, Cow<'static, str>) =
            (Cow::Borrowed(""), Cow::Borrowed(""));
        Params {
            items: [EMPTY; MAX_PARAMS],
            len: 0,
        }
    }

    pub fn push(&mut self, name: Cow<'a, str>, value: Cow<'a, str>) {
        if (self.len as usize) < MAX_PARAMS {
            self.items[self.len as usize] = (name, value);
            self.len += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items[..self.len as usize]
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.items[..self.len as usize]
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len as u8);
    }
}

impl Default for Params<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view over a parsed HTTP message. Header names are
/// canonicalized to lowercase by the parser before this view is built;
/// query parsing is deferred until first use and memoized.
pub struct Request<'a> {
    pub method: Method,
    /// Percent-decoded, normalized path.
    pub path: &'a str,
    /// Raw query string (undecoded, without the leading `?`).
    pub query: Option<&'a str>,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
    pub params: Params<'a>,
    /// Transport peer address, if known.
    pub peer: Option<IpAddr>,
    query_memo: OnceCell<Vec<(String, String)>>,
}

impl<'a> Request<'a> {
    pub fn new(method: Method, path: &'a str) -> Self {
        Request {
            method,
            path,
            query: None,
            headers: Vec::new(),
            body: &[],
            params: Params::new(),
            peer: None,
            query_memo: OnceCell::new(),
        }
    }

    /// First value of a header, case-insensitive on the lookup side.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// All values of a repeated header, in wire order.
    pub fn header_all(&self, name: &str) -> impl Iterator<Item = &'a str> + '_ {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(&name))
            .map(|(_, v)| *v)
    }

    /// Parsed query pairs, decoded and memoized on first access.
    pub fn query_pairs(&self) -> &[(String, String)] {
        self.query_memo.get_or_init(|| {
            let raw = match self.query {
                Some(q) => q,
                None => return Vec::new(),
            };
            raw.split('&')
                .filter(|part| !part.is_empty())
                .map(|part| match part.find('=') {
                    Some(idx) => (
                        decode_component(&part[..idx]),
                        decode_component(&part[idx + 1..]),
                    ),
                    None => (decode_component(part), String::new()),
                })
                .collect()
        })
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_pairs()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_bytes(&self) -> &'a [u8] {
        self.body
    }

    pub fn text(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.body)
    }

    /// Client address: proxy headers win over the transport peer.
    pub fn client_address(&self) -> Option<IpAddr> {
        if let Some(xff) = self.header("x-forwarded-for") {
            let first = xff.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse() {
                return Some(ip);
            }
        }
        if let Some(real) = self.header("x-real-ip")
            && let Ok(ip) = real.trim().parse()
        {
            return Some(ip);
        }
        self.peer
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Response body. `Stream` produces chunks lazily; the writer emits them
/// with chunked transfer encoding in strict production order.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn Iterator<Item = Vec<u8>> + Send>),
}

impl Body {
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b.as_slice(),
            Body::Stream(_) => &[],
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

pub struct Response {
    pub status: u16,
    pub content_type: Cow<'static, str>,
    pub headers: Vec<(Cow<'static, str>, String)>,
    pub body: Body,
    pub cookies: Vec<String>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            content_type: Cow::Borrowed("text/plain"),
            headers: Vec::new(),
            body: Body::Empty,
            cookies: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Response {
            status: 200,
            content_type: Cow::Borrowed("text/plain"),
            headers: Vec::new(),
            body: Body::Bytes(body.into()),
            cookies: Vec::new(),
        }
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Response {
            status: 200,
            content_type: Cow::Borrowed("application/json"),
            headers: Vec::new(),
            body: Body::Bytes(body.into()),
            cookies: Vec::new(),
        }
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Response {
            status: 200,
            content_type: Cow::Borrowed("text/html; charset=utf-8"),
            headers: Vec::new(),
            body: Body::Bytes(body.into()),
            cookies: Vec::new(),
        }
    }

    pub fn no_content() -> Self {
        Response::new(204)
    }

    pub fn stream(iter: impl Iterator<Item = Vec<u8>> + Send + 'static) -> Self {
        Response {
            status: 200,
            content_type: Cow::Borrowed("application/octet-stream"),
            headers: Vec::new(),
            body: Body::Stream(Box::new(iter)),
            cookies: Vec::new(),
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn content_type(mut self, ct: impl Into<Cow<'static, str>>) -> Self {
        self.content_type = ct.into();
        self
    }

    pub fn header(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn set_header(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) {
        let key = key.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            slot.1 = value.into();
        } else {
            self.headers.push((key, value.into()));
        }
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(mut self, raw_set_cookie: impl Into<String>) -> Self {
        self.cookies.push(raw_set_cookie.into());
        self
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .finish()
    }
}

/// Per-request untyped key/value bag shared between middleware and the
/// handler. Single-threaded per request; destroyed with the request.
#[derive(Default)]
pub struct ContextBag {
    entries: FxHashMap<String, Box<dyn Any>>,
}

impl ContextBag {
    pub fn insert<T: Any>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key).and_then(|v| v.downcast_mut())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

pub struct Context<'a> {
    pub req: Request<'a>,
    pub bag: ContextBag,
}

impl<'a> Context<'a> {
    pub fn new(req: Request<'a>) -> Self {
        Context {
            req,
            bag: ContextBag::default(),
        }
    }
}

/// Percent-decode one path or query component. `+` is translated only in
/// query components via `decode_component`; path segments go through
/// `decode_segment`, where `+` is literal.
fn percent_decode(input: &str, plus_as_space: bool) -> Cow<'_, str> {
    let bytes = input.as_bytes();
    if !bytes.iter().any(|&b| b == b'%' || (plus_as_space && b == b'+')) {
        return Cow::Borrowed(input);
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16));
                let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16));
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push((h * 16 + l) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    match String::from_utf8(out) {
        Ok(s) => Cow::Owned(s),
        Err(_) => Cow::Borrowed(input),
    }
}

/// Decode a path segment; `%2F` becomes a literal slash inside the
/// segment and never acts as a separator.
pub fn decode_segment(segment: &str) -> Cow<'_, str> {
    percent_decode(segment, false)
}

/// Decode a query component (`+` means space).
pub fn decode_component(component: &str) -> String {
    percent_decode(component, true).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_set_allow_header() {
        let mut set = MethodSet::empty();
        set.insert(Method::Get);
        assert_eq!(set.allow_header(), "GET, HEAD, OPTIONS");

        set.insert(Method::Post);
        assert_eq!(set.allow_header(), "GET, POST, HEAD, OPTIONS");

        assert_eq!(MethodSet::empty().allow_header(), "");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = Request::new(Method::Get, "/");
        req.headers.push(("content-type", "application/json"));
        req.headers.push(("x-tag", "a"));
        req.headers.push(("x-tag", "b"));

        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.header_all("X-Tag").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn query_pairs_are_lazy_and_decoded() {
        let mut req = Request::new(Method::Get, "/search");
        req.query = Some("q=hello+world&lang=en&flag&pct=a%26b");

        assert_eq!(req.query_param("q"), Some("hello world"));
        assert_eq!(req.query_param("lang"), Some("en"));
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("pct"), Some("a&b"));
        assert_eq!(req.query_pairs().len(), 4);
    }

    #[test]
    fn client_address_prefers_forwarded_header() {
        let mut req = Request::new(Method::Get, "/");
        req.peer = Some("10.0.0.1".parse().unwrap());
        assert_eq!(req.client_address(), Some("10.0.0.1".parse().unwrap()));

        req.headers.push(("x-forwarded-for", "203.0.113.7, 10.0.0.1"));
        assert_eq!(req.client_address(), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn decode_segment_keeps_encoded_slash_literal() {
        assert_eq!(decode_segment("a%2Fb"), "a/b");
        assert_eq!(decode_segment("plain"), "plain");
        assert_eq!(decode_segment("sp%20ace"), "sp ace");
        // Malformed escapes pass through untouched.
        assert_eq!(decode_segment("bad%zz"), "bad%zz");
    }

    #[test]
    fn context_bag_round_trip() {
        let mut bag = ContextBag::default();
        bag.insert("user_id", 42u64);
        bag.insert("tag", String::from("audit"));

        assert_eq!(bag.get::<u64>("user_id"), Some(&42));
        assert_eq!(bag.get::<String>("tag").map(String::as_str), Some("audit"));
        assert!(bag.get::<u32>("user_id").is_none());
        assert!(bag.remove("tag"));
        assert!(!bag.contains("tag"));
    }

    #[test]
    fn params_bounded_capture() {
        let mut params = Params::new();
        for i in 0..12 {
            params.push(
                Cow::Owned(format!("k{i}")),
                Cow::Owned(format!("v{i}")),
            );
        }
        assert_eq!(params.len(), MAX_PARAMS);
        assert_eq!(params.get("k0"), Some("v0"));
        assert_eq!(params.get("k11"), None);
    }
}

// src/router.rs
use std::borrow::Cow;

use rustc_hash::FxHashMap;

use crate::error::{CatzillaError, CatzillaResult, ErrorKind};
use crate::http::{Context, MAX_PARAMS, Method, MethodSet, Params, Response, decode_segment};
use crate::middleware::MiddlewareSpec;

pub type Handler = fn(&mut Context<'_>) -> CatzillaResult<Response>;

pub type RouteId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

/// Compiled path pattern. Parameter names are unique within a pattern
/// and a wildcard may only appear as the final segment.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pub raw: String,
    pub segments: Vec<Segment>,
}

impl PathPattern {
    /// Accepts `{name}` / `:name` parameters and `*name` / `{*name}`
    /// wildcards.
    pub fn parse(path: &str) -> CatzillaResult<Self> {
        let raw = normalize_path(path);
        let mut segments = Vec::new();

        for part in raw.split('/').filter(|s| !s.is_empty()) {
            let segment = if let Some(name) = part
                .strip_prefix("{*")
                .and_then(|p| p.strip_suffix('}'))
                .or_else(|| part.strip_prefix('*'))
            {
                Segment::Wildcard(name.to_string())
            } else if let Some(name) = part
                .strip_prefix('{')
                .and_then(|p| p.strip_suffix('}'))
                .or_else(|| part.strip_prefix(':'))
            {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        let mut names: Vec<&str> = Vec::new();
        for (idx, segment) in segments.iter().enumerate() {
            match segment {
                Segment::Literal(_) => {}
                Segment::Wildcard(_) if idx + 1 != segments.len() => {
                    return Err(CatzillaError::InvalidPattern(format!(
                        "wildcard must be the final segment in '{path}'"
                    )));
                }
                Segment::Param(name) | Segment::Wildcard(name) => {
                    if name.is_empty() {
                        return Err(CatzillaError::InvalidPattern(format!(
                            "unnamed parameter in '{path}'"
                        )));
                    }
                    if names.contains(&name.as_str()) {
                        return Err(CatzillaError::InvalidPattern(format!(
                            "duplicate parameter '{name}' in '{path}'"
                        )));
                    }
                    names.push(name);
                }
            }
        }
        if names.len() > MAX_PARAMS {
            return Err(CatzillaError::InvalidPattern(format!(
                "more than {MAX_PARAMS} parameters in '{path}'"
            )));
        }

        Ok(PathPattern { raw, segments })
    }
}

/// Normalize a path: single leading `/`, no trailing `/` except for the
/// root, consecutive `/` collapsed. Idempotent.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split('/').filter(|s| !s.is_empty()) {
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Immutable after registration.
#[derive(Debug)]
pub struct Route {
    pub id: RouteId,
    pub method: Method,
    pub pattern: PathPattern,
    pub handler: Handler,
    pub middleware: Vec<MiddlewareSpec>,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

/// Normalized handler descriptor handed over by the binding layer.
pub struct RouteDef {
    pub method: Method,
    pub pattern: String,
    pub handler: Handler,
    pub middleware: Vec<MiddlewareSpec>,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

impl RouteDef {
    pub fn new(method: Method, pattern: impl Into<String>, handler: Handler) -> Self {
        RouteDef {
            method,
            pattern: pattern.into(),
            handler,
            middleware: Vec::new(),
            name: None,
            tags: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, middleware: Vec<MiddlewareSpec>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

const METHOD_SLOTS: usize = 9;

fn method_slot(m: Method) -> Option<usize> {
    Some(match m {
        Method::Get => 0,
        Method::Post => 1,
        Method::Put => 2,
        Method::Delete => 3,
        Method::Patch => 4,
        Method::Head => 5,
        Method::Options => 6,
        Method::Trace => 7,
        Method::Connect => 8,
        Method::Unknown => return None,
    })
}

struct Node {
    literal: FxHashMap<String, u32>,
    /// At most one parameter child; the capture name is fixed per edge.
    param: Option<(String, u32)>,
    /// At most one wildcard child, terminal by construction.
    wildcard: Option<(String, u32)>,
    leaves: [Option<RouteId>; METHOD_SLOTS],
}

impl Node {
    fn new() -> Self {
        Node {
            literal: FxHashMap::default(),
            param: None,
            wildcard: None,
            leaves: [None; METHOD_SLOTS],
        }
    }

    fn allowed(&self) -> MethodSet {
        let mut set = MethodSet::empty();
        for (slot, leaf) in self.leaves.iter().enumerate() {
            if leaf.is_some() {
                set.insert(slot_method(slot));
            }
        }
        set
    }
}

fn slot_method(slot: usize) -> Method {
    match slot {
        0 => Method::Get,
        1 => Method::Post,
        2 => Method::Put,
        3 => Method::Delete,
        4 => Method::Patch,
        5 => Method::Head,
        6 => Method::Options,
        7 => Method::Trace,
        _ => Method::Connect,
    }
}

/// How a resolution was produced. `Head` shares the GET handler and the
/// writer suppresses the body; `Options` is answered by the engine with
/// 204 and the allowed-methods set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthesis {
    None,
    Head,
    Options,
}

#[derive(Debug)]
pub struct RouteResolution<'r, 'p> {
    pub route: Option<&'r Route>,
    pub params: Params<'p>,
    pub allowed: MethodSet,
    pub synthesized: Synthesis,
}

/// Radix trie keyed by path segments with per-method leaf tables.
/// Matching precedence per node: literal > parameter > wildcard, with
/// backtracking, so longer literal prefixes bind before shorter ones.
/// Immutable after startup; `resolve` is pure.
pub struct Router {
    nodes: Vec<Node>,
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            nodes: vec![Node::new()],
            routes: Vec::new(),
        }
    }

    /// Register a route. Duplicate (method, exact pattern) pairs and
    /// conflicting capture names at one position are errors.
    pub fn register(&mut self, def: RouteDef) -> CatzillaResult<RouteId> {
        let pattern = PathPattern::parse(&def.pattern)?;
        let Some(slot) = method_slot(def.method) else {
            return Err(CatzillaError::InvalidPattern(format!(
                "cannot register unknown method for '{}'",
                def.pattern
            )));
        };

        let mut node = 0usize;
        for segment in &pattern.segments {
            node = match segment {
                Segment::Literal(text) => {
                    if let Some(&child) = self.nodes[node].literal.get(text) {
                        child as usize
                    } else {
                        let child = self.push_node();
                        self.nodes[node].literal.insert(text.clone(), child as u32);
                        child
                    }
                }
                Segment::Param(name) => match &self.nodes[node].param {
                    Some((existing, child)) => {
                        if existing != name {
                            return Err(CatzillaError::InvalidPattern(format!(
                                "conflicting parameter name '{name}' (existing '{existing}') in '{}'",
                                pattern.raw
                            )));
                        }
                        *child as usize
                    }
                    None => {
                        let child = self.push_node();
                        self.nodes[node].param = Some((name.clone(), child as u32));
                        child
                    }
                },
                Segment::Wildcard(name) => match &self.nodes[node].wildcard {
                    Some((existing, child)) => {
                        if existing != name {
                            return Err(CatzillaError::InvalidPattern(format!(
                                "conflicting wildcard name '{name}' (existing '{existing}') in '{}'",
                                pattern.raw
                            )));
                        }
                        *child as usize
                    }
                    None => {
                        let child = self.push_node();
                        self.nodes[node].wildcard = Some((name.clone(), child as u32));
                        child
                    }
                },
            };
        }

        if self.nodes[node].leaves[slot].is_some() {
            return Err(CatzillaError::DuplicateRoute(format!(
                "{} {}",
                def.method.as_str(),
                pattern.raw
            )));
        }

        let id = self.routes.len() as RouteId;
        self.routes.push(Route {
            id,
            method: def.method,
            pattern,
            handler: def.handler,
            middleware: def.middleware,
            name: def.name,
            tags: def.tags,
        });
        self.nodes[node].leaves[slot] = Some(id);
        tracing::debug!(
            target: "catzilla::router",
            method = def.method.as_str(),
            pattern = %self.routes[id as usize].pattern.raw,
            "route registered"
        );
        Ok(id)
    }

    fn push_node(&mut self) -> usize {
        self.nodes.push(Node::new());
        self.nodes.len() - 1
    }

    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareSpec>,
    ) -> CatzillaResult<RouteId> {
        self.register(RouteDef::new(method, pattern, handler).with_middleware(middleware))
    }

    pub fn get(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Get, pattern, handler, Vec::new())
    }

    pub fn post(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Post, pattern, handler, Vec::new())
    }

    pub fn put(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Put, pattern, handler, Vec::new())
    }

    pub fn delete(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Delete, pattern, handler, Vec::new())
    }

    pub fn patch(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Patch, pattern, handler, Vec::new())
    }

    pub fn head(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Head, pattern, handler, Vec::new())
    }

    pub fn options(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Options, pattern, handler, Vec::new())
    }

    /// Open a registration group sharing a path prefix and middleware.
    pub fn group<'r>(&'r mut self, prefix: &str) -> RouteGroup<'r> {
        RouteGroup {
            router: self,
            prefix: normalize_path(prefix),
            middleware: Vec::new(),
        }
    }

    pub fn route(&self, id: RouteId) -> &Route {
        &self.routes[id as usize]
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Match a (method, path) pair. O(S) in the number of segments.
    ///
    /// Percent-decoding happens per segment before matching, so `%2F`
    /// never acts as a separator. An empty interior segment (`//`) is a
    /// malformed path.
    pub fn resolve<'a>(
        &'a self,
        method: Method,
        path: &'a str,
    ) -> CatzillaResult<RouteResolution<'a, 'a>> {
        let trimmed = if path.len() > 1 && path.ends_with('/') {
            &path[..path.len() - 1]
        } else {
            path
        };
        if !trimmed.starts_with('/') {
            return Err(CatzillaError::http(
                ErrorKind::MalformedRequest,
                "path must start with '/'",
            ));
        }

        // Segment offsets into the original path; the wildcard capture
        // needs the raw remaining suffix.
        let mut segments: Vec<(usize, &'a str)> = Vec::new();
        if trimmed.len() > 1 {
            let mut offset = 1;
            for part in trimmed[1..].split('/') {
                if part.is_empty() {
                    return Err(CatzillaError::http(
                        ErrorKind::MalformedRequest,
                        "empty path segment",
                    ));
                }
                segments.push((offset, part));
                offset += part.len() + 1;
            }
        }

        let mut params = Params::new();
        let node = self.walk(0, trimmed, &segments, 0, &mut params);

        let (allowed, node) = match node {
            Some(idx) => (self.nodes[idx].allowed(), Some(idx)),
            None => (MethodSet::empty(), None),
        };

        let Some(node) = node else {
            return Ok(RouteResolution {
                route: None,
                params: Params::new(),
                allowed,
                synthesized: Synthesis::None,
            });
        };

        let leaves = &self.nodes[node].leaves;
        if let Some(slot) = method_slot(method)
            && let Some(id) = leaves[slot]
        {
            return Ok(RouteResolution {
                route: Some(&self.routes[id as usize]),
                params,
                allowed,
                synthesized: Synthesis::None,
            });
        }

        // HEAD synthesizes from GET when no explicit HEAD route exists.
        if method == Method::Head
            && let Some(id) = leaves[0]
        {
            return Ok(RouteResolution {
                route: Some(&self.routes[id as usize]),
                params,
                allowed,
                synthesized: Synthesis::Head,
            });
        }

        // OPTIONS synthesizes the allowed-methods report.
        if method == Method::Options && !allowed.is_empty() {
            return Ok(RouteResolution {
                route: None,
                params,
                allowed,
                synthesized: Synthesis::Options,
            });
        }

        Ok(RouteResolution {
            route: None,
            params,
            allowed,
            synthesized: Synthesis::None,
        })
    }

    fn walk<'a>(
        &'a self,
        node: usize,
        path: &'a str,
        segments: &[(usize, &'a str)],
        depth: usize,
        params: &mut Params<'a>,
    ) -> Option<usize> {
        if depth == segments.len() {
            // A node without leaves is a dead end; refusing it here lets
            // the caller backtrack into a parameter or wildcard sibling.
            if self.nodes[node].allowed().is_empty() {
                return None;
            }
            return Some(node);
        }

        let (offset, raw_segment) = segments[depth];
        let decoded = decode_segment(raw_segment);

        // Literal children bind first.
        if let Some(&child) = self.nodes[node].literal.get(decoded.as_ref())
            && let Some(found) = self.walk(child as usize, path, segments, depth + 1, params)
        {
            return Some(found);
        }

        // Then the parameter child, capturing a single segment.
        if let Some((name, child)) = &self.nodes[node].param {
            let checkpoint = params.len();
            params.push(Cow::Borrowed(name.as_str()), decoded.clone());
            if let Some(found) = self.walk(*child as usize, path, segments, depth + 1, params) {
                return Some(found);
            }
            params.truncate(checkpoint);
        }

        // Finally the wildcard child: captures the raw remaining suffix
        // and terminates the walk.
        if let Some((name, child)) = &self.nodes[node].wildcard {
            let rest = &path[offset..];
            params.push(Cow::Borrowed(name.as_str()), decode_segment(rest));
            return Some(*child as usize);
        }

        None
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration view with a shared prefix and middleware list, applied
/// to every route registered through it.
pub struct RouteGroup<'r> {
    router: &'r mut Router,
    prefix: String,
    middleware: Vec<MiddlewareSpec>,
}

impl RouteGroup<'_> {
    pub fn with_middleware(mut self, middleware: Vec<MiddlewareSpec>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
    ) -> CatzillaResult<RouteId> {
        let full = if pattern == "/" || pattern.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, normalize_path(pattern))
        };
        self.router.register(
            RouteDef::new(method, full, handler).with_middleware(self.middleware.clone()),
        )
    }

    pub fn get(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Get, pattern, handler)
    }

    pub fn post(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Post, pattern, handler)
    }

    pub fn put(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Put, pattern, handler)
    }

    pub fn delete(&mut self, pattern: &str, handler: Handler) -> CatzillaResult<RouteId> {
        self.add_route(Method::Delete, pattern, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn handler_a(_ctx: &mut Context<'_>) -> CatzillaResult<Response> {
        Ok(Response::ok("a"))
    }

    fn handler_b(_ctx: &mut Context<'_>) -> CatzillaResult<Response> {
        Ok(Response::ok("b"))
    }

    fn invoke(router: &Router, method: Method, path: &'static str) -> Vec<u8> {
        let res = router.resolve(method, path).unwrap();
        let route = res.route.expect("expected a match");
        let mut ctx = Context::new(Request::new(method, path));
        ctx.req.params = res.params.clone();
        let resp = (route.handler)(&mut ctx).unwrap();
        resp.body.as_bytes().to_vec()
    }

    #[test]
    fn normalize_path_is_idempotent() {
        for raw in ["/a//b/", "a/b", "//", "/", "/a/b/c"] {
            let once = normalize_path(raw);
            assert_eq!(normalize_path(&once), once, "not idempotent for {raw}");
        }
        assert_eq!(normalize_path("a//b/"), "/a/b");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn literal_beats_param_beats_wildcard() {
        let mut router = Router::new();
        router.get("/users/me", handler_a).unwrap();
        router.get("/users/{id}", handler_b).unwrap();
        router.get("/files/*rest", handler_b).unwrap();

        assert_eq!(invoke(&router, Method::Get, "/users/me"), b"a");

        let res = router.resolve(Method::Get, "/users/42").unwrap();
        assert!(res.route.is_some());
        assert_eq!(res.params.get("id"), Some("42"));

        let res = router.resolve(Method::Get, "/files/js/app.js").unwrap();
        assert!(res.route.is_some());
        assert_eq!(res.params.get("rest"), Some("js/app.js"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut router = Router::new();
        router.get("/items", handler_a).unwrap();
        let err = router.get("/items", handler_b).unwrap_err();
        assert!(matches!(err, CatzillaError::DuplicateRoute(_)));

        // Same pattern, different method is fine.
        router.post("/items", handler_b).unwrap();
        // Equivalent un-normalized spelling is still a duplicate.
        let err = router.get("/items/", handler_b).unwrap_err();
        assert!(matches!(err, CatzillaError::DuplicateRoute(_)));
    }

    #[test]
    fn allowed_set_for_405() {
        let mut router = Router::new();
        router.get("/items", handler_a).unwrap();

        let res = router.resolve(Method::Post, "/items").unwrap();
        assert!(res.route.is_none());
        assert_eq!(res.synthesized, Synthesis::None);
        assert!(res.allowed.contains(Method::Get));
        assert_eq!(res.allowed.allow_header(), "GET, HEAD, OPTIONS");
    }

    #[test]
    fn head_synthesizes_from_get() {
        let mut router = Router::new();
        router.get("/ping", handler_a).unwrap();

        let res = router.resolve(Method::Head, "/ping").unwrap();
        assert_eq!(res.synthesized, Synthesis::Head);
        assert_eq!(res.route.unwrap().method, Method::Get);
    }

    #[test]
    fn explicit_head_wins_over_synthesis() {
        let mut router = Router::new();
        router.get("/ping", handler_a).unwrap();
        router.head("/ping", handler_b).unwrap();

        let res = router.resolve(Method::Head, "/ping").unwrap();
        assert_eq!(res.synthesized, Synthesis::None);
        assert_eq!(res.route.unwrap().method, Method::Head);
    }

    #[test]
    fn options_synthesizes_allowed_report() {
        let mut router = Router::new();
        router.get("/items", handler_a).unwrap();
        router.post("/items", handler_b).unwrap();

        let res = router.resolve(Method::Options, "/items").unwrap();
        assert_eq!(res.synthesized, Synthesis::Options);
        assert!(res.route.is_none());
        assert_eq!(res.allowed.allow_header(), "GET, POST, HEAD, OPTIONS");

        // No match anywhere: not synthesized.
        let res = router.resolve(Method::Options, "/nope").unwrap();
        assert_eq!(res.synthesized, Synthesis::None);
        assert!(res.allowed.is_empty());
    }

    #[test]
    fn empty_segment_is_malformed() {
        let mut router = Router::new();
        router.get("/a/{x}/b", handler_a).unwrap();

        let err = router.resolve(Method::Get, "/a//b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRequest);
        // A single trailing slash is tolerated.
        assert!(router.resolve(Method::Get, "/a/1/b/").unwrap().route.is_some());
    }

    #[test]
    fn percent_decoding_before_match() {
        let mut router = Router::new();
        router.get("/files/{name}", handler_a).unwrap();

        // %2F decodes inside the segment and does not split it.
        let res = router.resolve(Method::Get, "/files/a%2Fb").unwrap();
        assert!(res.route.is_some());
        assert_eq!(res.params.get("name"), Some("a/b"));

        // Encoded literal segments match their decoded spelling.
        router.get("/tag/new items", handler_b).unwrap();
        let res = router.resolve(Method::Get, "/tag/new%20items").unwrap();
        assert!(res.route.is_some());
    }

    #[test]
    fn backtracks_from_literal_dead_end() {
        let mut router = Router::new();
        router.get("/shop/cart/checkout", handler_a).unwrap();
        router.get("/shop/{section}/list", handler_b).unwrap();

        // "cart" matches the literal child but the literal subtree has
        // no "/list"; the param child must be retried.
        let res = router.resolve(Method::Get, "/shop/cart/list").unwrap();
        assert!(res.route.is_some());
        assert_eq!(res.params.get("section"), Some("cart"));
    }

    #[test]
    fn pattern_validation() {
        assert!(matches!(
            PathPattern::parse("/a/*rest/b"),
            Err(CatzillaError::InvalidPattern(_))
        ));
        assert!(matches!(
            PathPattern::parse("/a/{x}/b/{x}"),
            Err(CatzillaError::InvalidPattern(_))
        ));
        assert!(matches!(
            PathPattern::parse("/a/{}"),
            Err(CatzillaError::InvalidPattern(_))
        ));
        let p = PathPattern::parse("/a/{id}/files/{*rest}").unwrap();
        assert_eq!(p.segments.len(), 4);
        assert!(matches!(p.segments[3], Segment::Wildcard(_)));
    }

    #[test]
    fn conflicting_param_names_rejected() {
        let mut router = Router::new();
        router.get("/users/{id}", handler_a).unwrap();
        let err = router.get("/users/{uid}/x", handler_b).unwrap_err();
        assert!(matches!(err, CatzillaError::InvalidPattern(_)));
    }

    #[test]
    fn groups_prefix_and_share_middleware() {
        let mut router = Router::new();
        {
            let mut api = router.group("/api/v1");
            api.get("/posts", handler_a).unwrap();
            api.get("/posts/{id}", handler_b).unwrap();
        }

        assert!(router.resolve(Method::Get, "/api/v1/posts").unwrap().route.is_some());
        let res = router.resolve(Method::Get, "/api/v1/posts/9").unwrap();
        assert_eq!(res.params.get("id"), Some("9"));
    }

    #[test]
    fn resolution_is_pure_and_repeatable() {
        let mut router = Router::new();
        router.get("/a/{x}", handler_a).unwrap();
        for _ in 0..3 {
            let res = router.resolve(Method::Get, "/a/7").unwrap();
            assert_eq!(res.params.get("x"), Some("7"));
            assert_eq!(res.params.len(), 1);
        }
    }
}

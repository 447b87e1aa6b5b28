// src/middleware.rs
use crate::error::{CatzillaResult, ErrorInfo, ErrorTable};
use crate::http::{Context, Response};
use crate::router::Route;

/// Pre-route hook. Returning `Some(response)` short-circuits: the
/// handler and remaining pre-route hooks are skipped, post-route hooks
/// still run.
pub type PreHook = fn(&mut Context<'_>) -> CatzillaResult<Option<Response>>;

/// Post-route hook. Runs on success and short-circuit paths alike and
/// may mutate the response in place.
pub type PostHook = fn(&mut Context<'_>, &mut Response) -> CatzillaResult<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy)]
pub enum Hook {
    Pre(PreHook),
    Post(PostHook),
}

#[derive(Debug, Clone)]
pub struct MiddlewareSpec {
    pub hook: Hook,
    /// Lower runs first within a phase.
    pub priority: i32,
    pub name: Option<&'static str>,
}

impl MiddlewareSpec {
    pub fn pre(hook: PreHook, priority: i32) -> Self {
        MiddlewareSpec {
            hook: Hook::Pre(hook),
            priority,
            name: None,
        }
    }

    pub fn post(hook: PostHook, priority: i32) -> Self {
        MiddlewareSpec {
            hook: Hook::Post(hook),
            priority,
            name: None,
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn phase(&self) -> Phase {
        match self.hook {
            Hook::Pre(_) => Phase::Pre,
            Hook::Post(_) => Phase::Post,
        }
    }
}

/// Global middleware chains plus the execution engine.
///
/// Effective order for a route: global pre sorted by (priority,
/// registration index), then the route's own middleware in registration
/// order, then the handler, then the route's post hooks, then global
/// post sorted by (priority, registration index). Post hooks run
/// unconditionally, including after a short-circuit or a failure.
pub struct MiddlewareEngine {
    pre: Vec<(i32, usize, PreHook, Option<&'static str>)>,
    post: Vec<(i32, usize, PostHook, Option<&'static str>)>,
    registered: usize,
}

impl MiddlewareEngine {
    pub fn new() -> Self {
        MiddlewareEngine {
            pre: Vec::new(),
            post: Vec::new(),
            registered: 0,
        }
    }

    pub fn add(&mut self, spec: MiddlewareSpec) {
        let idx = self.registered;
        self.registered += 1;
        match spec.hook {
            Hook::Pre(hook) => {
                self.pre.push((spec.priority, idx, hook, spec.name));
                self.pre.sort_by_key(|(priority, idx, _, _)| (*priority, *idx));
            }
            Hook::Post(hook) => {
                self.post.push((spec.priority, idx, hook, spec.name));
                self.post.sort_by_key(|(priority, idx, _, _)| (*priority, *idx));
            }
        }
    }

    pub fn pre_count(&self) -> usize {
        self.pre.len()
    }

    pub fn post_count(&self) -> usize {
        self.post.len()
    }

    /// Run the effective chain for a matched route and produce the
    /// response. Failures never escape: they are rendered through the
    /// error table and the chain continues into its post phase.
    pub fn run(&self, ctx: &mut Context<'_>, route: &Route, table: &ErrorTable) -> Response {
        let mut response: Option<Response> = None;

        for (_, _, hook, name) in &self.pre {
            match hook(ctx) {
                Ok(None) => {}
                Ok(Some(resp)) => {
                    tracing::debug!(
                        target: "catzilla::middleware",
                        middleware = name.unwrap_or("?"),
                        "pre-route short-circuit"
                    );
                    response = Some(resp);
                    break;
                }
                Err(e) => {
                    response = Some(render_error(ctx, table, &e));
                    break;
                }
            }
        }

        if response.is_none() {
            for spec in &route.middleware {
                if let Hook::Pre(hook) = spec.hook {
                    match hook(ctx) {
                        Ok(None) => {}
                        Ok(Some(resp)) => {
                            response = Some(resp);
                            break;
                        }
                        Err(e) => {
                            response = Some(render_error(ctx, table, &e));
                            break;
                        }
                    }
                }
            }
        }

        let mut response = match response {
            Some(resp) => resp,
            None => match (route.handler)(ctx) {
                Ok(resp) => resp,
                Err(e) => render_error(ctx, table, &e),
            },
        };

        for spec in &route.middleware {
            if let Hook::Post(hook) = spec.hook
                && let Err(e) = hook(ctx, &mut response)
            {
                response = render_error(ctx, table, &e);
            }
        }
        for (_, _, hook, _) in &self.post {
            if let Err(e) = hook(ctx, &mut response) {
                response = render_error(ctx, table, &e);
            }
        }

        response
    }
}

impl Default for MiddlewareEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn render_error(
    ctx: &Context<'_>,
    table: &ErrorTable,
    error: &crate::error::CatzillaError,
) -> Response {
    let message = error.to_string();
    table.render(&ErrorInfo {
        kind: error.kind(),
        message: &message,
        method: ctx.req.method,
        path: ctx.req.path,
    })
}

// src/worker.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::Mode;
use crate::conn::{Conn, ConnState};
use crate::error::{ErrorInfo, ErrorKind};
use crate::http::parser::{BodyKind, ParseError, decode_chunked, parse_head};
use crate::http::writer::{WriteOptions, write_response};
use crate::http::{Context, Method, Request, Response, decode_segment};
use crate::metrics::WorkerMetrics;
use crate::router::Synthesis;
use crate::runtime::Runtime;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLIN, EPOLLOUT, Poller, ReadOutcome, epoll_event,
};

const LISTEN_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;

fn unix_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

enum Flush {
    Done,
    Pending,
    Failed,
}

/// One reactor. Owns its SO_REUSEPORT listener, a connection slab, and
/// a poller; every connection on it is driven by this thread alone.
pub struct Worker {
    id: usize,
    runtime: Arc<Runtime>,
    metrics: Arc<WorkerMetrics>,
    listen_fd: i32,
    slab_capacity: usize,
}

impl Worker {
    pub fn new(
        id: usize,
        runtime: Arc<Runtime>,
        metrics: Arc<WorkerMetrics>,
        listen_fd: i32,
    ) -> Self {
        Worker {
            id,
            runtime,
            metrics,
            listen_fd,
            slab_capacity: 65_536,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> crate::error::CatzillaResult<()> {
        let poller = Poller::new()?;
        poller.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)?;

        let mut slab = ConnectionSlab::new(self.slab_capacity);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let mut draining_since: Option<Instant> = None;
        let mut last_prune = unix_secs();

        tracing::debug!(target: "catzilla::server", worker = self.id, "reactor started");

        loop {
            let stopping = shutdown.load(Ordering::Acquire);
            let now = unix_secs();

            if stopping {
                let since = *draining_since.get_or_insert_with(Instant::now);
                self.close_idle(&poller, &mut slab);
                let grace = Duration::from_secs(self.runtime.config.shutdown_grace_secs);
                if slab.is_empty() || since.elapsed() >= grace {
                    break;
                }
            }

            if now != last_prune {
                self.prune_idle(&poller, &mut slab, now);
                last_prune = now;
            }

            let timeout = if stopping { 50 } else { 1000 };
            let n = match poller.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(_) => continue, // interrupted
            };

            for event in &events[..n] {
                let token = event.u64;
                let readable = event.events & EPOLLIN as u32 != 0;

                if token == LISTEN_TOKEN {
                    if !stopping {
                        self.accept_loop(&poller, &mut slab, now);
                    }
                } else {
                    // Write readiness resumes the Writing state through
                    // the same drive loop; no separate flag needed.
                    self.handle_event(&poller, &mut slab, token as usize, readable, now, stopping);
                }
            }
        }

        // Close whatever is left.
        for i in 0..slab.capacity() {
            if let Some(conn) = slab.get(i)
                && conn.state != ConnState::Free
            {
                let fd = conn.fd;
                poller.delete(fd).ok();
                syscalls::close_fd(fd);
                slab.free(i);
                self.metrics.dec_conn();
            }
        }
        tracing::debug!(target: "catzilla::server", worker = self.id, "reactor stopped");
        Ok(())
    }

    fn accept_loop(&self, poller: &Poller, slab: &mut ConnectionSlab, now: u32) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => match slab.allocate() {
                    Some(idx) => {
                        let conn = slab.get_mut(idx).expect("allocated slot");
                        conn.open(fd, peer, now);
                        if poller.add(fd, idx as u64, EPOLLIN).is_err() {
                            syscalls::close_fd(fd);
                            slab.free(idx);
                        } else {
                            self.metrics.inc_conn();
                        }
                    }
                    None => {
                        // Out of slots; shed the connection immediately.
                        syscalls::close_fd(fd);
                    }
                },
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    fn prune_idle(&self, poller: &Poller, slab: &mut ConnectionSlab, now: u32) {
        let timeout = self.runtime.config.keep_alive_timeout_secs;
        for i in 0..slab.capacity() {
            let stale = slab
                .get(i)
                .is_some_and(|c| c.state != ConnState::Free && now.saturating_sub(c.last_active) > timeout);
            if stale {
                self.close_conn(poller, slab, i);
            }
        }
    }

    /// During drain, keep-alive connections with no request in flight
    /// are closed; in-flight work runs to completion.
    fn close_idle(&self, poller: &Poller, slab: &mut ConnectionSlab) {
        for i in 0..slab.capacity() {
            let idle = slab.get(i).is_some_and(|c| {
                matches!(c.state, ConnState::KeepAlive | ConnState::ReadingHead)
                    && c.head.is_none()
                    && c.read_buf.is_empty()
            });
            if idle {
                self.close_conn(poller, slab, i);
            }
        }
    }

    fn close_conn(&self, poller: &Poller, slab: &mut ConnectionSlab, idx: usize) {
        if let Some(conn) = slab.get(idx) {
            let fd = conn.fd;
            poller.delete(fd).ok();
            syscalls::close_fd(fd);
        }
        slab.free(idx);
        self.metrics.dec_conn();
    }

    fn handle_event(
        &self,
        poller: &Poller,
        slab: &mut ConnectionSlab,
        idx: usize,
        readable: bool,
        now: u32,
        stopping: bool,
    ) {
        let Some(conn) = slab.get_mut(idx) else {
            return;
        };
        if conn.state == ConnState::Free {
            return;
        }
        conn.last_active = now;

        let mut closing = false;

        if readable
            && matches!(
                conn.state,
                ConnState::ReadingHead | ConnState::ReadingBody | ConnState::KeepAlive
            )
        {
            if conn.state == ConnState::KeepAlive {
                conn.state = ConnState::ReadingHead;
            }
            closing = !self.fill_read_buffer(conn);
        }

        // Drive the state machine as far as the buffered bytes allow,
        // including pipelined requests after a completed response.
        while !closing {
            match conn.state {
                ConnState::ReadingHead | ConnState::ReadingBody => {
                    if !self.advance(conn, stopping) {
                        closing = true;
                        break;
                    }
                    if conn.state != ConnState::Writing {
                        break; // need more bytes
                    }
                }
                ConnState::Writing => match self.flush(conn) {
                    Flush::Done => {
                        if conn.keep_alive && !stopping {
                            if conn.epollout_armed {
                                conn.epollout_armed = false;
                                let _ = poller.modify(conn.fd, idx as u64, EPOLLIN);
                            }
                            conn.finish_cycle();
                        } else {
                            closing = true;
                            break;
                        }
                    }
                    Flush::Pending => {
                        if !conn.epollout_armed {
                            conn.epollout_armed = true;
                            if poller
                                .modify(conn.fd, idx as u64, EPOLLIN | EPOLLOUT)
                                .is_err()
                            {
                                closing = true;
                            }
                        }
                        break;
                    }
                    Flush::Failed => {
                        closing = true;
                        break;
                    }
                },
                _ => break,
            }
        }

        if closing {
            self.close_conn(poller, slab, idx);
        }
    }

    /// Drain the socket into the read buffer (edge-triggered poller, so
    /// read to WouldBlock). Returns false when the connection is gone.
    fn fill_read_buffer(&self, conn: &mut Conn) -> bool {
        let limits = &self.runtime.config.limits;
        // Hard cap: head limits plus the body cap, with framing slack.
        let max_buffered =
            limits.max_request_line + limits.max_header_bytes + limits.max_body + 4096;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match syscalls::read_nonblocking(conn.fd, &mut chunk) {
                Ok(ReadOutcome::Data(n)) => {
                    if conn.read_buf.len() + n > max_buffered {
                        return false;
                    }
                    conn.read_buf.extend_from_slice(&chunk[..n]);
                }
                Ok(ReadOutcome::WouldBlock) => return true,
                Ok(ReadOutcome::Eof) => return false,
                Err(_) => return false,
            }
        }
    }

    /// Parse as much of the in-flight request as the buffer holds; once
    /// complete, dispatch it and serialize the response.
    fn advance(&self, conn: &mut Conn, stopping: bool) -> bool {
        let limits = self.runtime.config.limits;

        if conn.head.is_none() {
            match parse_head(&mut conn.read_buf, &limits) {
                Ok(head) => {
                    conn.head = Some(head);
                    conn.request_started = Some(Instant::now());
                }
                Err(ParseError::Incomplete) => {
                    conn.state = ConnState::ReadingHead;
                    return true;
                }
                Err(e) => {
                    self.reject(conn, e);
                    return true;
                }
            }
        }

        let head = conn.head.expect("head parsed above");
        let head_len = head.head_len as usize;
        match head.body {
            BodyKind::None => {
                conn.consumed = head_len;
            }
            BodyKind::Length(n) => {
                let need = head_len + n as usize;
                if conn.read_buf.len() < need {
                    conn.state = ConnState::ReadingBody;
                    return true;
                }
                conn.consumed = need;
            }
            BodyKind::Chunked => match decode_chunked(&conn.read_buf[head_len..], limits.max_body)
            {
                Ok((body, used)) => {
                    conn.chunked_body = body;
                    conn.consumed = head_len + used;
                }
                Err(ParseError::Incomplete) => {
                    conn.state = ConnState::ReadingBody;
                    return true;
                }
                Err(e) => {
                    self.reject(conn, e);
                    return true;
                }
            },
        }

        conn.state = ConnState::Dispatching;
        self.dispatch(conn, stopping);
        true
    }

    /// Protocol violation: emit a terminal 4xx and close after writing.
    fn reject(&self, conn: &mut Conn, error: ParseError) {
        let kind = match error {
            ParseError::BodyTooLarge => ErrorKind::PayloadTooLarge,
            _ => ErrorKind::MalformedRequest,
        };
        let message = error.to_string();
        let resp = self.runtime.errors.render(&ErrorInfo {
            kind,
            message: &message,
            method: Method::Unknown,
            path: "",
        });
        let status = resp.status;
        conn.write_buf.clear();
        write_response(
            &mut conn.write_buf,
            resp,
            WriteOptions {
                head_only: false,
                keep_alive: false,
            },
        );
        conn.keep_alive = false;
        conn.write_pos = 0;
        conn.state = ConnState::Writing;
        self.metrics.inc_req();
        self.metrics.record_response(status, 0);
    }

    /// One fully-buffered request: build the views, route, run the
    /// chain, serialize. Arenas scope every per-request allocation.
    fn dispatch(&self, conn: &mut Conn, stopping: bool) {
        let started = conn.request_started.unwrap_or_else(Instant::now);
        let head = conn.head.expect("dispatch requires a parsed head");
        let head_len = head.head_len as usize;
        let method = head.method;

        conn.requests_served += 1;
        self.metrics.inc_req();

        let read_buf = &conn.read_buf;
        let arena = &conn.request_arena;
        let raw_path = head.path(read_buf);

        // Keep-alive: explicit header wins, then the version default;
        // the budget and a draining server force close.
        let connection_header = head.header(read_buf, "connection");
        let mut keep_alive = match connection_header {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.to_ascii_lowercase().contains("keep-alive") => true,
            _ => head.keep_alive_default,
        };
        if stopping || conn.requests_served >= self.runtime.config.keep_alive_max_requests {
            keep_alive = false;
        }

        // Percent-decode the path segment-wise into the request arena;
        // an encoded slash stays inside its segment.
        let decoded_path: &str = {
            let mut decoded = String::with_capacity(raw_path.len());
            for (i, part) in raw_path.split('/').enumerate() {
                if i > 0 {
                    decoded.push('/');
                }
                decoded.push_str(&decode_segment(part));
            }
            arena.alloc_str(&decoded)
        };

        let body: &[u8] = match head.body {
            BodyKind::None => &[],
            BodyKind::Length(_) => &read_buf[head_len..conn.consumed],
            BodyKind::Chunked => &conn.chunked_body,
        };

        let mut req = Request::new(method, decoded_path);
        req.query = head.query(read_buf);
        req.headers = head.headers(read_buf);
        req.body = body;
        req.peer = conn.peer;

        let head_only = method == Method::Head;
        let mut ctx = Context::new(req);

        let response = self.produce_response(&mut ctx, raw_path);

        // Deadline check: refuse to begin the write, answer 503.
        let deadline = Duration::from_millis(self.runtime.config.request_deadline_ms);
        let response = if started.elapsed() > deadline {
            let message = "request deadline exceeded";
            self.runtime.errors.render(&ErrorInfo {
                kind: ErrorKind::ServiceUnavailable,
                message,
                method,
                path: ctx.req.path,
            })
        } else {
            response
        };

        let status = response.status;
        let micros = started.elapsed().as_micros() as u64;

        conn.write_buf.clear();
        write_response(
            &mut conn.write_buf,
            response,
            WriteOptions {
                head_only,
                keep_alive,
            },
        );
        conn.keep_alive = keep_alive;
        conn.head_only = head_only;
        conn.write_pos = 0;
        conn.state = ConnState::Writing;

        self.metrics.record_response(status, micros);
        if self.runtime.config.mode == Mode::Development {
            crate::logging::log_request(method.as_str(), raw_path, status, micros);
        }
    }

    /// Static tree first, then the router with HEAD/OPTIONS synthesis,
    /// 405 with `Allow`, and 404 as the floor.
    fn produce_response<'a>(&'a self, ctx: &mut Context<'a>, raw_path: &'a str) -> Response {
        let runtime = &self.runtime;

        if let Some(resp) = runtime.statics.serve(&ctx.req) {
            return resp;
        }

        let resolution = match runtime.router.resolve(ctx.req.method, raw_path) {
            Ok(resolution) => resolution,
            Err(e) => {
                let message = e.to_string();
                return runtime.errors.render(&ErrorInfo {
                    kind: e.kind(),
                    message: &message,
                    method: ctx.req.method,
                    path: ctx.req.path,
                });
            }
        };

        if let Some(route) = resolution.route {
            ctx.req.params = resolution.params;
            return runtime.middleware.run(ctx, route, &runtime.errors);
        }

        if resolution.synthesized == Synthesis::Options {
            return Response::no_content().header("Allow", resolution.allowed.allow_header());
        }

        if !resolution.allowed.is_empty() {
            let resp = runtime.errors.render(&ErrorInfo {
                kind: ErrorKind::MethodNotAllowed,
                message: "method not allowed for this resource",
                method: ctx.req.method,
                path: ctx.req.path,
            });
            return resp.header("Allow", resolution.allowed.allow_header());
        }

        runtime.errors.render(&ErrorInfo {
            kind: ErrorKind::NotFound,
            message: "no route matched",
            method: ctx.req.method,
            path: ctx.req.path,
        })
    }

    fn flush(&self, conn: &mut Conn) -> Flush {
        while conn.write_pos < conn.write_buf.len() {
            match syscalls::write_nonblocking(conn.fd, &conn.write_buf[conn.write_pos..]) {
                Ok(0) => return Flush::Pending,
                Ok(n) => {
                    conn.write_pos += n;
                    self.metrics.add_bytes(n);
                }
                Err(_) => return Flush::Failed,
            }
        }
        Flush::Done
    }
}

// src/conn.rs
use std::net::IpAddr;
use std::time::Instant;

use crate::http::parser::HeadInfo;
use crate::memory::alloc::ArenaTag;
use crate::memory::arena::Arena;

/// Initial read buffer capacity; grows up to the configured limits.
pub const READ_BUF_INIT: usize = 8 * 1024;
pub const WRITE_BUF_INIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    #[default]
    Free = 0,
    Accepted = 1,
    ReadingHead = 2,
    ReadingBody = 3,
    Dispatching = 4,
    Writing = 5,
    KeepAlive = 6,
    Closing = 7,
}

/// Per-connection slot. Buffers and arenas keep their capacity across
/// keep-alive cycles; the slab recycles whole slots across connections.
pub struct Conn {
    /// File descriptor, or the free-list next index while unused.
    pub fd: i32,
    pub state: ConnState,
    /// Raw inbound bytes: head, then (for Content-Length framing) the body.
    pub read_buf: Vec<u8>,
    /// Serialized response bytes pending write.
    pub write_buf: Vec<u8>,
    /// Bytes of `write_buf` already flushed (partial write resume).
    pub write_pos: usize,
    /// Parsed head of the in-flight request, offsets into `read_buf`.
    pub head: Option<HeadInfo>,
    /// Decoded body for chunked transfer input.
    pub chunked_body: Vec<u8>,
    /// Bytes of `read_buf` consumed by the in-flight request.
    pub consumed: usize,
    pub keep_alive: bool,
    /// HEAD semantics for the in-flight response.
    pub head_only: bool,
    pub peer: Option<IpAddr>,
    /// Whether the poller registration currently includes write interest.
    pub epollout_armed: bool,
    /// Set when the head finishes parsing; drives the request deadline.
    pub request_started: Option<Instant>,
    /// Seconds timestamp of last activity, for idle pruning.
    pub last_active: u32,
    pub requests_served: u32,
    pub request_arena: Arena,
    pub response_arena: Arena,
}

impl Conn {
    pub fn empty() -> Self {
        Conn {
            fd: -1,
            state: ConnState::Free,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            head: None,
            chunked_body: Vec::new(),
            consumed: 0,
            keep_alive: false,
            head_only: false,
            peer: None,
            epollout_armed: false,
            request_started: None,
            last_active: 0,
            requests_served: 0,
            request_arena: Arena::new(ArenaTag::Request),
            response_arena: Arena::new(ArenaTag::Response),
        }
    }

    /// Prepare a recycled slot for a fresh connection.
    pub fn open(&mut self, fd: i32, peer: Option<IpAddr>, now: u32) {
        self.fd = fd;
        self.state = ConnState::ReadingHead;
        self.read_buf.clear();
        if self.read_buf.capacity() == 0 {
            self.read_buf.reserve(READ_BUF_INIT);
        }
        self.write_buf.clear();
        if self.write_buf.capacity() == 0 {
            self.write_buf.reserve(WRITE_BUF_INIT);
        }
        self.write_pos = 0;
        self.head = None;
        self.chunked_body.clear();
        self.consumed = 0;
        self.keep_alive = false;
        self.head_only = false;
        self.peer = peer;
        self.epollout_armed = false;
        self.request_started = None;
        self.last_active = now;
        self.requests_served = 0;
    }

    /// Keep-alive edge: the response is fully written. Resets the
    /// request/response arena pair, drops consumed input, and rearms the
    /// parser. Pipelined bytes stay in `read_buf` and put the connection
    /// straight back into `ReadingHead`.
    pub fn finish_cycle(&mut self) {
        self.request_arena.reset();
        self.response_arena.reset();
        if self.consumed > 0 {
            self.read_buf.drain(..self.consumed);
        }
        self.consumed = 0;
        self.head = None;
        self.chunked_body.clear();
        self.write_buf.clear();
        self.write_pos = 0;
        self.head_only = false;
        self.request_started = None;
        self.state = if self.read_buf.is_empty() {
            ConnState::KeepAlive
        } else {
            ConnState::ReadingHead
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_recycles_buffers() {
        let mut conn = Conn::empty();
        conn.open(9, None, 100);
        conn.read_buf.extend_from_slice(b"leftover");
        conn.write_buf.extend_from_slice(b"resp");
        conn.requests_served = 7;

        conn.open(11, None, 200);
        assert_eq!(conn.fd, 11);
        assert_eq!(conn.state, ConnState::ReadingHead);
        assert!(conn.read_buf.is_empty());
        assert!(conn.write_buf.is_empty());
        assert_eq!(conn.requests_served, 0);
        assert_eq!(conn.last_active, 200);
    }

    #[test]
    fn finish_cycle_keeps_pipelined_bytes() {
        let mut conn = Conn::empty();
        conn.open(3, None, 0);
        conn.read_buf.extend_from_slice(b"REQ1REQ2");
        conn.consumed = 4;
        conn.write_buf.extend_from_slice(b"response");
        conn.request_arena.alloc_copy(b"scratch");

        conn.finish_cycle();
        assert_eq!(conn.read_buf, b"REQ2");
        assert_eq!(conn.consumed, 0);
        assert!(conn.write_buf.is_empty());
        assert_eq!(conn.request_arena.used(), 0);
        // Pipelined bytes re-arm the parser immediately.
        assert_eq!(conn.state, ConnState::ReadingHead);

        conn.finish_cycle();
        assert_eq!(conn.state, ConnState::ReadingHead);
        conn.read_buf.clear();
        conn.finish_cycle();
        assert_eq!(conn.state, ConnState::KeepAlive);
    }
}

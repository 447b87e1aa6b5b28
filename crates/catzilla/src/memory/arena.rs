// src/memory/arena.rs
//! Named bump arenas.
//!
//! An arena hands out raw byte regions with a moving bump pointer and
//! forgets them all at once on `reset`. Allocation takes `&self` and
//! returns references bound to that borrow; `reset` takes `&mut self`,
//! so the borrow checker enforces the lifecycle contract: nothing
//! allocated from an arena can be observed after the arena resets.
//!
//! Reset is O(1) and keeps the backing chunks mapped. Chunks double in
//! size as the arena grows. With allocator auto-tuning enabled, an arena
//! that keeps resetting at a fraction of its footprint releases its
//! excess chunks.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::memory::alloc::{self, ArenaTag};

const MIN_CHUNK: usize = 4 * 1024;
const CHUNK_ALIGN: usize = 16;
/// Consecutive low-utilization resets before auto-tuning trims chunks.
const TRIM_STREAK: u32 = 8;

struct Chunk {
    ptr: NonNull<u8>,
    cap: usize,
}

struct State {
    chunks: Vec<Chunk>,
    current: usize,
    offset: usize,
    used: usize,
    high_water: usize,
    resets: u64,
    low_use_streak: u32,
}

pub struct Arena {
    tag: ArenaTag,
    state: UnsafeCell<State>,
}

// An arena is owned by exactly one thread at a time (the reactor for
// request/response, a task worker for task arenas). It is Send, not Sync.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(tag: ArenaTag) -> Self {
        Arena {
            tag,
            state: UnsafeCell::new(State {
                chunks: Vec::new(),
                current: 0,
                offset: 0,
                used: 0,
                high_water: 0,
                resets: 0,
                low_use_streak: 0,
            }),
        }
    }

    pub fn with_capacity(tag: ArenaTag, cap: usize) -> Self {
        let arena = Arena::new(tag);
        if cap > 0 {
            let state = unsafe { &mut *arena.state.get() };
            push_chunk(state, tag, cap.max(MIN_CHUNK));
        }
        arena
    }

    pub fn tag(&self) -> ArenaTag {
        self.tag
    }

    /// Bump-allocate `size` bytes at `align`. The pointer stays valid
    /// until the next `reset`.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two() && align <= CHUNK_ALIGN);
        let state = unsafe { &mut *self.state.get() };

        loop {
            if let Some(chunk) = state.chunks.get(state.current) {
                let aligned = (state.offset + align - 1) & !(align - 1);
                if aligned + size <= chunk.cap {
                    state.offset = aligned + size;
                    state.used += size;
                    // In-bounds by the check above.
                    return unsafe { NonNull::new_unchecked(chunk.ptr.as_ptr().add(aligned)) };
                }
                if state.current + 1 < state.chunks.len() {
                    state.current += 1;
                    state.offset = 0;
                    continue;
                }
            }
            let last_cap = state.chunks.last().map_or(0, |c| c.cap);
            let new_cap = size.max(last_cap * 2).max(MIN_CHUNK);
            push_chunk(state, self.tag, new_cap);
            state.current = state.chunks.len() - 1;
            state.offset = 0;
        }
    }

    /// Copy `bytes` into the arena.
    pub fn alloc_copy<'s>(&'s self, bytes: &[u8]) -> &'s mut [u8] {
        if bytes.is_empty() {
            return &mut [];
        }
        let ptr = self.alloc(bytes.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            std::slice::from_raw_parts_mut(ptr.as_ptr(), bytes.len())
        }
    }

    /// Copy a string into the arena.
    pub fn alloc_str<'s>(&'s self, s: &str) -> &'s str {
        let bytes = self.alloc_copy(s.as_bytes());
        // Round-tripped from a valid &str.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    pub fn used(&self) -> usize {
        unsafe { &*self.state.get() }.used
    }

    pub fn capacity(&self) -> usize {
        unsafe { &*self.state.get() }
            .chunks
            .iter()
            .map(|c| c.cap)
            .sum()
    }

    pub fn chunk_count(&self) -> usize {
        unsafe { &*self.state.get() }.chunks.len()
    }

    pub fn high_water(&self) -> usize {
        unsafe { &*self.state.get() }.high_water
    }

    /// O(1) bulk reset. Requires `&mut self`, which proves no borrow of
    /// arena memory survives this call.
    pub fn reset(&mut self) {
        let state = self.state.get_mut();
        state.high_water = state.high_water.max(state.used);
        state.resets += 1;

        let cap: usize = state.chunks.iter().map(|c| c.cap).sum();
        if alloc::auto_tuning_enabled() && state.chunks.len() > 1 {
            if state.used < cap / 4 {
                state.low_use_streak += 1;
                if state.low_use_streak >= TRIM_STREAK {
                    let extra = state.chunks.split_off(1);
                    for chunk in extra {
                        free_chunk(self.tag, chunk);
                    }
                    state.low_use_streak = 0;
                }
            } else {
                state.low_use_streak = 0;
            }
        }

        state.current = 0;
        state.offset = 0;
        state.used = 0;
    }
}

fn push_chunk(state: &mut State, tag: ArenaTag, cap: usize) {
    let layout = Layout::from_size_align(cap, CHUNK_ALIGN).expect("chunk layout");
    let raw = alloc::alloc(tag, layout);
    let Some(ptr) = NonNull::new(raw) else {
        std::alloc::handle_alloc_error(layout);
    };
    state.chunks.push(Chunk { ptr, cap });
}

fn free_chunk(tag: ArenaTag, chunk: Chunk) {
    let layout = Layout::from_size_align(chunk.cap, CHUNK_ALIGN).expect("chunk layout");
    unsafe { alloc::free(tag, chunk.ptr.as_ptr(), layout) };
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in state.chunks.drain(..) {
            free_chunk(self.tag, chunk);
        }
    }
}

/// The five per-concern arenas a runtime owns.
pub struct ArenaSet {
    pub request: Arena,
    pub response: Arena,
    pub cache: Arena,
    pub static_files: Arena,
    pub task: Arena,
}

impl ArenaSet {
    pub fn new() -> Self {
        ArenaSet {
            request: Arena::new(ArenaTag::Request),
            response: Arena::new(ArenaTag::Response),
            cache: Arena::new(ArenaTag::Cache),
            static_files: Arena::new(ArenaTag::Static),
            task: Arena::new(ArenaTag::Task),
        }
    }

    /// Request and response arenas reset as a pair once a response has
    /// been fully written on a connection.
    pub fn reset_request_pair(&mut self) {
        self.request.reset();
        self.response.reset();
    }
}

impl Default for ArenaSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_copy_round_trips() {
        let arena = Arena::new(ArenaTag::Request);
        let a = arena.alloc_copy(b"hello");
        let b = arena.alloc_str("world");
        assert_eq!(a, b"hello");
        assert_eq!(b, "world");
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn grows_by_doubling() {
        let arena = Arena::with_capacity(ArenaTag::Cache, MIN_CHUNK);
        assert_eq!(arena.chunk_count(), 1);

        // Exhaust the first chunk and force growth.
        arena.alloc(MIN_CHUNK, 1);
        arena.alloc(64, 1);
        assert_eq!(arena.chunk_count(), 2);
        assert!(arena.capacity() >= MIN_CHUNK * 3);
    }

    #[test]
    fn reset_is_o1_and_keeps_pages() {
        let mut arena = Arena::new(ArenaTag::Response);
        arena.alloc_copy(&[0u8; 9000]);
        let cap_before = arena.capacity();
        assert!(cap_before >= 9000);

        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.capacity(), cap_before);
        assert_eq!(arena.high_water(), 9000);

        // Reused chunks serve new allocations without growth.
        arena.alloc_copy(&[1u8; 1024]);
        assert_eq!(arena.capacity(), cap_before);
    }

    #[test]
    fn alignment_is_honored() {
        let arena = Arena::new(ArenaTag::Task);
        arena.alloc(3, 1);
        let p = arena.alloc(8, 8);
        assert_eq!(p.as_ptr() as usize % 8, 0);
        let p16 = arena.alloc(16, 16);
        assert_eq!(p16.as_ptr() as usize % 16, 0);
    }

    #[test]
    fn oversize_allocation_gets_dedicated_chunk() {
        let arena = Arena::new(ArenaTag::Static);
        let big = MIN_CHUNK * 10;
        let slice = arena.alloc_copy(&vec![7u8; big]);
        assert_eq!(slice.len(), big);
        assert!(arena.capacity() >= big);
    }

    #[test]
    fn arena_set_resets_request_pair() {
        let mut set = ArenaSet::new();
        set.request.alloc_copy(b"req");
        set.response.alloc_copy(b"resp");
        set.cache.alloc_copy(b"keep");

        set.reset_request_pair();
        assert_eq!(set.request.used(), 0);
        assert_eq!(set.response.used(), 0);
        assert_eq!(set.cache.used(), 4);
    }
}

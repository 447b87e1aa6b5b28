// src/memory/alloc.rs
//! Allocator facade.
//!
//! One process-wide backend decision at initialization, based on the
//! configured preference and what the build actually links. Every arena
//! allocation goes through here so live statistics stay truthful: when
//! the thread-caching backend is unavailable the facade falls back to
//! the system allocator and `stats()` reports `system`, never the wish.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::config::AllocatorPref;

/// Memory concerns the runtime separates into arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ArenaTag {
    Request = 0,
    Response = 1,
    Cache = 2,
    Static = 3,
    Task = 4,
}

pub const ARENA_TAGS: [ArenaTag; 5] = [
    ArenaTag::Request,
    ArenaTag::Response,
    ArenaTag::Cache,
    ArenaTag::Static,
    ArenaTag::Task,
];

impl ArenaTag {
    pub fn name(&self) -> &'static str {
        match self {
            ArenaTag::Request => "request",
            ArenaTag::Response => "response",
            ArenaTag::Cache => "cache",
            ArenaTag::Static => "static",
            ArenaTag::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backend {
    ThreadCaching,
    System,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::ThreadCaching => "thread-caching",
            Backend::System => "system",
        }
    }
}

const fn thread_caching_linked() -> bool {
    cfg!(feature = "perf")
}

static BACKEND: OnceLock<Backend> = OnceLock::new();
static AUTO_TUNE: AtomicBool = AtomicBool::new(false);

/// Decide the backend once. Later calls return the first decision; the
/// facade never switches mid-flight.
pub fn init(pref: AllocatorPref) -> Backend {
    *BACKEND.get_or_init(|| match pref {
        AllocatorPref::System => Backend::System,
        AllocatorPref::ThreadCaching | AllocatorPref::Auto => {
            if thread_caching_linked() {
                Backend::ThreadCaching
            } else {
                if pref == AllocatorPref::ThreadCaching {
                    tracing::debug!(
                        target: "catzilla::server",
                        "thread-caching allocator not linked, using system allocator"
                    );
                }
                Backend::System
            }
        }
    })
}

pub fn backend() -> Backend {
    *BACKEND.get_or_init(|| init_default())
}

fn init_default() -> Backend {
    if thread_caching_linked() {
        Backend::ThreadCaching
    } else {
        Backend::System
    }
}

pub fn set_auto_tuning(enabled: bool) {
    AUTO_TUNE.store(enabled, Ordering::Relaxed);
}

pub fn auto_tuning_enabled() -> bool {
    AUTO_TUNE.load(Ordering::Relaxed)
}

struct Counters {
    allocated: AtomicU64,
    active: AtomicU64,
    count: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Counters {
            allocated: AtomicU64::new(0),
            active: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

static TAG_COUNTERS: [Counters; 5] = [
    Counters::new(),
    Counters::new(),
    Counters::new(),
    Counters::new(),
    Counters::new(),
];

#[inline]
unsafe fn raw_alloc(layout: Layout) -> *mut u8 {
    match backend() {
        #[cfg(feature = "perf")]
        Backend::ThreadCaching => unsafe { mimalloc::MiMalloc.alloc(layout) },
        #[cfg(not(feature = "perf"))]
        Backend::ThreadCaching => unsafe { System.alloc(layout) },
        Backend::System => unsafe { System.alloc(layout) },
    }
}

#[inline]
unsafe fn raw_dealloc(ptr: *mut u8, layout: Layout) {
    match backend() {
        #[cfg(feature = "perf")]
        Backend::ThreadCaching => unsafe { mimalloc::MiMalloc.dealloc(ptr, layout) },
        #[cfg(not(feature = "perf"))]
        Backend::ThreadCaching => unsafe { System.dealloc(ptr, layout) },
        Backend::System => unsafe { System.dealloc(ptr, layout) },
    }
}

/// Allocate a block accounted to `tag`. Returns null on exhaustion; the
/// arena layer turns that into a panic-free growth failure.
pub fn alloc(tag: ArenaTag, layout: Layout) -> *mut u8 {
    let ptr = unsafe { raw_alloc(layout) };
    if !ptr.is_null() {
        let c = &TAG_COUNTERS[tag as usize];
        c.allocated.fetch_add(layout.size() as u64, Ordering::Relaxed);
        c.active.fetch_add(layout.size() as u64, Ordering::Relaxed);
        c.count.fetch_add(1, Ordering::Relaxed);
    }
    ptr
}

/// Resize a block in place where the backend can, falling back to
/// allocate-copy-free.
///
/// # Safety
/// `ptr` must come from `alloc(tag, layout)` with exactly that layout.
pub unsafe fn realloc(tag: ArenaTag, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_ptr = match backend() {
        #[cfg(feature = "perf")]
        Backend::ThreadCaching => unsafe { mimalloc::MiMalloc.realloc(ptr, layout, new_size) },
        #[cfg(not(feature = "perf"))]
        Backend::ThreadCaching => unsafe { System.realloc(ptr, layout, new_size) },
        Backend::System => unsafe { System.realloc(ptr, layout, new_size) },
    };
    if !new_ptr.is_null() {
        let c = &TAG_COUNTERS[tag as usize];
        c.allocated.fetch_add(new_size as u64, Ordering::Relaxed);
        c.active.fetch_add(new_size as u64, Ordering::Relaxed);
        c.active.fetch_sub(layout.size() as u64, Ordering::Relaxed);
        c.count.fetch_add(1, Ordering::Relaxed);
    }
    new_ptr
}

/// Free a block previously obtained from `alloc` with the same layout.
///
/// # Safety
/// `ptr` must come from `alloc(tag, layout)` and not be freed twice.
pub unsafe fn free(tag: ArenaTag, ptr: *mut u8, layout: Layout) {
    unsafe { raw_dealloc(ptr, layout) };
    let c = &TAG_COUNTERS[tag as usize];
    c.active.fetch_sub(layout.size() as u64, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct TagStats {
    pub arena: &'static str,
    pub allocated_bytes: u64,
    pub active_bytes: u64,
    pub allocation_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocStats {
    pub backend: &'static str,
    pub allocated_bytes: u64,
    pub active_bytes: u64,
    pub allocation_count: u64,
    /// Share of historically allocated bytes no longer live. A coarse
    /// fragmentation signal, not an exact heap measurement.
    pub fragmentation_ratio: f64,
    pub auto_tuning: bool,
    pub arenas: Vec<TagStats>,
}

pub fn stats() -> AllocStats {
    let mut allocated = 0u64;
    let mut active = 0u64;
    let mut count = 0u64;
    let mut arenas = Vec::with_capacity(ARENA_TAGS.len());
    for tag in ARENA_TAGS {
        let c = &TAG_COUNTERS[tag as usize];
        let a = c.allocated.load(Ordering::Relaxed);
        let l = c.active.load(Ordering::Relaxed);
        let n = c.count.load(Ordering::Relaxed);
        allocated += a;
        active += l;
        count += n;
        arenas.push(TagStats {
            arena: tag.name(),
            allocated_bytes: a,
            active_bytes: l,
            allocation_count: n,
        });
    }
    let fragmentation_ratio = if allocated == 0 {
        0.0
    } else {
        (allocated - active) as f64 / allocated as f64
    };
    AllocStats {
        backend: backend().as_str(),
        allocated_bytes: allocated,
        active_bytes: active,
        allocation_count: count,
        fragmentation_ratio,
        auto_tuning: auto_tuning_enabled(),
        arenas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip_updates_stats() {
        // Counters are process-global and tests run in parallel, so only
        // the monotonic counters are asserted exactly enough to matter.
        let before = stats();
        let layout = Layout::from_size_align(256, 8).unwrap();
        let ptr = alloc(ArenaTag::Task, layout);
        assert!(!ptr.is_null());

        let during = stats();
        assert!(during.allocated_bytes >= before.allocated_bytes + 256);
        assert!(during.allocation_count >= before.allocation_count + 1);

        unsafe { free(ArenaTag::Task, ptr, layout) };
        let after = stats();
        assert!(after.allocated_bytes >= during.allocated_bytes);
        assert!(after.fragmentation_ratio >= 0.0 && after.fragmentation_ratio <= 1.0);
    }

    #[test]
    fn backend_reports_what_is_linked() {
        let b = backend();
        if cfg!(feature = "perf") {
            assert_eq!(b.as_str(), "thread-caching");
        } else {
            assert_eq!(b.as_str(), "system");
        }
    }

    #[test]
    fn tag_names_are_stable() {
        let names: Vec<&str> = ARENA_TAGS.iter().map(|t| t.name()).collect();
        assert_eq!(names, ["request", "response", "cache", "static", "task"]);
    }
}

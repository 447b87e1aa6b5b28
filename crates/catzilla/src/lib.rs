// src/lib.rs
//! Catzilla runtime core: a native-speed HTTP engine with a per-core
//! reactor loop, a radix-trie router with per-method dispatch, ordered
//! middleware chains, a multi-level cache, arena-scoped request memory,
//! static file serving, and a background task executor.

pub mod banner;
pub mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod runtime;
pub mod server;
pub mod services;
pub mod slab;
pub mod static_files;
pub mod syscalls;
pub mod tasks;
pub mod worker;

// Re-exports for users
pub use cache::{CacheConfig, CacheStatsSnapshot, L1Cache, MultiLevelCache};
pub use config::{AllocatorPref, Config, Mode};
pub use error::{CatzillaError, CatzillaResult, ErrorKind, ErrorTable};
pub use http::{Body, Context, Method, Request, Response};
pub use logging::{init_logging, init_logging_json};
pub use memory::{Arena, ArenaSet, ArenaTag};
pub use middleware::{MiddlewareEngine, MiddlewareSpec};
pub use router::{RouteDef, Router};
pub use runtime::Runtime;
pub use server::Server;
pub use services::ServiceRegistry;
pub use static_files::{StaticMountConfig, StaticServer};
pub use tasks::{Priority, TaskDescriptor, TaskExecutor, TaskId, TaskState};

/// Thread-caching global allocator, linked when the `perf` feature is
/// enabled. The facade in `memory::alloc` reports it truthfully.
#[cfg(feature = "perf")]
#[global_allocator]
static GLOBAL_ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

// src/runtime.rs
use std::sync::{Arc, OnceLock};

use crate::cache::{CacheConfig, MultiLevelCache};
use crate::config::Config;
use crate::error::{CatzillaResult, ErrorTable};
use crate::memory::alloc::{self, AllocStats, Backend};
use crate::middleware::MiddlewareEngine;
use crate::router::Router;
use crate::services::ServiceRegistry;
use crate::static_files::StaticServer;
use crate::tasks::{ExecutorConfig, TaskExecutor};

/// Explicitly constructed owner of every runtime subsystem: router,
/// middleware chains, error table, cache tiers, static mounts, task
/// executor, and service registry. Built mutable during registration,
/// then frozen behind an `Arc` for the serving phase.
pub struct Runtime {
    pub config: Config,
    pub router: Router,
    pub middleware: MiddlewareEngine,
    pub errors: ErrorTable,
    pub cache: MultiLevelCache,
    pub statics: StaticServer,
    pub tasks: TaskExecutor,
    pub services: ServiceRegistry,
    allocator_backend: Backend,
}

impl Runtime {
    pub fn new(config: Config) -> CatzillaResult<Self> {
        let allocator_backend = alloc::init(config.allocator);

        let cache_config = match &config.cache_dir {
            Some(dir) => CacheConfig::with_disk(dir.clone()),
            None => CacheConfig::memory_only(),
        };

        Ok(Runtime {
            errors: ErrorTable::new(config.mode),
            cache: MultiLevelCache::new(cache_config),
            router: Router::new(),
            middleware: MiddlewareEngine::new(),
            statics: StaticServer::new(),
            tasks: TaskExecutor::new(ExecutorConfig::default()),
            services: ServiceRegistry::new(),
            allocator_backend,
            config,
        })
    }

    pub fn with_defaults() -> CatzillaResult<Self> {
        Runtime::new(Config::from_env()?)
    }

    pub fn allocator_backend(&self) -> Backend {
        self.allocator_backend
    }

    /// Live memory statistics from the allocator facade.
    pub fn memory_stats(&self) -> AllocStats {
        alloc::stats()
    }
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Install the process-wide convenience handle. A thin wrapper over the
/// explicit value: first install wins, later calls return the resident.
pub fn install_global(runtime: Arc<Runtime>) -> Arc<Runtime> {
    GLOBAL.get_or_init(|| runtime).clone()
}

pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.get().cloned()
}

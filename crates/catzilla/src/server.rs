// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::banner::{BannerInfo, print_banner};
use crate::error::{CatzillaError, CatzillaResult};
use crate::metrics::WorkerMetrics;
use crate::runtime::Runtime;
use crate::syscalls;
use crate::worker::Worker;

/// Multi-reactor server front. Each worker thread binds its own
/// SO_REUSEPORT listener, is pinned to a core where possible, and runs
/// one reactor; the threads share nothing but the frozen `Runtime`.
pub struct Server {
    runtime: Arc<Runtime>,
}

impl Server {
    pub fn new(runtime: Runtime) -> Self {
        Server {
            runtime: Arc::new(runtime),
        }
    }

    pub fn from_arc(runtime: Arc<Runtime>) -> Self {
        Server { runtime }
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }

    /// Run until SIGINT/SIGTERM, then drain in-flight responses up to
    /// the grace deadline and return.
    pub fn serve(self) -> CatzillaResult<()> {
        let config = &self.runtime.config;
        let workers = config.workers.max(1);
        let bind_addr = config.server_addr();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_signal = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!(target: "catzilla::server", "shutdown signal, draining");
            shutdown_signal.store(true, Ordering::Release);
        })
        .map_err(|e| CatzillaError::Config(format!("cannot install signal handler: {e}")))?;

        let worker_metrics: Vec<Arc<WorkerMetrics>> =
            (0..workers).map(|_| Arc::new(WorkerMetrics::new())).collect();

        print_banner(config, &BannerInfo {
            bind_addr: &bind_addr,
            workers,
            allocator_backend: self.runtime.allocator_backend().as_str(),
            cache_l1: true,
            cache_l2: self.runtime.cache.has_disk_tier(),
            static_mounts: self.runtime.statics.mount_count(),
        });

        self.spawn_metrics_reporter(&worker_metrics, shutdown.clone());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(workers);

        for i in 0..workers {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let runtime = self.runtime.clone();
            let metrics = worker_metrics[i].clone();
            let shutdown = shutdown.clone();
            let host = runtime.config.host.clone();
            let port = runtime.config.port;

            let handle = thread::Builder::new()
                .name(format!("catzilla-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    match syscalls::create_listener(&host, port) {
                        Ok(listen_fd) => {
                            let mut worker = Worker::new(i, runtime, metrics, listen_fd);
                            if let Err(e) = worker.run(shutdown) {
                                tracing::error!(
                                    target: "catzilla::server",
                                    worker = i,
                                    error = %e,
                                    "reactor exited with error"
                                );
                            }
                            syscalls::close_fd(listen_fd);
                        }
                        Err(e) => {
                            tracing::error!(
                                target: "catzilla::server",
                                worker = i,
                                error = %e,
                                "failed to bind listener"
                            );
                        }
                    }
                })
                .map_err(CatzillaError::Io)?;
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        self.runtime.tasks.shutdown();
        tracing::info!(target: "catzilla::server", "server stopped");
        Ok(())
    }

    fn spawn_metrics_reporter(
        &self,
        worker_metrics: &[Arc<WorkerMetrics>],
        shutdown: Arc<AtomicBool>,
    ) {
        let metrics: Vec<Arc<WorkerMetrics>> = worker_metrics.to_vec();
        let runtime = self.runtime.clone();
        thread::Builder::new()
            .name("catzilla-metrics".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    thread::sleep(std::time::Duration::from_secs(5));
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let mut requests = 0;
                    let mut active = 0;
                    for m in &metrics {
                        let snap = m.snapshot();
                        requests += snap.requests;
                        active += snap.active_connections;
                    }
                    let cache = runtime.cache.stats();
                    let tasks = runtime.tasks.stats();
                    tracing::debug!(
                        target: "catzilla::server",
                        requests,
                        active_connections = active,
                        cache_hits = cache.hits,
                        cache_misses = cache.misses,
                        task_queue_depth = tasks.queue_depths.iter().sum::<usize>(),
                        task_workers = tasks.workers,
                        "periodic metrics"
                    );
                }
            })
            .ok();
    }
}

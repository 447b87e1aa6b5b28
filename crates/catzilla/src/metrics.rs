// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Per-reactor counters. Relaxed ordering everywhere; snapshots are
/// eventually consistent by design.
pub struct WorkerMetrics {
    pub req_count: AtomicU64,
    pub active_conns: AtomicU64,
    pub bytes_tx: AtomicU64,
    status_classes: [AtomicU64; 5],
    latency: LatencyWindow,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        WorkerMetrics {
            req_count: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            status_classes: Default::default(),
            latency: LatencyWindow::new(),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_tx.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_response(&self, status: u16, micros: u64) {
        let class = (status / 100).clamp(1, 5) as usize - 1;
        self.status_classes[class].fetch_add(1, Ordering::Relaxed);
        self.latency.record(micros);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let classes: Vec<u64> = self
            .status_classes
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let (p50, p95, p99) = self.latency.percentiles();
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            active_connections: self.active_conns.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            status_1xx: classes[0],
            status_2xx: classes[1],
            status_3xx: classes[2],
            status_4xx: classes[3],
            status_5xx: classes[4],
            latency_p50_us: p50,
            latency_p95_us: p95,
            latency_p99_us: p99,
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub active_connections: u64,
    pub bytes_tx: u64,
    pub status_1xx: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
}

const WINDOW: usize = 2048;

/// Rolling latency window. A fixed ring of recent samples; percentile
/// queries sort a copy, which is fine at snapshot frequency.
struct LatencyWindow {
    samples: Mutex<WindowState>,
}

struct WindowState {
    ring: Box<[u64; WINDOW]>,
    next: usize,
    filled: usize,
}

impl LatencyWindow {
    fn new() -> Self {
        LatencyWindow {
            samples: Mutex::new(WindowState {
                ring: Box::new([0; WINDOW]),
                next: 0,
                filled: 0,
            }),
        }
    }

    fn record(&self, micros: u64) {
        let mut state = self.samples.lock();
        let next = state.next;
        state.ring[next] = micros;
        state.next = (next + 1) % WINDOW;
        state.filled = (state.filled + 1).min(WINDOW);
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        let state = self.samples.lock();
        if state.filled == 0 {
            return (0, 0, 0);
        }
        let mut sorted: Vec<u64> = state.ring[..state.filled].to_vec();
        drop(state);
        sorted.sort_unstable();
        let pick = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_are_counted() {
        let m = WorkerMetrics::new();
        m.record_response(200, 100);
        m.record_response(201, 100);
        m.record_response(404, 100);
        m.record_response(500, 100);

        let snap = m.snapshot();
        assert_eq!(snap.status_2xx, 2);
        assert_eq!(snap.status_4xx, 1);
        assert_eq!(snap.status_5xx, 1);
        assert_eq!(snap.status_1xx, 0);
    }

    #[test]
    fn percentiles_over_uniform_samples() {
        let m = WorkerMetrics::new();
        for i in 1..=100u64 {
            m.record_response(200, i * 10);
        }
        let snap = m.snapshot();
        assert!(snap.latency_p50_us >= 400 && snap.latency_p50_us <= 600);
        assert!(snap.latency_p95_us >= 900);
        assert!(snap.latency_p99_us >= snap.latency_p95_us);
    }

    #[test]
    fn connection_gauge_moves_both_ways() {
        let m = WorkerMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        assert_eq!(m.snapshot().active_connections, 1);
    }
}

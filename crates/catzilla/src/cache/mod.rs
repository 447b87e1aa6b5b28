// src/cache/mod.rs
pub mod disk;

use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::cache::disk::{DiskCache, DiskEntry};

pub const NIL: i32 = -1;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bucket table sizing hint.
    pub max_entries: usize,
    /// Eviction threshold over key+value bytes held.
    pub capacity_bytes: usize,
    /// Applied when `set` is called without an explicit TTL.
    pub default_ttl: Option<Duration>,
    /// Values at or above this size are transparently gzip-compressed.
    /// `None` disables compression.
    pub compression_threshold: Option<usize>,
    /// Root directory for the disk tier. `None` keeps the cache L1-only.
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 16 * 1024,
            capacity_bytes: 64 * 1024 * 1024,
            default_ttl: None,
            compression_threshold: Some(4 * 1024),
            disk_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn memory_only() -> Self {
        CacheConfig::default()
    }

    pub fn with_disk(dir: impl Into<PathBuf>) -> Self {
        CacheConfig {
            disk_dir: Some(dir.into()),
            ..CacheConfig::default()
        }
    }
}

/// Monotonic operation counters plus two gauges. Counters only move
/// forward; `reset` is explicit and rare.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    insertions: AtomicU64,
    expirations: AtomicU64,
    compressions: AtomicU64,
    decompressions: AtomicU64,
    current_size: AtomicU64,
    current_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub expirations: u64,
    pub compressions: u64,
    pub decompressions: u64,
    pub current_size: u64,
    pub current_count: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            decompressions: self.decompressions.load(Ordering::Relaxed),
            current_size: self.current_size.load(Ordering::Relaxed),
            current_count: self.current_count.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.insertions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.compressions.store(0, Ordering::Relaxed);
        self.decompressions.store(0, Ordering::Relaxed);
    }
}

pub fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

struct Slot {
    key: Vec<u8>,
    value: Vec<u8>,
    hash: u64,
    created_ns: u64,
    /// 0 means no expiry.
    expires_ns: u64,
    compressed: bool,
    charge: usize,
    occupied: bool,
    bucket_next: i32,
    lru_prev: i32,
    lru_next: i32,
}

struct Store {
    slots: Vec<Slot>,
    free: Vec<u32>,
    buckets: Box<[i32]>,
    mask: usize,
    lru_head: i32,
    lru_tail: i32,
    total_bytes: usize,
}

impl Store {
    fn new(max_entries: usize) -> Self {
        let bucket_count = max_entries.next_power_of_two().max(16);
        Store {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![NIL; bucket_count].into_boxed_slice(),
            mask: bucket_count - 1,
            lru_head: NIL,
            lru_tail: NIL,
            total_bytes: 0,
        }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    fn find(&self, key: &[u8], hash: u64) -> Option<u32> {
        let mut idx = self.buckets[self.bucket_of(hash)];
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if slot.hash == hash && slot.key == key {
                return Some(idx as u32);
            }
            idx = slot.bucket_next;
        }
        None
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.lru_prev, slot.lru_next)
        };
        if prev != NIL {
            self.slots[prev as usize].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.slots[next as usize].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        let slot = &mut self.slots[idx as usize];
        slot.lru_prev = NIL;
        slot.lru_next = NIL;
    }

    fn lru_push_front(&mut self, idx: u32) {
        let old_head = self.lru_head;
        {
            let slot = &mut self.slots[idx as usize];
            slot.lru_prev = NIL;
            slot.lru_next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head as usize].lru_prev = idx as i32;
        } else {
            self.lru_tail = idx as i32;
        }
        self.lru_head = idx as i32;
    }

    fn touch(&mut self, idx: u32) {
        if self.lru_head != idx as i32 {
            self.lru_unlink(idx);
            self.lru_push_front(idx);
        }
    }

    fn bucket_unlink(&mut self, idx: u32) {
        let hash = self.slots[idx as usize].hash;
        let bucket = self.bucket_of(hash);
        let mut cursor = self.buckets[bucket];
        if cursor == idx as i32 {
            self.buckets[bucket] = self.slots[idx as usize].bucket_next;
            return;
        }
        while cursor != NIL {
            let next = self.slots[cursor as usize].bucket_next;
            if next == idx as i32 {
                self.slots[cursor as usize].bucket_next =
                    self.slots[idx as usize].bucket_next;
                return;
            }
            cursor = next;
        }
    }

    /// Unlink from bucket and LRU, release the charge, recycle the slot.
    fn remove(&mut self, idx: u32) {
        self.bucket_unlink(idx);
        self.lru_unlink(idx);
        let slot = &mut self.slots[idx as usize];
        self.total_bytes -= slot.charge;
        slot.occupied = false;
        slot.key = Vec::new();
        slot.value = Vec::new();
        self.free.push(idx);
    }

    fn acquire_slot(&mut self) -> u32 {
        if let Some(idx) = self.free.pop() {
            return idx;
        }
        self.slots.push(Slot {
            key: Vec::new(),
            value: Vec::new(),
            hash: 0,
            created_ns: 0,
            expires_ns: 0,
            compressed: false,
            charge: 0,
            occupied: false,
            bucket_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        });
        (self.slots.len() - 1) as u32
    }
}

/// In-process cache tier: hash table with per-bucket chaining, a global
/// LRU list, TTL expiry treated as a miss, and size-bounded eviction
/// from the LRU tail. Writers and readers share one lock; all counters
/// are atomics outside it.
pub struct L1Cache {
    config: CacheConfig,
    store: RwLock<Store>,
    stats: CacheStats,
}

impl L1Cache {
    pub fn new(config: CacheConfig) -> Self {
        let store = Store::new(config.max_entries);
        L1Cache {
            config,
            store: RwLock::new(store),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a key. Expired entries count as a miss and are removed.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = hash_key(key);
        let now = now_unix_ns();

        let (raw, compressed) = {
            let mut store = self.store.write();
            let Some(idx) = store.find(key, hash) else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            let slot = &store.slots[idx as usize];
            if slot.expires_ns != 0 && slot.expires_ns <= now {
                store.remove(idx);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.sync_gauges(&store);
                return None;
            }
            let out = (slot.value.clone(), slot.compressed);
            store.touch(idx);
            out
        };

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        if compressed {
            self.stats.decompressions.fetch_add(1, Ordering::Relaxed);
            match gunzip(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(target: "catzilla::cache", error = %e, "corrupt compressed entry");
                    self.delete(key);
                    None
                }
            }
        } else {
            Some(raw)
        }
    }

    /// Insert or replace. Evicts from the LRU tail until the new entry
    /// fits the byte capacity.
    pub fn set(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let (stored, compressed) = self.maybe_compress(value);
        self.set_raw(key, stored, compressed, ttl);
    }

    /// Insert a value that is already in its stored representation.
    pub(crate) fn set_raw(
        &self,
        key: &[u8],
        stored: Vec<u8>,
        compressed: bool,
        ttl: Option<Duration>,
    ) {
        let hash = hash_key(key);
        let now = now_unix_ns();
        let expires_ns = ttl
            .or(self.config.default_ttl)
            .map(|d| now + d.as_nanos() as u64)
            .unwrap_or(0);
        let charge = key.len() + stored.len();

        if charge > self.config.capacity_bytes {
            tracing::debug!(
                target: "catzilla::cache",
                charge,
                capacity = self.config.capacity_bytes,
                "entry larger than cache capacity, skipped"
            );
            return;
        }

        let mut store = self.store.write();

        if let Some(idx) = store.find(key, hash) {
            let old_charge = store.slots[idx as usize].charge;
            store.total_bytes -= old_charge;
            let slot = &mut store.slots[idx as usize];
            slot.value = stored;
            slot.created_ns = now;
            slot.expires_ns = expires_ns;
            slot.compressed = compressed;
            slot.charge = charge;
            store.total_bytes += charge;
            store.touch(idx);
        } else {
            while store.total_bytes + charge > self.config.capacity_bytes
                && store.lru_tail != NIL
            {
                let tail = store.lru_tail as u32;
                store.remove(tail);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }

            let idx = store.acquire_slot();
            let bucket = store.bucket_of(hash);
            let head = store.buckets[bucket];
            {
                let slot = &mut store.slots[idx as usize];
                slot.key = key.to_vec();
                slot.value = stored;
                slot.hash = hash;
                slot.created_ns = now;
                slot.expires_ns = expires_ns;
                slot.compressed = compressed;
                slot.charge = charge;
                slot.occupied = true;
                slot.bucket_next = head;
            }
            store.buckets[bucket] = idx as i32;
            store.total_bytes += charge;
            store.lru_push_front(idx);
        }

        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        self.sync_gauges(&store);
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        let mut store = self.store.write();
        match store.find(key, hash) {
            Some(idx) => {
                store.remove(idx);
                self.sync_gauges(&store);
                true
            }
            None => false,
        }
    }

    /// Presence check honoring TTL, without disturbing LRU order.
    pub fn exists(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        let store = self.store.read();
        match store.find(key, hash) {
            Some(idx) => {
                let slot = &store.slots[idx as usize];
                slot.expires_ns == 0 || slot.expires_ns > now_unix_ns()
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut store = self.store.write();
        *store = Store::new(self.config.max_entries);
        drop(store);
        self.stats.current_size.store(0, Ordering::Relaxed);
        self.stats.current_count.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn maybe_compress(&self, value: Vec<u8>) -> (Vec<u8>, bool) {
        if let Some(threshold) = self.config.compression_threshold
            && value.len() >= threshold
        {
            let packed = gzip(&value);
            if packed.len() < value.len() {
                self.stats.compressions.fetch_add(1, Ordering::Relaxed);
                return (packed, true);
            }
        }
        (value, false)
    }

    fn sync_gauges(&self, store: &Store) {
        self.stats
            .current_size
            .store(store.total_bytes as u64, Ordering::Relaxed);
        let count = (store.slots.len() - store.free.len()) as u64;
        self.stats.current_count.store(count, Ordering::Relaxed);
    }
}

/// L1 + optional on-disk L2. L2 failures degrade the cache to L1-only
/// with a warning; they never surface to the caller.
pub struct MultiLevelCache {
    l1: L1Cache,
    l2: Option<DiskCache>,
    l2_broken: AtomicBool,
}

impl MultiLevelCache {
    pub fn new(config: CacheConfig) -> Self {
        let l2 = match &config.disk_dir {
            Some(dir) => match DiskCache::open(dir) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    tracing::warn!(
                        target: "catzilla::cache",
                        error = %e,
                        dir = %dir.display(),
                        "disk cache unavailable, running L1-only"
                    );
                    None
                }
            },
            None => None,
        };
        MultiLevelCache {
            l1: L1Cache::new(config),
            l2,
            l2_broken: AtomicBool::new(false),
        }
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    pub fn has_disk_tier(&self) -> bool {
        self.l2.is_some() && !self.l2_broken.load(Ordering::Relaxed)
    }

    fn l2(&self) -> Option<&DiskCache> {
        if self.l2_broken.load(Ordering::Relaxed) {
            return None;
        }
        self.l2.as_ref()
    }

    fn degrade_l2(&self, op: &str, error: &std::io::Error) {
        tracing::warn!(
            target: "catzilla::cache",
            %op,
            %error,
            "disk cache error, degrading to L1-only"
        );
        self.l2_broken.store(true, Ordering::Relaxed);
    }

    /// L1 first; on miss the disk tier is consulted and a hit promoted.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.l1.get(key) {
            return Some(value);
        }
        let disk = self.l2()?;
        match disk.read(key) {
            Ok(Some(entry)) => {
                let ttl = remaining_ttl(entry.expires_ns);
                if entry.expires_ns != 0 && ttl.is_none() {
                    return None;
                }
                // Promote in stored form; decode only for the caller.
                self.l1
                    .set_raw(key, entry.value.clone(), entry.compressed, ttl);
                if entry.compressed {
                    gunzip(&entry.value).ok()
                } else {
                    Some(entry.value)
                }
            }
            Ok(None) => None,
            Err(e) => {
                self.degrade_l2("read", &e);
                None
            }
        }
    }

    pub fn set(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let (stored, compressed) = self.l1.maybe_compress(value);
        let now = now_unix_ns();
        let expires_ns = ttl
            .or(self.l1.config.default_ttl)
            .map(|d| now + d.as_nanos() as u64)
            .unwrap_or(0);
        self.l1.set_raw(key, stored.clone(), compressed, ttl);

        if let Some(disk) = self.l2() {
            let entry = DiskEntry {
                key: key.to_vec(),
                value: stored,
                created_ns: now,
                expires_ns,
                compressed,
            };
            if let Err(e) = disk.write(&entry) {
                self.degrade_l2("write", &e);
            }
        }
    }

    /// Explicit delete removes from both tiers.
    pub fn delete(&self, key: &[u8]) -> bool {
        let in_l1 = self.l1.delete(key);
        let in_l2 = match self.l2() {
            Some(disk) => match disk.delete(key) {
                Ok(found) => found,
                Err(e) => {
                    self.degrade_l2("delete", &e);
                    false
                }
            },
            None => false,
        };
        in_l1 || in_l2
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        if self.l1.exists(key) {
            return true;
        }
        match self.l2() {
            Some(disk) => matches!(disk.read(key), Ok(Some(_))),
            None => false,
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.l1.stats()
    }
}

fn remaining_ttl(expires_ns: u64) -> Option<Duration> {
    if expires_ns == 0 {
        return None;
    }
    let now = now_unix_ns();
    if expires_ns <= now {
        return None;
    }
    Some(Duration::from_nanos(expires_ns - now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(capacity_bytes: usize) -> L1Cache {
        L1Cache::new(CacheConfig {
            max_entries: 64,
            capacity_bytes,
            default_ttl: None,
            compression_threshold: None,
            disk_dir: None,
        })
    }

    #[test]
    fn set_get_delete_round_trip() {
        let cache = small_cache(1024);
        cache.set(b"k", b"v".to_vec(), None);
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
        assert!(cache.exists(b"k"));
        assert!(cache.delete(b"k"));
        assert_eq!(cache.get(b"k"), None);
        assert!(!cache.exists(b"k"));
        assert!(!cache.delete(b"k"));
    }

    #[test]
    fn ttl_expiry_counts_as_miss_and_expiry() {
        let cache = small_cache(1024);
        cache.set(b"k", b"v".to_vec(), Some(Duration::from_millis(50)));
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(b"k"), None);
        assert!(!cache.exists(b"k"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn lru_eviction_evicts_exactly_enough() {
        // Each entry charges key(2) + value(10) = 12 bytes.
        let cache = small_cache(36);
        cache.set(b"k1", vec![1u8; 10], None);
        cache.set(b"k2", vec![2u8; 10], None);
        cache.set(b"k3", vec![3u8; 10], None);
        assert_eq!(cache.stats().current_count, 3);

        // Touch k1 so k2 becomes the LRU tail.
        assert!(cache.get(b"k1").is_some());

        cache.set(b"k4", vec![4u8; 10], None);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.current_count, 3);
        assert_eq!(cache.get(b"k2"), None);
        assert!(cache.get(b"k1").is_some());
        assert!(cache.get(b"k3").is_some());
        assert!(cache.get(b"k4").is_some());
    }

    #[test]
    fn replace_updates_charge_without_eviction() {
        let cache = small_cache(64);
        cache.set(b"k", vec![0u8; 20], None);
        let size_before = cache.stats().current_size;
        cache.set(b"k", vec![0u8; 10], None);
        let stats = cache.stats();
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.current_size, size_before - 10);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn compression_round_trips_above_threshold() {
        let cache = L1Cache::new(CacheConfig {
            max_entries: 16,
            capacity_bytes: 1024 * 1024,
            default_ttl: None,
            compression_threshold: Some(64),
            disk_dir: None,
        });
        let value = vec![b'a'; 8 * 1024];
        cache.set(b"big", value.clone(), None);
        assert_eq!(cache.get(b"big"), Some(value));

        let stats = cache.stats();
        assert_eq!(stats.compressions, 1);
        assert_eq!(stats.decompressions, 1);
        // Stored size reflects the compressed representation.
        assert!(stats.current_size < 8 * 1024);

        // Small values stay uncompressed.
        cache.set(b"small", b"tiny".to_vec(), None);
        assert_eq!(cache.stats().compressions, 1);
    }

    #[test]
    fn multi_level_promotes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MultiLevelCache::new(CacheConfig::with_disk(dir.path()));
        cache.set(b"k", b"value".to_vec(), None);

        // A second cache over the same directory starts with a cold L1
        // and must fill it from disk.
        let cold = MultiLevelCache::new(CacheConfig::with_disk(dir.path()));
        assert_eq!(cold.get(b"k"), Some(b"value".to_vec()));
        // The promotion made the next read an L1 hit.
        assert_eq!(cold.get(b"k"), Some(b"value".to_vec()));
        assert!(cold.l1().stats().hits >= 1);
    }

    #[test]
    fn l1_eviction_leaves_disk_intact() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_entries: 16,
            capacity_bytes: 32,
            default_ttl: None,
            compression_threshold: None,
            disk_dir: Some(dir.path().to_path_buf()),
        };
        let cache = MultiLevelCache::new(config);
        cache.set(b"a", vec![1u8; 20], None);
        cache.set(b"b", vec![2u8; 20], None); // evicts "a" from L1

        // "a" is gone from L1 but promoted back from L2.
        assert_eq!(cache.get(b"a"), Some(vec![1u8; 20]));
    }

    #[test]
    fn delete_removes_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MultiLevelCache::new(CacheConfig::with_disk(dir.path()));
        cache.set(b"k", b"v".to_vec(), None);
        assert!(cache.delete(b"k"));
        assert_eq!(cache.get(b"k"), None);

        let cold = MultiLevelCache::new(CacheConfig::with_disk(dir.path()));
        assert_eq!(cold.get(b"k"), None);
    }

    #[test]
    fn stats_reset_clears_counters_not_gauges() {
        let cache = small_cache(1024);
        cache.set(b"k", b"v".to_vec(), None);
        cache.get(b"k");
        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.insertions, 0);
        assert_eq!(stats.current_count, 1);
    }
}

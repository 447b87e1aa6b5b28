// src/static_files.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::cache::gzip;
use crate::error::{CatzillaError, CatzillaResult, ErrorKind};
use crate::http::{Request, Response};

#[derive(Debug, Clone)]
pub struct StaticMountConfig {
    /// URL prefix, e.g. `/static`.
    pub prefix: String,
    /// Filesystem root; canonicalized at mount time.
    pub root: PathBuf,
    pub index_file: String,
    /// Hot-file cache for this mount.
    pub cache_enabled: bool,
    /// Negotiate gzip for cacheable files at or above `compression_min_size`.
    pub compression: bool,
    pub compression_min_size: usize,
    pub etag: bool,
    pub range: bool,
    pub allow_hidden: bool,
    /// Files above this size bypass the hot cache and compression.
    pub max_file_size: u64,
    pub directory_listing: bool,
}

impl StaticMountConfig {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        StaticMountConfig {
            prefix: crate::router::normalize_path(&prefix.into()),
            root: root.into(),
            index_file: "index.html".to_string(),
            cache_enabled: true,
            compression: true,
            compression_min_size: 1024,
            etag: true,
            range: true,
            allow_hidden: false,
            max_file_size: 64 * 1024 * 1024,
            directory_listing: false,
        }
    }
}

struct StaticMount {
    config: StaticMountConfig,
    canonical_root: PathBuf,
}

struct HotEntry {
    bytes: Arc<Vec<u8>>,
    gzipped: Option<Arc<Vec<u8>>>,
    mtime: SystemTime,
    last_used: Instant,
}

/// Hot-file cache keyed by canonical path, invalidated on mtime change.
struct HotCache {
    entries: RwLock<FxHashMap<PathBuf, HotEntry>>,
    total_bytes: AtomicUsize,
    capacity_bytes: usize,
}

impl HotCache {
    fn new(capacity_bytes: usize) -> Self {
        HotCache {
            entries: RwLock::new(FxHashMap::default()),
            total_bytes: AtomicUsize::new(0),
            capacity_bytes,
        }
    }

    fn get(&self, path: &Path, mtime: SystemTime) -> Option<(Arc<Vec<u8>>, Option<Arc<Vec<u8>>>)> {
        let mut entries = self.entries.write();
        match entries.get_mut(path) {
            Some(entry) if entry.mtime == mtime => {
                entry.last_used = Instant::now();
                Some((entry.bytes.clone(), entry.gzipped.clone()))
            }
            Some(entry) => {
                let stale = entry.bytes.len()
                    + entry.gzipped.as_ref().map_or(0, |g| g.len());
                entries.remove(path);
                self.total_bytes.fetch_sub(stale, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    fn insert(
        &self,
        path: PathBuf,
        mtime: SystemTime,
        bytes: Arc<Vec<u8>>,
        gzipped: Option<Arc<Vec<u8>>>,
    ) {
        let charge = bytes.len() + gzipped.as_ref().map_or(0, |g| g.len());
        if charge > self.capacity_bytes {
            return;
        }
        let mut entries = self.entries.write();
        while self.total_bytes.load(Ordering::Relaxed) + charge > self.capacity_bytes {
            // Evict the least recently used entry.
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p.clone());
            match victim {
                Some(victim) => {
                    if let Some(old) = entries.remove(&victim) {
                        let freed =
                            old.bytes.len() + old.gzipped.as_ref().map_or(0, |g| g.len());
                        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
        if let Some(old) = entries.insert(
            path,
            HotEntry {
                bytes,
                gzipped,
                mtime,
                last_used: Instant::now(),
            },
        ) {
            let freed = old.bytes.len() + old.gzipped.as_ref().map_or(0, |g| g.len());
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(charge, Ordering::Relaxed);
    }
}

/// Mount table plus the shared hot-file cache.
///
/// Security contract for every served request: after canonicalization
/// the target must be a descendant of the mount root, must not traverse
/// a symlink out of it, and must pass the hidden-file policy. Violations
/// answer 403, never 500.
pub struct StaticServer {
    mounts: Vec<StaticMount>,
    hot: HotCache,
    hot_hits: AtomicU64,
    hot_misses: AtomicU64,
}

impl StaticServer {
    pub fn new() -> Self {
        StaticServer::with_hot_capacity(128 * 1024 * 1024)
    }

    pub fn with_hot_capacity(capacity_bytes: usize) -> Self {
        StaticServer {
            mounts: Vec::new(),
            hot: HotCache::new(capacity_bytes),
            hot_hits: AtomicU64::new(0),
            hot_misses: AtomicU64::new(0),
        }
    }

    /// Register a mount. The filesystem root must exist; it is
    /// canonicalized once here and every served path is checked against
    /// the canonical form.
    pub fn mount(&mut self, config: StaticMountConfig) -> CatzillaResult<()> {
        let canonical_root = fs::canonicalize(&config.root).map_err(|e| {
            CatzillaError::Config(format!(
                "static root '{}' unusable: {e}",
                config.root.display()
            ))
        })?;
        tracing::debug!(
            target: "catzilla::static",
            prefix = %config.prefix,
            root = %canonical_root.display(),
            "static mount registered"
        );
        self.mounts.push(StaticMount {
            config,
            canonical_root,
        });
        // Longest prefix binds first.
        self.mounts
            .sort_by(|a, b| b.config.prefix.len().cmp(&a.config.prefix.len()));
        Ok(())
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn hot_hit_rate(&self) -> (u64, u64) {
        (
            self.hot_hits.load(Ordering::Relaxed),
            self.hot_misses.load(Ordering::Relaxed),
        )
    }

    fn mount_for(&self, path: &str) -> Option<&StaticMount> {
        self.mounts.iter().find(|m| {
            let prefix = m.config.prefix.as_str();
            if prefix == "/" {
                return true;
            }
            path == prefix
                || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }

    /// Serve a request if its path falls under a mount. `None` means the
    /// path belongs to the router, not the static tree.
    pub fn serve(&self, req: &Request<'_>) -> Option<Response> {
        let mount = self.mount_for(req.path)?;
        Some(self.serve_from(mount, req))
    }

    fn serve_from(&self, mount: &StaticMount, req: &Request<'_>) -> Response {
        let config = &mount.config;
        let suffix = if config.prefix == "/" {
            req.path
        } else {
            &req.path[config.prefix.len()..]
        };

        // Lexical screening before touching the filesystem.
        let mut relative = PathBuf::new();
        for part in suffix.split('/').filter(|s| !s.is_empty()) {
            if part == ".." {
                return forbidden();
            }
            if part == "." {
                continue;
            }
            if part.starts_with('.') && !config.allow_hidden {
                return forbidden();
            }
            if part.contains('\0') {
                return forbidden();
            }
            relative.push(part);
        }

        let candidate = mount.canonical_root.join(&relative);
        let canonical = match fs::canonicalize(&candidate) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
            Err(_) => return forbidden(),
        };
        if !canonical.starts_with(&mount.canonical_root) {
            return forbidden();
        }

        let meta = match fs::metadata(&canonical) {
            Ok(m) => m,
            Err(_) => return not_found(),
        };

        if meta.is_dir() {
            let index = canonical.join(&config.index_file);
            match fs::canonicalize(&index) {
                Ok(index_canonical) if index_canonical.starts_with(&mount.canonical_root) => {
                    let index_meta = match fs::metadata(&index_canonical) {
                        Ok(m) => m,
                        Err(_) => return not_found(),
                    };
                    return self.serve_file(mount, req, &index_canonical, &index_meta);
                }
                Ok(_) => return forbidden(),
                Err(_) => {
                    if config.directory_listing {
                        return directory_listing(req.path, &canonical);
                    }
                    return forbidden();
                }
            }
        }

        self.serve_file(mount, req, &canonical, &meta)
    }

    fn serve_file(
        &self,
        mount: &StaticMount,
        req: &Request<'_>,
        path: &Path,
        meta: &fs::Metadata,
    ) -> Response {
        let config = &mount.config;
        let size = meta.len();
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let etag = if config.etag {
            Some(strong_etag(meta))
        } else {
            None
        };

        // Conditional requests answer before any body work.
        if let Some(etag) = &etag
            && let Some(inm) = req.header("if-none-match")
            && (inm.trim() == "*" || inm.split(',').any(|t| t.trim() == etag))
        {
            return not_modified(etag, mtime);
        }
        if let Some(ims) = req.header("if-modified-since")
            && let Ok(since) = httpdate::parse_http_date(ims)
            && truncate_to_secs(mtime) <= since
        {
            let etag = etag.unwrap_or_default();
            return not_modified(&etag, mtime);
        }

        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        // Range requests bypass cache and compression.
        if config.range
            && let Some(raw_range) = req.header("range")
        {
            return match parse_range(raw_range, size) {
                Some((start, end)) => {
                    let bytes = match read_file_range(path, start, end) {
                        Ok(b) => b,
                        Err(_) => return not_found(),
                    };
                    let mut resp = Response::new(206)
                        .content_type(content_type)
                        .header(
                            "Content-Range",
                            format!("bytes {start}-{end}/{size}"),
                        )
                        .header("Accept-Ranges", "bytes");
                    if let Some(etag) = &etag {
                        resp = resp.header("ETag", etag.clone());
                    }
                    resp.body = crate::http::Body::Bytes(bytes);
                    resp
                }
                None => Response::new(416)
                    .header("Content-Range", format!("bytes */{size}")),
            };
        }

        let cacheable = config.cache_enabled && size <= config.max_file_size;
        let (bytes, gzipped) = if cacheable {
            match self.hot.get(path, mtime) {
                Some(found) => {
                    self.hot_hits.fetch_add(1, Ordering::Relaxed);
                    found
                }
                None => {
                    self.hot_misses.fetch_add(1, Ordering::Relaxed);
                    let bytes = match fs::read(path) {
                        Ok(b) => Arc::new(b),
                        Err(_) => return not_found(),
                    };
                    let gzipped = if config.compression
                        && bytes.len() >= config.compression_min_size
                    {
                        let packed = gzip(&bytes);
                        (packed.len() < bytes.len()).then(|| Arc::new(packed))
                    } else {
                        None
                    };
                    self.hot
                        .insert(path.to_path_buf(), mtime, bytes.clone(), gzipped.clone());
                    (bytes, gzipped)
                }
            }
        } else {
            match fs::read(path) {
                Ok(b) => (Arc::new(b), None),
                Err(_) => return not_found(),
            }
        };

        let wants_gzip = req
            .header("accept-encoding")
            .is_some_and(|ae| ae.split(',').any(|e| e.trim().starts_with("gzip")));

        let mut resp = Response::new(200).content_type(content_type);
        if config.range {
            resp = resp.header("Accept-Ranges", "bytes");
        }
        if let Some(etag) = etag {
            resp = resp.header("ETag", etag);
        }
        resp = resp
            .header("Last-Modified", httpdate::fmt_http_date(mtime))
            .header("Cache-Control", "public, max-age=3600");

        match (wants_gzip, gzipped) {
            (true, Some(packed)) => {
                resp = resp
                    .header("Content-Encoding", "gzip")
                    .header("Vary", "Accept-Encoding");
                resp.body = crate::http::Body::Bytes(packed.as_ref().clone());
            }
            _ => {
                resp.body = crate::http::Body::Bytes(bytes.as_ref().clone());
            }
        }
        resp
    }
}

impl Default for StaticServer {
    fn default() -> Self {
        Self::new()
    }
}

fn forbidden() -> Response {
    Response::json(format!(
        r#"{{"error":"Forbidden","code":"{}"}}"#,
        ErrorKind::Forbidden.code()
    ))
    .status(403)
}

fn not_found() -> Response {
    Response::json(format!(
        r#"{{"error":"Not Found","code":"{}"}}"#,
        ErrorKind::NotFound.code()
    ))
    .status(404)
}

fn not_modified(etag: &str, mtime: SystemTime) -> Response {
    let mut resp = Response::new(304);
    if !etag.is_empty() {
        resp = resp.header("ETag", etag.to_string());
    }
    resp.header("Last-Modified", httpdate::fmt_http_date(mtime))
        .header("Cache-Control", "public, max-age=3600")
}

/// Strong ETag over size, mtime, and inode, rendered as `"<hex>"`.
fn strong_etag(meta: &fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut hasher = rustc_hash::FxHasher::default();
    use std::hash::{Hash, Hasher};
    (meta.len(), mtime_ns, meta.ino()).hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

fn truncate_to_secs(t: SystemTime) -> SystemTime {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(d.as_secs()),
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

/// Parse a single-range `bytes=start-end` / `bytes=start-` header value
/// against a resource of `size` bytes. Multi-range is unsupported.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    let spec = raw.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();
    if start_str.is_empty() {
        // Suffix ranges (`bytes=-N`) are not produced by the clients we
        // target; treat as unsatisfiable rather than guessing.
        return None;
    }
    let start: u64 = start_str.parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        end_str.parse::<u64>().ok()?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn read_file_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start + 1) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn directory_listing(url_path: &str, dir: &Path) -> Response {
    let mut rows = String::new();
    if let Ok(entries) = fs::read_dir(dir) {
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        for name in names {
            rows.push_str(&format!(
                "<li><a href=\"{0}/{1}\">{1}</a></li>\n",
                url_path.trim_end_matches('/'),
                name
            ));
        }
    }
    Response::html(format!(
        "<html><head><title>Index of {url_path}</title></head>\
         <body><h1>Index of {url_path}</h1><ul>\n{rows}</ul></body></html>"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use std::io::Write;

    fn fixture() -> (tempfile::TempDir, StaticServer) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.path().join("one.txt"), b"1").unwrap();
        fs::write(dir.path().join("sub/data.json"), b"{\"k\":true}").unwrap();
        fs::write(dir.path().join(".secret"), b"hidden").unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir.path()))
            .unwrap();
        (dir, server)
    }

    fn request(path: &str) -> Request<'_> {
        Request::new(Method::Get, path)
    }

    #[test]
    fn serves_existing_file_with_etag_and_length() {
        let (_dir, server) = fixture();
        let resp = server.serve(&request("/s/index.html")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.as_bytes(), b"<h1>home</h1>");
        let etag = resp.get_header("ETag").unwrap();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert!(resp.get_header("Last-Modified").is_some());
    }

    #[test]
    fn unmatched_prefix_is_not_ours() {
        let (_dir, server) = fixture();
        assert!(server.serve(&request("/other/x")).is_none());
    }

    #[test]
    fn traversal_and_hidden_files_are_forbidden() {
        let (_dir, server) = fixture();
        assert_eq!(server.serve(&request("/s/../etc/passwd")).unwrap().status, 403);
        assert_eq!(server.serve(&request("/s/.secret")).unwrap().status, 403);
        assert_eq!(server.serve(&request("/s/sub/../../x")).unwrap().status, 403);
    }

    #[test]
    fn symlink_escaping_root_is_forbidden() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("target.txt"), b"outside").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("target.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir.path()))
            .unwrap();
        assert_eq!(server.serve(&request("/s/link.txt")).unwrap().status, 403);
    }

    #[test]
    fn directory_serves_index_file() {
        let (_dir, server) = fixture();
        let resp = server.serve(&request("/s")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.as_bytes(), b"<h1>home</h1>");
    }

    #[test]
    fn directory_without_index_is_403_unless_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir.path()))
            .unwrap();
        assert_eq!(server.serve(&request("/s")).unwrap().status, 403);

        let mut listing = StaticMountConfig::new("/l", dir.path());
        listing.directory_listing = true;
        server.mount(listing).unwrap();
        let resp = server.serve(&request("/l")).unwrap();
        assert_eq!(resp.status, 200);
        assert!(String::from_utf8_lossy(resp.body.as_bytes()).contains("a.txt"));
    }

    #[test]
    fn if_none_match_yields_304() {
        let (_dir, server) = fixture();
        let resp = server.serve(&request("/s/one.txt")).unwrap();
        let etag = resp.get_header("ETag").unwrap().to_string();

        let mut req = request("/s/one.txt");
        let etag_static: &'static str = Box::leak(etag.into_boxed_str());
        req.headers.push(("if-none-match", etag_static));
        let resp = server.serve(&req).unwrap();
        assert_eq!(resp.status, 304);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn if_modified_since_yields_304() {
        let (_dir, server) = fixture();
        let future = SystemTime::now() + std::time::Duration::from_secs(3600);
        let date: &'static str = Box::leak(httpdate::fmt_http_date(future).into_boxed_str());

        let mut req = request("/s/one.txt");
        req.headers.push(("if-modified-since", date));
        assert_eq!(server.serve(&req).unwrap().status, 304);
    }

    #[test]
    fn single_byte_range_semantics() {
        let (_dir, server) = fixture();

        let mut req = request("/s/one.txt");
        req.headers.push(("range", "bytes=0-0"));
        let resp = server.serve(&req).unwrap();
        assert_eq!(resp.status, 206);
        assert_eq!(resp.body.as_bytes(), b"1");
        assert_eq!(resp.get_header("Content-Range"), Some("bytes 0-0/1"));

        let mut req = request("/s/one.txt");
        req.headers.push(("range", "bytes=1-"));
        let resp = server.serve(&req).unwrap();
        assert_eq!(resp.status, 416);
        assert_eq!(resp.get_header("Content-Range"), Some("bytes */1"));
    }

    #[test]
    fn open_ended_range_reads_to_eof() {
        let (_dir, server) = fixture();
        let mut req = request("/s/sub/data.json");
        req.headers.push(("range", "bytes=4-"));
        let resp = server.serve(&req).unwrap();
        assert_eq!(resp.status, 206);
        assert_eq!(resp.body.as_bytes(), &b"{\"k\":true}"[4..]);
    }

    #[test]
    fn hot_cache_hits_and_mtime_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"first").unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir.path()))
            .unwrap();

        assert_eq!(
            server.serve(&request("/s/f.txt")).unwrap().body.as_bytes(),
            b"first"
        );
        server.serve(&request("/s/f.txt")).unwrap();
        let (hits, misses) = server.hot_hit_rate();
        assert_eq!((hits, misses), (1, 1));

        // Rewriting the file moves mtime and must invalidate the entry.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut f = fs::File::create(dir.path().join("f.txt")).unwrap();
        f.write_all(b"second").unwrap();
        drop(f);

        assert_eq!(
            server.serve(&request("/s/f.txt")).unwrap().body.as_bytes(),
            b"second"
        );
        let (_, misses) = server.hot_hit_rate();
        assert_eq!(misses, 2);
    }

    #[test]
    fn gzip_negotiation_for_large_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.txt"), vec![b'x'; 8 * 1024]).unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir.path()))
            .unwrap();

        let mut req = request("/s/big.txt");
        req.headers.push(("accept-encoding", "gzip, deflate"));
        let resp = server.serve(&req).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.get_header("Content-Encoding"), Some("gzip"));
        assert!(resp.body.len().unwrap() < 8 * 1024);

        // Identity when the client does not accept gzip.
        let resp = server.serve(&request("/s/big.txt")).unwrap();
        assert_eq!(resp.get_header("Content-Encoding"), None);
        assert_eq!(resp.body.len(), Some(8 * 1024));
    }

    #[test]
    fn longest_prefix_mount_wins() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        fs::write(dir_a.path().join("f.txt"), b"a").unwrap();
        fs::write(dir_b.path().join("f.txt"), b"b").unwrap();

        let mut server = StaticServer::new();
        server
            .mount(StaticMountConfig::new("/s", dir_a.path()))
            .unwrap();
        server
            .mount(StaticMountConfig::new("/s/deep", dir_b.path()))
            .unwrap();

        let resp = server.serve(&request("/s/deep/f.txt")).unwrap();
        assert_eq!(resp.body.as_bytes(), b"b");
        let resp = server.serve(&request("/s/f.txt")).unwrap();
        assert_eq!(resp.body.as_bytes(), b"a");
    }
}

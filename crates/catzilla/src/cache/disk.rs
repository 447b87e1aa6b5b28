// src/cache/disk.rs
//! On-disk cache tier.
//!
//! One file per key under the cache root, named by the hex of the key
//! hash. Each file carries a fixed 32-byte header followed by the key
//! bytes and the stored value bytes. All writes go to a temp file and
//! are renamed into place, which keeps concurrent readers (and other
//! worker processes sharing the directory) consistent.
//!
//! Header layout, all integers big-endian:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | magic `0xCA72111A`                     |
//! | 4      | 2    | format version (1)                     |
//! | 6      | 1    | flags (bit0 = compressed)              |
//! | 7      | 1    | reserved                               |
//! | 8      | 8    | creation time, unix ns                 |
//! | 16     | 8    | expiration time, unix ns (0 = none)    |
//! | 24     | 4    | key length                             |
//! | 28     | 4    | value length (stored representation)   |

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::cache::{hash_key, now_unix_ns};

pub const MAGIC: u32 = 0xCA72_111A;
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub key: Vec<u8>,
    /// Stored representation; compressed when the flag says so.
    pub value: Vec<u8>,
    pub created_ns: u64,
    pub expires_ns: u64,
    pub compressed: bool,
}

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(DiskCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.root.join(format!("{:016x}.bin", hash_key(key)))
    }

    /// Write an entry atomically (temp file + rename).
    pub fn write(&self, entry: &DiskEntry) -> io::Result<()> {
        let final_path = self.path_for(&entry.key);
        let tmp_path = final_path.with_extension(format!("tmp.{}", std::process::id()));

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        header[6] = if entry.compressed { FLAG_COMPRESSED } else { 0 };
        header[8..16].copy_from_slice(&entry.created_ns.to_be_bytes());
        header[16..24].copy_from_slice(&entry.expires_ns.to_be_bytes());
        header[24..28].copy_from_slice(&(entry.key.len() as u32).to_be_bytes());
        header[28..32].copy_from_slice(&(entry.value.len() as u32).to_be_bytes());

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&header)?;
        file.write_all(&entry.key)?;
        file.write_all(&entry.value)?;
        file.sync_data()?;
        drop(file);

        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// Read an entry. Missing files and hash collisions are `Ok(None)`;
    /// expired entries are removed and reported as `Ok(None)`. A bad
    /// magic or version fails cleanly with `InvalidData`.
    pub fn read(&self, key: &[u8]) -> io::Result<Option<DiskEntry>> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;

        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad cache magic"));
        }
        let version = u16::from_be_bytes(header[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported cache format version {version}"),
            ));
        }
        let compressed = header[6] & FLAG_COMPRESSED != 0;
        let created_ns = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let expires_ns = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let key_len = u32::from_be_bytes(header[24..28].try_into().unwrap()) as usize;
        let value_len = u32::from_be_bytes(header[28..32].try_into().unwrap()) as usize;

        let mut stored_key = vec![0u8; key_len];
        file.read_exact(&mut stored_key)?;
        if stored_key != key {
            // Same hash, different key.
            return Ok(None);
        }

        if expires_ns != 0 && expires_ns <= now_unix_ns() {
            drop(file);
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        let mut value = vec![0u8; value_len];
        file.read_exact(&mut value)?;

        Ok(Some(DiskEntry {
            key: stored_key,
            value,
            created_ns,
            expires_ns,
            compressed,
        }))
    }

    pub fn delete(&self, key: &[u8]) -> io::Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], value: &[u8]) -> DiskEntry {
        DiskEntry {
            key: key.to_vec(),
            value: value.to_vec(),
            created_ns: now_unix_ns(),
            expires_ns: 0,
            compressed: false,
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        let e = entry(b"some-key", b"some-value");
        cache.write(&e).unwrap();
        let back = cache.read(b"some-key").unwrap().unwrap();
        assert_eq!(back, e);

        assert!(cache.read(b"other-key").unwrap().is_none());
    }

    #[test]
    fn header_layout_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        let e = DiskEntry {
            key: b"k".to_vec(),
            value: b"vv".to_vec(),
            created_ns: 123,
            expires_ns: 456,
            compressed: true,
        };
        cache.write(&e).unwrap();

        let raw = fs::read(cache.root().join(format!("{:016x}.bin", hash_key(b"k")))).unwrap();
        assert_eq!(raw.len(), HEADER_LEN + 1 + 2);
        assert_eq!(&raw[0..4], &MAGIC.to_be_bytes());
        assert_eq!(&raw[4..6], &FORMAT_VERSION.to_be_bytes());
        assert_eq!(raw[6], 1); // compressed flag
        assert_eq!(raw[7], 0); // reserved
        assert_eq!(&raw[8..16], &123u64.to_be_bytes());
        assert_eq!(&raw[16..24], &456u64.to_be_bytes());
        assert_eq!(&raw[24..28], &1u32.to_be_bytes());
        assert_eq!(&raw[28..32], &2u32.to_be_bytes());
        assert_eq!(&raw[32..33], b"k");
        assert_eq!(&raw[33..35], b"vv");
    }

    #[test]
    fn bad_magic_and_version_fail_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        let e = entry(b"k", b"v");
        cache.write(&e).unwrap();
        let path = dir.path().join(format!("{:016x}.bin", hash_key(b"k")));

        let mut raw = fs::read(&path).unwrap();
        raw[0] = 0xFF;
        fs::write(&path, &raw).unwrap();
        let err = cache.read(b"k").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut raw = fs::read(&path).unwrap();
        raw[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        raw[4..6].copy_from_slice(&9u16.to_be_bytes());
        fs::write(&path, &raw).unwrap();
        let err = cache.read(b"k").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn expired_entries_are_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        let e = DiskEntry {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            created_ns: 1,
            expires_ns: 2, // long past
            compressed: false,
        };
        cache.write(&e).unwrap();
        assert!(cache.read(b"k").unwrap().is_none());
        // The file itself is gone.
        assert!(!dir
            .path()
            .join(format!("{:016x}.bin", hash_key(b"k")))
            .exists());
    }

    #[test]
    fn delete_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.write(&entry(b"k", b"v")).unwrap();
        assert!(cache.delete(b"k").unwrap());
        assert!(!cache.delete(b"k").unwrap());
    }
}

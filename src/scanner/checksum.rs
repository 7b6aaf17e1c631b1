//! Partial content checksums used for rename detection.
//!
//! The checksum is xxh3-64 over the first 1 MiB of the file combined with the
//! total size, rendered as `"{hash:016x}-{size}"`. Cheap enough to compute for
//! every new file, stable across renames and moves.

use std::fs::File;
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

/// Bytes hashed from the head of each file.
pub const CHECKSUM_SAMPLE_BYTES: u64 = 1024 * 1024;

/// Default number of memoized checksums.
const DEFAULT_MEMO_CAPACITY: usize = 4096;

const READ_CHUNK: usize = 64 * 1024;

/// Computes the partial checksum of `path`.
pub fn partial_checksum(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Xxh3::new();
    let mut reader = file.take(CHECKSUM_SAMPLE_BYTES);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:016x}-{}", hasher.digest(), size))
}

/// Memoizes checksums by (path, size, mtime).
///
/// The watcher reports the same file several times while it is being written;
/// unchanged files are not re-read.
pub struct ChecksumCache {
    memo: Mutex<LruCache<(PathBuf, i64, i64), String>>,
}

impl ChecksumCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn checksum(&self, path: &Path, size: i64, mtime: i64) -> io::Result<String> {
        let key = (path.to_path_buf(), size, mtime);
        if let Some(hit) = self.memo.lock().get(&key) {
            trace!(?path, "Checksum memo hit");
            return Ok(hit.clone());
        }
        let sum = partial_checksum(path)?;
        self.memo.lock().put(key, sum.clone());
        Ok(sum)
    }

    pub fn len(&self) -> usize {
        self.memo.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChecksumCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMO_CAPACITY)
    }
}

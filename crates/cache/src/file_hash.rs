use anvil_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hash a file's contents with SHA-256, returning the hex digest and byte size.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let _span = tracing::trace_span!("sha256_file", path = %path.display()).entered();
    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    let mut total: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Memoizing content-hash cache keyed by absolute path.
///
/// Hashes are computed on demand and reused until the path is invalidated.
/// Fetched or freshly built outputs seed their recorded hashes here so later
/// key computations for dependent rules never re-read the bytes.
#[derive(Debug, Default)]
pub struct FileHashCache {
    entries: Mutex<HashMap<PathBuf, String>>,
}

impl FileHashCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the file at `path`, computing and memoizing on a miss.
    pub fn get(&self, path: &Path) -> Result<String> {
        if let Some(hash) = self.peek(path) {
            return Ok(hash);
        }
        let (hash, _size) = sha256_file(path)?;
        self.set(path, hash.clone());
        Ok(hash)
    }

    /// Memoized hash for `path` without touching the filesystem.
    pub fn peek(&self, path: &Path) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|map| map.get(path).cloned())
    }

    /// Record a known hash for `path`, replacing any memoized value.
    pub fn set(&self, path: &Path, hash: String) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(path.to_path_buf(), hash);
        }
    }

    /// Drop any memoized hash for `path`. Called before a rule's outputs
    /// are allowed to change on disk.
    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut map) = self.entries.lock() {
            map.remove(path);
        }
    }

    /// Drop memoized hashes for `root` and every path beneath it. Output
    /// paths can be directories whose files were hashed individually.
    pub fn invalidate_subtree(&self, root: &Path) {
        if let Ok(mut map) = self.entries.lock() {
            map.retain(|path, _| !path.starts_with(root));
        }
    }
}

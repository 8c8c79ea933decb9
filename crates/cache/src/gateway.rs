//! Artifact cache gateway.
//!
//! [`ArtifactCache`] is the seam the engine talks through; everything above
//! it only sees [`CacheResult`]s. [`DirArtifactCache`] is the directory
//! backed implementation: one `tar.zst` archive per rule key plus a JSON
//! sidecar describing the entry, and manifests as plain JSON files.

use crate::file_hash::sha256_file;
use crate::manifest::Manifest;
use anvil_core::{CacheResult, Error, Result, RuleKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// An artifact about to be stored: output paths relative to the project
/// root, plus the metadata describing them.
#[derive(Debug)]
pub struct CacheArtifact<'a> {
    pub project_root: &'a Path,
    pub paths: &'a [PathBuf],
    pub metadata: BTreeMap<String, String>,
}

/// Transport seam between the engine and artifact storage.
///
/// Implementations report expected conditions (missing entries, transient
/// transport trouble) through [`CacheResult`]; `Err` is reserved for
/// conditions the caller cannot treat as a miss.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Look up `key`, unpacking the artifact under `dest` on a hit.
    async fn fetch(&self, key: &RuleKey, dest: &Path) -> Result<CacheResult>;

    /// Store one artifact under every key in `keys`.
    async fn store(&self, keys: &[RuleKey], artifact: CacheArtifact<'_>) -> Result<()>;

    async fn fetch_manifest(&self, key: &RuleKey) -> Result<Option<Manifest>>;

    async fn store_manifest(&self, key: &RuleKey, manifest: &Manifest) -> Result<()>;
}

const ARCHIVE_FILE: &str = "artifact.tar.zst";
const ENTRY_FILE: &str = "entry.json";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    created_at: DateTime<Utc>,
    content_hash: String,
    archive_size: u64,
    metadata: BTreeMap<String, String>,
}

/// Directory-backed [`ArtifactCache`].
#[derive(Debug)]
pub struct DirArtifactCache {
    root: PathBuf,
}

impl DirArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("artifacts"))
            .map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        fs::create_dir_all(root.join("manifests"))
            .map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    fn entry_dir(&self, key: &RuleKey) -> PathBuf {
        self.root.join("artifacts").join(key.to_hex())
    }

    fn manifest_path(&self, key: &RuleKey) -> PathBuf {
        self.root.join("manifests").join(format!("{}.json", key.to_hex()))
    }

    fn pack(&self, artifact: &CacheArtifact<'_>, dst_file: &Path) -> Result<()> {
        let file = fs::File::create(dst_file).map_err(|e| Error::io(e, dst_file, "create"))?;
        let enc = zstd::Encoder::new(file, 3)
            .map_err(|e| Error::configuration(format!("zstd encoder error: {e}")))?;
        let mut builder = tar::Builder::new(enc);
        builder.follow_symlinks(false);

        for rel in artifact.paths {
            let abs = artifact.project_root.join(rel);
            let meta = fs::symlink_metadata(&abs).map_err(|e| Error::io(e, &abs, "stat"))?;
            let appended = if meta.is_dir() {
                builder.append_dir_all(rel, &abs)
            } else {
                builder.append_path_with_name(&abs, rel)
            };
            appended.map_err(|e| Error::configuration(format!("tar append failed: {e}")))?;
        }

        let enc = builder
            .into_inner()
            .map_err(|e| Error::configuration(format!("tar finalize failed: {e}")))?;
        enc.finish()
            .map_err(|e| Error::configuration(format!("zstd finish failed: {e}")))?;
        Ok(())
    }

    fn unpack(archive: &Path, dest: &Path) -> Result<()> {
        let file = fs::File::open(archive).map_err(|e| Error::io(e, archive, "open"))?;
        let dec = zstd::Decoder::new(file)
            .map_err(|e| Error::configuration(format!("zstd decoder error: {e}")))?;
        let mut tar = tar::Archive::new(dec);
        tar.unpack(dest)
            .map_err(|e| Error::configuration(format!("tar unpack failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
    async fn fetch(&self, key: &RuleKey, dest: &Path) -> Result<CacheResult> {
        let dir = self.entry_dir(key);
        let archive = dir.join(ARCHIVE_FILE);
        if !archive.exists() {
            tracing::trace!(key = %key, "Cache miss");
            return Ok(CacheResult::Miss);
        }

        fs::create_dir_all(dest).map_err(|e| Error::io(e, dest, "create_dir_all"))?;
        if let Err(e) = Self::unpack(&archive, dest) {
            // An unreadable entry costs a rebuild, never the build.
            tracing::warn!(key = %key, "Discarding unreadable cache entry: {e}");
            return Ok(CacheResult::Error {
                message: e.to_string(),
            });
        }

        let content_hash = fs::read(dir.join(ENTRY_FILE))
            .ok()
            .and_then(|raw| serde_json::from_slice::<CacheEntry>(&raw).ok())
            .map(|entry| entry.content_hash);
        tracing::debug!(key = %key, "Cache hit");
        Ok(CacheResult::Hit {
            key: *key,
            content_hash,
        })
    }

    async fn store(&self, keys: &[RuleKey], artifact: CacheArtifact<'_>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let staging = tempfile::tempdir_in(&self.root)
            .map_err(|e| Error::io(e, &self.root, "tempdir"))?;
        let staged = staging.path().join(ARCHIVE_FILE);
        self.pack(&artifact, &staged)?;
        let (content_hash, archive_size) = sha256_file(&staged)?;

        let entry = CacheEntry {
            created_at: Utc::now(),
            content_hash,
            archive_size,
            metadata: artifact.metadata,
        };
        let sidecar = serde_json::to_vec_pretty(&entry)
            .map_err(|e| Error::serialization(format!("encoding cache entry: {e}")))?;

        for key in keys {
            let dir = self.entry_dir(key);
            fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
            let archive = dir.join(ARCHIVE_FILE);
            // Hardlink from staging where possible; fall back to a copy.
            let _ = fs::remove_file(&archive);
            if fs::hard_link(&staged, &archive).is_err() {
                fs::copy(&staged, &archive).map_err(|e| Error::io(e, &archive, "copy"))?;
            }
            fs::write(dir.join(ENTRY_FILE), &sidecar)
                .map_err(|e| Error::io(e, dir.join(ENTRY_FILE), "write"))?;
        }
        tracing::debug!(
            keys = keys.len(),
            size = archive_size,
            "Stored artifact in cache"
        );
        Ok(())
    }

    async fn fetch_manifest(&self, key: &RuleKey) -> Result<Option<Manifest>> {
        let path = self.manifest_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        match serde_json::from_slice(&raw) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                tracing::warn!(key = %key, "Discarding unreadable manifest: {e}");
                Ok(None)
            }
        }
    }

    async fn store_manifest(&self, key: &RuleKey, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(key);
        let raw = serde_json::to_vec_pretty(manifest)
            .map_err(|e| Error::serialization(format!("encoding manifest: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &raw).map_err(|e| Error::io(e, &tmp, "write"))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(e, &path, "rename"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::KeyBuilder;
    use tempfile::TempDir;

    fn key(tag: &str) -> RuleKey {
        let mut b = KeyBuilder::new("default");
        b.feed(tag);
        b.finish()
    }

    #[tokio::test]
    async fn fetch_of_unknown_key_is_a_miss() {
        let root = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(root.path()).unwrap();
        let result = cache.fetch(&key("absent"), dest.path()).await.unwrap();
        assert!(result.is_miss());
    }

    #[tokio::test]
    async fn store_then_fetch_restores_files_under_every_key() {
        let root = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("out/sub")).unwrap();
        std::fs::write(project.path().join("out/a.bin"), "alpha").unwrap();
        std::fs::write(project.path().join("out/sub/b.bin"), "beta").unwrap();

        let cache = DirArtifactCache::new(root.path()).unwrap();
        let keys = [key("default"), key("input-based")];
        cache
            .store(
                &keys,
                CacheArtifact {
                    project_root: project.path(),
                    paths: &[PathBuf::from("out")],
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap();

        for k in &keys {
            let dest = TempDir::new().unwrap();
            let result = cache.fetch(k, dest.path()).await.unwrap();
            assert!(result.is_success(), "expected hit for {k}");
            let restored = std::fs::read_to_string(dest.path().join("out/sub/b.bin")).unwrap();
            assert_eq!(restored, "beta");
            match result {
                CacheResult::Hit { content_hash, .. } => assert!(content_hash.is_some()),
                other => panic!("expected hit, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn corrupt_archive_degrades_to_error_result() {
        let root = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(root.path()).unwrap();
        let k = key("corrupt");
        let dir = root.path().join("artifacts").join(k.to_hex());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(ARCHIVE_FILE), "not a zstd stream").unwrap();

        let dest = TempDir::new().unwrap();
        let result = cache.fetch(&k, dest.path()).await.unwrap();
        assert!(matches!(result, CacheResult::Error { .. }));
    }

    #[tokio::test]
    async fn manifests_round_trip_and_missing_reads_as_none() {
        let root = TempDir::new().unwrap();
        let cache = DirArtifactCache::new(root.path()).unwrap();
        let k = key("manifest");

        assert!(cache.fetch_manifest(&k).await.unwrap().is_none());

        let mut manifest = Manifest::new();
        let mut inputs = BTreeMap::new();
        inputs.insert("src/a.c".to_string(), "h1".to_string());
        manifest.add_entry(inputs, key("depfile"), 8);
        cache.store_manifest(&k, &manifest).await.unwrap();

        let back = cache.fetch_manifest(&k).await.unwrap().unwrap();
        assert_eq!(back.entries(), manifest.entries());
    }
}

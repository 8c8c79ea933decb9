//! Crash-consistent per-rule build metadata.
//!
//! Every rule owns a metadata directory under the engine's metadata root.
//! The directory holds a single JSON object of string keys and values (the
//! names in [`anvil_core::metadata`]) describing the outputs currently on
//! disk. Writes go through a temp file and rename so a crash can never leave
//! a partially written file; a reader either sees the previous complete
//! metadata or the new complete metadata.
//!
//! Corrupt or unreadable metadata is treated as "no previous build", never
//! as a hard failure. A stale cache entry must only ever cost a rebuild.

use crate::file_hash::FileHashCache;
use anvil_core::{Error, Result, RuleId, RuleKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name of the metadata JSON inside a rule's metadata directory.
pub const METADATA_FILE: &str = "artifact_metadata.json";

fn sanitize_component(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory under `metadata_root` holding a rule's metadata. The sanitized
/// rule id keeps the tree greppable; the hash suffix keeps it collision-free.
#[must_use]
pub fn rule_metadata_dir(metadata_root: &Path, rule: &RuleId) -> PathBuf {
    let digest = hex::encode(Sha256::digest(rule.as_str().as_bytes()));
    metadata_root.join(format!(
        "{}-{}",
        sanitize_component(rule.as_str()),
        &digest[..8]
    ))
}

/// Read/write access to one rule's persisted metadata.
#[derive(Debug, Clone)]
pub struct OnDiskBuildInfo {
    rule: RuleId,
    dir: PathBuf,
}

impl OnDiskBuildInfo {
    #[must_use]
    pub fn new(metadata_root: &Path, rule: &RuleId) -> Self {
        Self {
            rule: rule.clone(),
            dir: rule_metadata_dir(metadata_root, rule),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// All persisted entries, or `None` when nothing valid is on disk.
    #[must_use]
    pub fn read_all(&self) -> Option<BTreeMap<String, String>> {
        let path = self.metadata_path();
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(map) => Some(map),
            Err(e) => {
                tracing::warn!(
                    rule = %self.rule,
                    path = %path.display(),
                    "Ignoring corrupt build metadata: {e}"
                );
                None
            }
        }
    }

    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<String> {
        self.read_all()?.remove(key)
    }

    /// A persisted rule key; malformed hex reads as absent.
    #[must_use]
    pub fn get_rule_key(&self, key: &str) -> Option<RuleKey> {
        RuleKey::from_hex(&self.get_value(key)?)
    }

    /// A persisted JSON list of paths; malformed JSON reads as absent.
    #[must_use]
    pub fn get_path_list(&self, key: &str) -> Option<Vec<PathBuf>> {
        let raw = self.get_value(key)?;
        let list: Vec<String> = serde_json::from_str(&raw).ok()?;
        Some(list.into_iter().map(PathBuf::from).collect())
    }

    /// A persisted JSON map; malformed JSON reads as absent.
    #[must_use]
    pub fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>> {
        serde_json::from_str(&self.get_value(key)?).ok()
    }

    /// Write `entries`, replacing the whole file when `clear_existing` or
    /// merging over what is already persisted otherwise. Atomic via
    /// temp-file-and-rename within the metadata directory.
    pub fn write(&self, entries: &BTreeMap<String, String>, clear_existing: bool) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))?;

        let merged = if clear_existing {
            entries.clone()
        } else {
            let mut merged = self.read_all().unwrap_or_default();
            merged.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        };

        let body = serde_json::to_vec_pretty(&merged)
            .map_err(|e| Error::serialization(format!("encoding build metadata: {e}")))?;

        let tmp = self.dir.join(format!("{METADATA_FILE}.tmp"));
        fs::write(&tmp, &body).map_err(|e| Error::io(e, &tmp, "write"))?;
        let dest = self.metadata_path();
        fs::rename(&tmp, &dest).map_err(|e| Error::io(e, &dest, "rename"))?;
        tracing::debug!(rule = %self.rule, entries = merged.len(), "Wrote build metadata");
        Ok(())
    }

    /// Remove any persisted metadata. Must succeed (or the rule must fail)
    /// before the rule's outputs are allowed to change, so stale metadata can
    /// never describe new outputs.
    pub fn delete_existing_metadata(&self) -> Result<()> {
        let path = self.metadata_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }
}

/// Accumulates build metadata and recorded output paths for a rule while it
/// builds, then persists them through [`OnDiskBuildInfo`].
#[derive(Debug)]
pub struct BuildInfoRecorder {
    rule: RuleId,
    metadata: BTreeMap<String, String>,
    recorded_paths: Vec<PathBuf>,
}

impl BuildInfoRecorder {
    #[must_use]
    pub fn new(rule: RuleId) -> Self {
        Self {
            rule,
            metadata: BTreeMap::new(),
            recorded_paths: Vec::new(),
        }
    }

    pub fn add_build_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Store a list of project-relative paths under `key` as a JSON array.
    pub fn add_path_list_metadata(&mut self, key: impl Into<String>, paths: &[PathBuf]) {
        let list: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        // Plain string lists always encode.
        if let Ok(raw) = serde_json::to_string(&list) {
            self.metadata.insert(key.into(), raw);
        }
    }

    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Record an output path (project-relative file or directory) produced by
    /// the build.
    pub fn record_artifact(&mut self, path: PathBuf) {
        if !self.recorded_paths.contains(&path) {
            self.recorded_paths.push(path);
        }
    }

    #[must_use]
    pub fn recorded_paths(&self) -> &[PathBuf] {
        &self.recorded_paths
    }

    /// Every success path persists a known metadata shape. An unexpected
    /// key is a bug in the engine, surfaced here rather than as a corrupt
    /// cache entry later.
    pub fn assert_only_has_keys(&self, allowed: &[&str]) -> Result<()> {
        let unexpected: Vec<&str> = self
            .metadata
            .keys()
            .map(String::as_str)
            .filter(|key| !allowed.contains(key))
            .collect();
        if unexpected.is_empty() {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "build metadata for {} has unexpected keys: {}",
                self.rule,
                unexpected.join(", ")
            )))
        }
    }

    /// Sum the size of the recorded outputs under `project_root` and persist
    /// the output block in the recorder's metadata: size and path list
    /// always, content hashes only when `should_hash(total_size)` allows it.
    pub fn compute_output_info(
        &mut self,
        project_root: &Path,
        hashes: &FileHashCache,
        should_hash: impl Fn(u64) -> bool,
    ) -> Result<u64> {
        let mut files: Vec<PathBuf> = Vec::new();
        let mut total: u64 = 0;
        for rel in &self.recorded_paths {
            let abs = project_root.join(rel);
            let meta = fs::symlink_metadata(&abs).map_err(|e| Error::io(e, &abs, "stat"))?;
            if meta.is_dir() {
                for entry in WalkDir::new(&abs).into_iter().filter_map(|e| e.ok()) {
                    if entry.file_type().is_dir() {
                        continue;
                    }
                    total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    if let Ok(rel_file) = entry.path().strip_prefix(project_root) {
                        files.push(rel_file.to_path_buf());
                    }
                }
            } else {
                total += meta.len();
                files.push(rel.clone());
            }
        }
        files.sort();
        files.dedup();

        let mut sorted_paths = self.recorded_paths.clone();
        sorted_paths.sort();
        self.add_path_list_metadata(anvil_core::metadata::RECORDED_PATHS, &sorted_paths);
        self.add_build_metadata(anvil_core::metadata::OUTPUT_SIZE, total.to_string());

        if should_hash(total) {
            let mut per_file = BTreeMap::new();
            let mut combined = Sha256::new();
            for rel in &files {
                let hash = hashes.get(&project_root.join(rel))?;
                let name = rel.to_string_lossy().into_owned();
                combined.update(name.as_bytes());
                combined.update([0u8]);
                combined.update(hash.as_bytes());
                combined.update([0u8]);
                per_file.insert(name, hash);
            }
            let raw = serde_json::to_string(&per_file)
                .map_err(|e| Error::serialization(format!("encoding output hashes: {e}")))?;
            self.add_build_metadata(anvil_core::metadata::RECORDED_PATH_HASHES, raw);
            self.add_build_metadata(
                anvil_core::metadata::OUTPUT_HASH,
                hex::encode(combined.finalize()),
            );
        }

        tracing::debug!(
            rule = %self.rule,
            output_size = total,
            files = files.len(),
            hashed = should_hash(total),
            "Computed output info"
        );
        Ok(total)
    }

    /// Persist the accumulated metadata through `info`.
    pub fn write_metadata_to_disk(
        &self,
        info: &OnDiskBuildInfo,
        clear_existing: bool,
    ) -> Result<()> {
        info.write(&self.metadata, clear_existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::metadata;
    use tempfile::TempDir;

    fn rule() -> RuleId {
        RuleId::new("//lib:parser")
    }

    #[test]
    fn metadata_round_trips_with_exact_key_names() {
        let tmp = TempDir::new().unwrap();
        let info = OnDiskBuildInfo::new(tmp.path(), &rule());

        let mut recorder = BuildInfoRecorder::new(rule());
        recorder.add_build_metadata(metadata::RULE_KEY, "ab".repeat(32));
        recorder.add_build_metadata(metadata::BUILD_ID, "b-1");
        recorder.write_metadata_to_disk(&info, true).unwrap();

        assert_eq!(info.get_value(metadata::RULE_KEY), Some("ab".repeat(32)));
        assert_eq!(info.get_value(metadata::BUILD_ID), Some("b-1".into()));
        assert!(info.get_rule_key(metadata::RULE_KEY).is_some());

        // Raw file uses the same names verbatim.
        let raw = std::fs::read_to_string(info.metadata_path()).unwrap();
        assert!(raw.contains("\"RULE_KEY\""));
        assert!(raw.contains("\"BUILD_ID\""));
    }

    #[test]
    fn corrupt_metadata_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        let info = OnDiskBuildInfo::new(tmp.path(), &rule());
        std::fs::create_dir_all(info.dir()).unwrap();
        std::fs::write(info.metadata_path(), "{not json").unwrap();

        assert!(info.read_all().is_none());
        assert!(info.get_value(metadata::RULE_KEY).is_none());

        // A write over the corrupt file still succeeds.
        let mut entries = BTreeMap::new();
        entries.insert(metadata::BUILD_ID.to_string(), "b-2".to_string());
        info.write(&entries, false).unwrap();
        assert_eq!(info.get_value(metadata::BUILD_ID), Some("b-2".into()));
    }

    #[test]
    fn write_merges_unless_cleared() {
        let tmp = TempDir::new().unwrap();
        let info = OnDiskBuildInfo::new(tmp.path(), &rule());

        let mut a = BTreeMap::new();
        a.insert("A".to_string(), "1".to_string());
        info.write(&a, true).unwrap();

        let mut b = BTreeMap::new();
        b.insert("B".to_string(), "2".to_string());
        info.write(&b, false).unwrap();
        assert_eq!(info.get_value("A"), Some("1".into()));
        assert_eq!(info.get_value("B"), Some("2".into()));

        info.write(&a, true).unwrap();
        assert_eq!(info.get_value("B"), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let info = OnDiskBuildInfo::new(tmp.path(), &rule());
        info.delete_existing_metadata().unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("A".to_string(), "1".to_string());
        info.write(&entries, true).unwrap();
        info.delete_existing_metadata().unwrap();
        assert!(info.read_all().is_none());
        info.delete_existing_metadata().unwrap();
    }

    #[test]
    fn path_lists_and_maps_round_trip() {
        let tmp = TempDir::new().unwrap();
        let info = OnDiskBuildInfo::new(tmp.path(), &rule());

        let mut recorder = BuildInfoRecorder::new(rule());
        recorder.add_path_list_metadata(
            metadata::DEP_FILE,
            &[PathBuf::from("src/a.c"), PathBuf::from("src/b.h")],
        );
        recorder.write_metadata_to_disk(&info, true).unwrap();

        let paths = info.get_path_list(metadata::DEP_FILE).unwrap();
        assert_eq!(paths, vec![PathBuf::from("src/a.c"), PathBuf::from("src/b.h")]);
        assert!(info.get_path_list("MISSING").is_none());
    }

    #[test]
    fn assert_only_has_keys_flags_unexpected_keys() {
        let mut recorder = BuildInfoRecorder::new(rule());
        recorder.add_build_metadata("A", "1");
        recorder.add_build_metadata("X", "2");

        assert!(recorder.assert_only_has_keys(&["A", "X"]).is_ok());
        // A subset of the allowed keys is fine.
        assert!(recorder.assert_only_has_keys(&["A", "X", "Y"]).is_ok());

        let err = recorder.assert_only_has_keys(&["A", "B"]).unwrap_err();
        assert!(err.to_string().contains("unexpected keys: X"));
    }

    #[test]
    fn compute_output_info_respects_hash_ceiling() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::write(root.join("out/a.bin"), "aaaa").unwrap();
        std::fs::write(root.join("out/b.bin"), "bb").unwrap();

        let hashes = FileHashCache::new();
        let mut recorder = BuildInfoRecorder::new(rule());
        recorder.record_artifact(PathBuf::from("out"));

        let size = recorder
            .compute_output_info(root, &hashes, |total| total <= 100)
            .unwrap();
        assert_eq!(size, 6);
        assert!(recorder.get_value(metadata::OUTPUT_HASH).is_some());
        assert!(recorder.get_value(metadata::RECORDED_PATH_HASHES).is_some());
        assert_eq!(recorder.get_value(metadata::OUTPUT_SIZE), Some("6"));

        let mut over = BuildInfoRecorder::new(rule());
        over.record_artifact(PathBuf::from("out"));
        over.compute_output_info(root, &hashes, |total| total <= 5)
            .unwrap();
        assert!(over.get_value(metadata::OUTPUT_HASH).is_none());
        assert!(over.get_value(metadata::RECORDED_PATH_HASHES).is_none());
        assert_eq!(over.get_value(metadata::OUTPUT_SIZE), Some("6"));
    }

    #[test]
    fn metadata_dirs_are_distinct_per_rule() {
        let tmp = TempDir::new().unwrap();
        let a = OnDiskBuildInfo::new(tmp.path(), &RuleId::new("//lib:a"));
        let b = OnDiskBuildInfo::new(tmp.path(), &RuleId::new("//lib:b"));
        assert_ne!(a.dir(), b.dir());
        // Sanitized id keeps the directory readable.
        assert!(a.dir().file_name().unwrap().to_string_lossy().contains("lib_a"));
    }
}

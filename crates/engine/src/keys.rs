//! Per-rule key computation.
//!
//! The default key is computed eagerly at construction from the rule's
//! identity, its dependencies' default keys, and its declared source input
//! contents. The input-based and manifest keys are computed at most once,
//! lazily, and only after dependencies have completed (their inputs may be
//! dependency outputs that do not exist earlier). The dep-file key is a
//! pure function of a consumed-input list and can be recomputed freely.

use anvil_cache::FileHashCache;
use anvil_core::{Error, KeyBuilder, Result, Rule, RuleKey, RuleKeyAndInputs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct RuleKeyService {
    rule: Arc<dyn Rule>,
    hashes: Arc<FileHashCache>,
    project_root: PathBuf,
    default_key: RuleKey,
    deps_available: AtomicBool,
    input_based: OnceCell<RuleKey>,
    manifest: OnceCell<RuleKeyAndInputs>,
}

impl RuleKeyService {
    /// Compute the default key and set up the lazy flavors.
    ///
    /// `dep_keys` are the default keys of the rule's dependencies in
    /// `Rule::deps` order; they are part of the default key so a changed
    /// dependency changes this rule's key.
    pub fn new(
        rule: Arc<dyn Rule>,
        hashes: Arc<FileHashCache>,
        project_root: impl Into<PathBuf>,
        dep_keys: &[RuleKey],
    ) -> Result<Self> {
        let project_root = project_root.into();
        let mut builder = seeded_builder("default", rule.as_ref());
        for (dep, key) in rule.deps().iter().zip(dep_keys) {
            builder.feed_input(dep.as_str(), &key.to_hex());
        }
        let mut inputs: Vec<&PathBuf> = rule.declared_inputs().iter().collect();
        inputs.sort();
        for input in inputs {
            let hash = hashes.get(&project_root.join(input))?;
            builder.feed_input(&input.to_string_lossy(), &hash);
        }
        let default_key = builder.finish();
        tracing::trace!(rule = %rule.id(), key = %default_key, "Computed default rule key");

        Ok(Self {
            rule,
            hashes,
            project_root,
            default_key,
            deps_available: AtomicBool::new(false),
            input_based: OnceCell::new(),
            manifest: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn default_key(&self) -> RuleKey {
        self.default_key
    }

    /// Unlock the dependency-gated key flavors. Called once the rule's
    /// dependencies have all completed.
    pub fn mark_deps_available(&self) {
        self.deps_available.store(true, Ordering::Release);
    }

    fn require_deps_available(&self) -> Result<()> {
        if self.deps_available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "dependency-gated key requested for {} before its dependencies completed",
                self.rule.id()
            )))
        }
    }

    /// The input-based key: digests the contents of the inputs the rule
    /// consumes, and nothing else about the dependency graph.
    pub async fn input_based_key(&self) -> Result<RuleKey> {
        self.require_deps_available()?;
        self.input_based
            .get_or_try_init(|| async {
                let inputs = self.rule.input_based_inputs().ok_or_else(|| {
                    Error::configuration(format!(
                        "rule {} declares input-based keys but provided no inputs",
                        self.rule.id()
                    ))
                })?;
                let key = self.hash_inputs("input", &inputs)?;
                tracing::trace!(rule = %self.rule.id(), key = %key, "Computed input-based rule key");
                Ok(key)
            })
            .await
            .map(|key| *key)
    }

    /// The manifest key: digests the *names* of every input the rule could
    /// possibly consume, so one manifest covers all consumed subsets.
    pub async fn manifest_key(&self) -> Result<RuleKeyAndInputs> {
        self.require_deps_available()?;
        self.manifest
            .get_or_try_init(|| async {
                let mut universe = self.rule.possible_input_universe().ok_or_else(|| {
                    Error::configuration(format!(
                        "rule {} declares dep-file keys but provided no input universe",
                        self.rule.id()
                    ))
                })?;
                universe.sort();
                universe.dedup();
                let mut builder = seeded_builder("manifest", self.rule.as_ref());
                for input in &universe {
                    builder.feed(&input.to_string_lossy());
                }
                Ok(RuleKeyAndInputs {
                    key: builder.finish(),
                    inputs: universe,
                })
            })
            .await
            .map(Clone::clone)
    }

    /// The dep-file key over a precise consumed-input list.
    pub fn dep_file_key(&self, consumed: &[PathBuf]) -> Result<RuleKeyAndInputs> {
        let mut inputs = consumed.to_vec();
        inputs.sort();
        inputs.dedup();
        let key = self.hash_inputs("depfile", &inputs)?;
        Ok(RuleKeyAndInputs { key, inputs })
    }

    /// Current content hashes for `inputs`, keyed by project-relative path.
    /// Inputs missing from disk are omitted, which defeats manifest entries
    /// that recorded them.
    pub fn current_input_hashes(
        &self,
        inputs: &[PathBuf],
    ) -> std::collections::BTreeMap<String, String> {
        let mut map = std::collections::BTreeMap::new();
        for input in inputs {
            let abs = self.project_root.join(input);
            if let Ok(hash) = self.hashes.get(&abs) {
                map.insert(input.to_string_lossy().into_owned(), hash);
            }
        }
        map
    }

    fn hash_inputs(&self, flavor: &str, inputs: &[PathBuf]) -> Result<RuleKey> {
        let mut builder = seeded_builder(flavor, self.rule.as_ref());
        for input in inputs {
            let hash = self.hashes.get(&self.project_root.join(input))?;
            builder.feed_input(&input.to_string_lossy(), &hash);
        }
        Ok(builder.finish())
    }
}

fn seeded_builder(flavor: &str, rule: &dyn Rule) -> KeyBuilder {
    let mut builder = KeyBuilder::new(flavor);
    builder
        .feed(rule.id().as_str())
        .feed(rule.rule_type())
        .feed(rule.configuration());
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{Capabilities, RuleId, Step};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FixtureRule {
        id: RuleId,
        deps: Vec<RuleId>,
        inputs: Vec<PathBuf>,
        capabilities: Capabilities,
        consumed: Vec<PathBuf>,
    }

    impl Rule for FixtureRule {
        fn id(&self) -> &RuleId {
            &self.id
        }
        fn rule_type(&self) -> &str {
            "fixture"
        }
        fn deps(&self) -> &[RuleId] {
            &self.deps
        }
        fn output_paths(&self) -> &[PathBuf] {
            &[]
        }
        fn declared_inputs(&self) -> &[PathBuf] {
            &self.inputs
        }
        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }
        fn build_steps(&self) -> Vec<Arc<dyn Step>> {
            Vec::new()
        }
        fn input_based_inputs(&self) -> Option<Vec<PathBuf>> {
            Some(self.consumed.clone())
        }
        fn possible_input_universe(&self) -> Option<Vec<PathBuf>> {
            Some(self.inputs.clone())
        }
    }

    fn fixture(root: &TempDir, files: &[(&str, &str)]) -> Arc<FixtureRule> {
        for (name, contents) in files {
            std::fs::write(root.path().join(name), contents).unwrap();
        }
        Arc::new(FixtureRule {
            id: RuleId::new("//app:lib"),
            deps: Vec::new(),
            inputs: files.iter().map(|(name, _)| PathBuf::from(name)).collect(),
            capabilities: Capabilities {
                input_based_keys: true,
                dep_file_keys: true,
                ..Capabilities::default()
            },
            consumed: files.iter().map(|(name, _)| PathBuf::from(name)).collect(),
        })
    }

    fn service(root: &TempDir, rule: Arc<FixtureRule>) -> RuleKeyService {
        RuleKeyService::new(rule, Arc::new(FileHashCache::new()), root.path(), &[]).unwrap()
    }

    #[test]
    fn default_key_is_deterministic_and_content_sensitive() {
        let root = TempDir::new().unwrap();
        let rule = fixture(&root, &[("a.c", "int main;")]);
        let first = service(&root, rule.clone()).default_key();
        let second = service(&root, rule.clone()).default_key();
        assert_eq!(first, second);

        std::fs::write(root.path().join("a.c"), "int main2;").unwrap();
        let changed = service(&root, rule).default_key();
        assert_ne!(first, changed);
    }

    #[test]
    fn default_key_depends_on_dep_keys() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("a.c"), "x").unwrap();
        let rule = Arc::new(FixtureRule {
            id: RuleId::new("//app:lib"),
            deps: vec![RuleId::new("//app:dep")],
            inputs: vec![PathBuf::from("a.c")],
            capabilities: Capabilities::default(),
            consumed: Vec::new(),
        });
        let hashes = Arc::new(FileHashCache::new());
        let dep_a = {
            let mut b = KeyBuilder::new("default");
            b.feed("one");
            b.finish()
        };
        let dep_b = {
            let mut b = KeyBuilder::new("default");
            b.feed("two");
            b.finish()
        };
        let with_a =
            RuleKeyService::new(rule.clone(), hashes.clone(), root.path(), &[dep_a]).unwrap();
        let with_b = RuleKeyService::new(rule, hashes, root.path(), &[dep_b]).unwrap();
        assert_ne!(with_a.default_key(), with_b.default_key());
    }

    #[tokio::test]
    async fn gated_keys_refuse_to_compute_before_deps_complete() {
        let root = TempDir::new().unwrap();
        let rule = fixture(&root, &[("a.c", "x")]);
        let keys = service(&root, rule);

        assert!(keys.input_based_key().await.is_err());
        assert!(keys.manifest_key().await.is_err());

        keys.mark_deps_available();
        assert!(keys.input_based_key().await.is_ok());
        assert!(keys.manifest_key().await.is_ok());
    }

    #[tokio::test]
    async fn gated_keys_compute_once() {
        let root = TempDir::new().unwrap();
        let rule = fixture(&root, &[("a.c", "x")]);
        let keys = service(&root, rule);
        keys.mark_deps_available();

        let first = keys.input_based_key().await.unwrap();
        // Content changes after first computation are not observed.
        std::fs::write(root.path().join("a.c"), "different").unwrap();
        let second = keys.input_based_key().await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dep_file_key_ignores_order_and_duplicates() {
        let root = TempDir::new().unwrap();
        let rule = fixture(&root, &[("a.c", "x"), ("b.h", "y")]);
        let keys = service(&root, rule);

        let forward = keys
            .dep_file_key(&[PathBuf::from("a.c"), PathBuf::from("b.h")])
            .unwrap();
        let reversed = keys
            .dep_file_key(&[
                PathBuf::from("b.h"),
                PathBuf::from("a.c"),
                PathBuf::from("a.c"),
            ])
            .unwrap();
        assert_eq!(forward.key, reversed.key);
        assert_eq!(forward.inputs, reversed.inputs);
    }

    #[test]
    fn manifest_key_uses_names_not_contents() {
        let root = TempDir::new().unwrap();
        let rule = fixture(&root, &[("a.c", "x")]);
        let keys = service(&root, rule.clone());
        keys.mark_deps_available();
        let before = tokio_test::block_on(keys.manifest_key()).unwrap();

        std::fs::write(root.path().join("a.c"), "rewritten").unwrap();
        let keys = service(&root, rule);
        keys.mark_deps_available();
        let after = tokio_test::block_on(keys.manifest_key()).unwrap();
        assert_eq!(before.key, after.key);
    }
}

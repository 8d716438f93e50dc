//! The content-addressable action cache.
//!
//! An action's cache key is the fingerprint of its own serialized
//! parameters plus the content fingerprint of every input file; two actions
//! with identical inputs produce the same key regardless of when or where
//! they ran.  A hit restores the previously produced artifacts from a
//! compressed bundle instead of re-running the action.  Entries are
//! re-verified on every read: a bulk only counts as a hit while all of its
//! recorded input fingerprints still match current file content.

use crate::bundle::{self, BundleStats, Codec};
use crate::exit;
use crate::fs::FileSystem;
use crate::graph::{BuildGraph, BuildNode};
use crate::hash::{serialize_any_fingerprint, Fingerprint, FingerprintWriter};
use crate::pool::WorkerPool;
use crate::units::{alias_path, FILE_CATEGORY};
use crate::work::FileDigest;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ActionCacheKey(Fingerprint);

impl ActionCacheKey {
    pub fn fingerprint(&self) -> Fingerprint {
        self.0
    }
}

impl fmt::Display for ActionCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One compressed bundle of artifacts plus the input digests it was built
/// against.  Valid only while every input still matches.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCacheBulk {
    pub path: PathBuf,
    /// The artifact paths inside the bundle, sorted.  Recorded here so a
    /// read can reject a bulk whose contents are not the set the caller
    /// asked for without unpacking anything into the workspace.
    pub artifacts: Vec<PathBuf>,
    pub inputs: Vec<FileDigest>,
}

/// Persisted as one file per key.  Bulks are kept in append order and
/// probed newest-first on read; the first bulk that verifies wins.
#[derive(Serialize, Deserialize)]
pub struct ActionCacheEntry {
    pub key: ActionCacheKey,
    pub bulks: Vec<ActionCacheBulk>,
}

/// A miss is the expected, non-fatal outcome meaning "run the action for
/// real"; `Other` carries I/O failures that occurred while attempting the
/// read and must not be mistaken for a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("restored artifacts do not match the expected set")]
    ArtifactMismatch,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Lock-free hit/miss/store counters plus byte totals, read and write paths
/// separated.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    read_compressed: AtomicU64,
    read_uncompressed: AtomicU64,
    write_compressed: AtomicU64,
    write_uncompressed: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    fn add_read(&self, stats: BundleStats) {
        self.read_compressed
            .fetch_add(stats.compressed, Ordering::Relaxed);
        self.read_uncompressed
            .fetch_add(stats.uncompressed, Ordering::Relaxed);
    }

    fn add_write(&self, stats: BundleStats) {
        self.write_compressed
            .fetch_add(stats.compressed, Ordering::Relaxed);
        self.write_uncompressed
            .fetch_add(stats.uncompressed, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "action cache: {} hits, {} misses, {} stores",
            self.hits(),
            self.misses(),
            self.stores()
        )?;
        writeln!(
            f,
            "  read:  {} B compressed, {} B uncompressed",
            self.read_compressed.load(Ordering::Relaxed),
            self.read_uncompressed.load(Ordering::Relaxed)
        )?;
        write!(
            f,
            "  write: {} B compressed, {} B uncompressed",
            self.write_compressed.load(Ordering::Relaxed),
            self.write_uncompressed.load(Ordering::Relaxed)
        )
    }
}

pub struct ActionCache {
    fs: Arc<dyn FileSystem>,
    /// Artifact and input paths are stored relative to this root.
    workspace: PathBuf,
    root: PathBuf,
    codec: Codec,
    seed: Fingerprint,
    stats: Arc<CacheStats>,
}

impl ActionCache {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        workspace: &Path,
        root: &Path,
        seed: Fingerprint,
    ) -> ActionCache {
        ActionCache {
            fs,
            workspace: workspace.to_path_buf(),
            root: root.to_path_buf(),
            codec: Codec::default(),
            seed,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> ActionCache {
        self.codec = codec;
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Prints the stats summary when the process exits.
    pub fn print_stats_on_exit(&self) {
        let stats = self.stats.clone();
        exit::on_exit(move || println!("{}", stats));
    }

    /// Content-digests the given input files, in parallel, sorted by path
    /// so the result feeds deterministically into a key.
    pub fn digest_inputs(&self, inputs: &[PathBuf]) -> anyhow::Result<Vec<FileDigest>> {
        let mut sorted: Vec<&PathBuf> = inputs.iter().collect();
        sorted.sort();
        sorted
            .par_iter()
            .map(|path| {
                let content = self
                    .fs
                    .read(path)
                    .with_context(|| format!("read cache input {}", path.display()))?;
                Ok(FileDigest {
                    source: (*path).clone(),
                    digest: Fingerprint::of_bytes(self.seed, &content),
                })
            })
            .collect()
    }

    /// Derives the cache key: the action's own parameters (written by
    /// `params`) followed by every input digest.
    pub fn make_key(
        &self,
        params: impl FnOnce(&mut FingerprintWriter),
        inputs: &[FileDigest],
    ) -> ActionCacheKey {
        ActionCacheKey(serialize_any_fingerprint(self.seed, |w| {
            params(w);
            for input in inputs {
                w.write_str(&input.source.to_string_lossy());
                w.write_fingerprint(&input.digest);
            }
        }))
    }

    /// Sharded entry-file path: two nested directories from the leading hex
    /// of the key bound per-directory fan-out.
    pub fn entry_path(&self, key: ActionCacheKey) -> PathBuf {
        self.keyed_path(key, &format!("{}.cache.{}", key, self.codec.ext()))
    }

    fn bulk_path(&self, key: ActionCacheKey, index: usize) -> PathBuf {
        let name = if index == 0 {
            format!("{}.bulk.{}", key, self.codec.ext())
        } else {
            format!("{}-{}.bulk.{}", key, index, self.codec.ext())
        };
        self.keyed_path(key, &name)
    }

    fn keyed_path(&self, key: ActionCacheKey, name: &str) -> PathBuf {
        let hex = key.fingerprint().to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(name)
    }

    fn load_entry(&self, key: ActionCacheKey) -> anyhow::Result<Option<ActionCacheEntry>> {
        // Accept entries written under either codec, whatever our default.
        for codec in [self.codec, other_codec(self.codec)] {
            let path = self
                .keyed_path(key, &format!("{}.cache.{}", key, codec.ext()));
            let bytes = match self.fs.read(&path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("read cache entry {}", path.display()))
                }
            };
            let json = codec
                .decompress(&bytes)
                .with_context(|| format!("decompress cache entry {}", path.display()))?;
            let entry: ActionCacheEntry = serde_json::from_slice(&json)
                .with_context(|| format!("parse cache entry {}", path.display()))?;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    fn store_entry(&self, entry: &ActionCacheEntry) -> anyhow::Result<()> {
        let path = self.entry_path(entry.key);
        let json = serde_json::to_vec(entry)?;
        let packed = self.codec.compress(&json)?;
        self.fs
            .write(&path, &packed)
            .with_context(|| format!("write cache entry {}", path.display()))
    }

    /// True while every recorded input's current content still matches.
    fn bulk_is_fresh(&self, bulk: &ActionCacheBulk) -> bool {
        bulk.inputs.par_iter().all(|input| {
            match self.fs.read(&input.source) {
                Ok(content) => Fingerprint::of_bytes(self.seed, &content) == input.digest,
                Err(_) => false,
            }
        })
    }

    /// Looks up `key` and restores a still-valid bulk whose artifact set
    /// exactly equals `expected`.  A miss means "run the action"; real I/O
    /// failures propagate as `CacheError::Other`.
    pub fn cache_read(
        &self,
        key: ActionCacheKey,
        expected: &[PathBuf],
    ) -> Result<Vec<PathBuf>, CacheError> {
        let entry = match self.load_entry(key)? {
            Some(entry) => entry,
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "cache miss: no entry");
                return Err(CacheError::Miss);
            }
        };

        let mut expected_sorted: Vec<PathBuf> = expected.to_vec();
        expected_sorted.sort();

        let mut mismatched = false;
        for bulk in entry.bulks.iter().rev() {
            // Reject on the recorded artifact list before unpacking: a
            // refused read must leave the workspace untouched.
            if bulk.artifacts != expected_sorted {
                mismatched = true;
                continue;
            }
            if !self.bulk_is_fresh(bulk) {
                debug!(%key, bulk = %bulk.path.display(), "stale bulk, skipping");
                continue;
            }
            let (restored, stats) = match bundle::inflate(&*self.fs, &self.workspace, &bulk.path) {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(%key, bulk = %bulk.path.display(), error = %err, "bulk restore failed");
                    continue;
                }
            };
            let mut restored_sorted: Vec<PathBuf> = restored.clone();
            restored_sorted.sort();
            if restored_sorted != expected_sorted {
                warn!(%key, bulk = %bulk.path.display(), "bundle contents disagree with entry record");
                mismatched = true;
                continue;
            }
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.add_read(stats);
            debug!(%key, artifacts = restored.len(), "cache hit");
            return Ok(restored);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if mismatched {
            Err(CacheError::ArtifactMismatch)
        } else {
            Err(CacheError::Miss)
        }
    }

    /// Bundles `artifacts` under `key`.  A write whose input set already
    /// matches an existing bulk is a no-op; only a dirty write touches
    /// disk.  Returns whether anything was written.
    pub fn cache_write(
        &self,
        key: ActionCacheKey,
        artifacts: &[PathBuf],
        mut inputs: Vec<FileDigest>,
    ) -> anyhow::Result<bool> {
        inputs.sort_by(|a, b| a.source.cmp(&b.source));
        let mut sorted_artifacts: Vec<PathBuf> = artifacts.to_vec();
        sorted_artifacts.sort();
        let mut entry = match self.load_entry(key)? {
            Some(entry) => entry,
            None => ActionCacheEntry {
                key,
                bulks: Vec::new(),
            },
        };
        if entry
            .bulks
            .iter()
            .any(|bulk| bulk.inputs == inputs && bulk.artifacts == sorted_artifacts)
        {
            debug!(%key, "equivalent bulk already cached, skipping write");
            return Ok(false);
        }
        let path = self.bulk_path(key, entry.bulks.len());
        let stats = bundle::deflate(&*self.fs, &self.workspace, artifacts, self.codec, &path)?;
        entry.bulks.push(ActionCacheBulk {
            path,
            artifacts: sorted_artifacts,
            inputs,
        });
        self.store_entry(&entry)?;
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        self.stats.add_write(stats);
        debug!(%key, artifacts = artifacts.len(), "cache store");
        Ok(true)
    }

    /// Fire-and-forget write for a just-built node.  The node's transitive
    /// file inputs are resolved from the graph here, while its edges are
    /// fresh; digesting, compression and the entry update then happen on
    /// the worker pool so the caller does not block on archiving its own
    /// output.
    pub fn async_cache_write(
        self: &Arc<Self>,
        pool: &WorkerPool,
        graph: &BuildGraph,
        node: &Arc<BuildNode>,
        key: ActionCacheKey,
        artifacts: Vec<PathBuf>,
    ) {
        let inputs = node_inputs(graph, node);
        let cache = self.clone();
        pool.queue(move || {
            let result = cache
                .digest_inputs(&inputs)
                .and_then(|digests| cache.cache_write(key, &artifacts, digests));
            if let Err(err) = result {
                warn!(%key, error = format!("{:#}", err), "async cache write failed");
            }
        });
    }
}

/// The transitive file inputs of a node: every file probe reachable through
/// its static and dynamic edges, deduplicated and sorted.
pub fn node_inputs(graph: &BuildGraph, node: &Arc<BuildNode>) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![node.clone()];
    let mut inputs = BTreeSet::new();
    while let Some(node) = stack.pop() {
        for alias in node.input_aliases() {
            if !seen.insert(alias.clone()) {
                continue;
            }
            if alias.category() == FILE_CATEGORY {
                inputs.insert(PathBuf::from(alias_path(&alias)));
            }
            if let Some(dep) = graph.node(&alias) {
                stack.push(dep);
            }
        }
    }
    inputs.into_iter().collect()
}

fn other_codec(codec: Codec) -> Codec {
    match codec {
        Codec::Store => Codec::Deflate,
        Codec::Deflate => Codec::Store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;

    fn test_cache(workspace: &Path) -> ActionCache {
        ActionCache::new(
            Arc::new(RealFileSystem::new()),
            workspace,
            &workspace.join(".cache"),
            Fingerprint::of_bytes(Fingerprint::ZERO, b"test-seed"),
        )
    }

    #[test]
    fn entry_path_is_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let key = cache.make_key(|w| w.write_str("cc -c main.c"), &[]);
        let hex = key.fingerprint().to_hex();
        let path = cache.entry_path(key);
        let rel = path.strip_prefix(dir.path().join(".cache")).unwrap();
        let parts: Vec<_> = rel.components().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_os_str(), &hex[0..2]);
        assert_eq!(parts[1].as_os_str(), &hex[2..4]);
        assert_eq!(
            parts[2].as_os_str().to_string_lossy(),
            format!("{}.cache.z", hex)
        );
    }

    #[test]
    fn key_depends_on_params_and_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let digest = FileDigest {
            source: PathBuf::from("in.c"),
            digest: Fingerprint::of_bytes(Fingerprint::ZERO, b"int main;"),
        };
        let base = cache.make_key(|w| w.write_str("cc"), std::slice::from_ref(&digest));
        assert_eq!(
            base,
            cache.make_key(|w| w.write_str("cc"), std::slice::from_ref(&digest))
        );
        assert_ne!(
            base,
            cache.make_key(|w| w.write_str("cc -O2"), std::slice::from_ref(&digest))
        );
        let changed = FileDigest {
            digest: Fingerprint::of_bytes(Fingerprint::ZERO, b"int main() {}"),
            ..digest.clone()
        };
        assert_ne!(base, cache.make_key(|w| w.write_str("cc"), &[changed]));
    }

    #[test]
    fn read_on_empty_cache_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let key = cache.make_key(|w| w.write_str("x"), &[]);
        match cache.cache_read(key, &[]) {
            Err(CacheError::Miss) => {}
            other => panic!("expected miss, got {:?}", other.map(|_| ())),
        }
        assert_eq!(cache.stats().misses(), 1);
    }
}

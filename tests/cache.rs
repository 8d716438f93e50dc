//! Action cache scenarios: store, restore, staleness and the async write
//! path, against a real filesystem in a temporary workspace.

use incra::bundle::Codec;
use incra::cache::{ActionCache, CacheError};
use incra::fs::{FileSystem, RealFileSystem};
use incra::graph::{BuildGraph, GraphOptions};
use incra::hash::Fingerprint;
use incra::pool::WorkerPool;
use incra::units::{file_alias, GeneratedFile};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

struct CacheSpace {
    dir: tempfile::TempDir,
    fs: Arc<RealFileSystem>,
    cache: Arc<ActionCache>,
}

impl CacheSpace {
    fn new() -> anyhow::Result<CacheSpace> {
        Self::with_codec(Codec::default())
    }

    fn with_codec(codec: Codec) -> anyhow::Result<CacheSpace> {
        let dir = tempfile::tempdir()?;
        let fs = Arc::new(RealFileSystem::new());
        let seed = Fingerprint::of_bytes(Fingerprint::ZERO, b"cache-test");
        let cache = Arc::new(
            ActionCache::new(fs.clone(), dir.path(), &dir.path().join(".cache"), seed)
                .with_codec(codec),
        );
        Ok(CacheSpace { dir, fs, cache })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &str) -> anyhow::Result<()> {
        Ok(self.fs.write(&self.path(name), content.as_bytes())?)
    }

    fn read(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        Ok(self.fs.read(&self.path(name))?)
    }
}

#[test]
fn store_then_restore() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("main.c", "int main() { return 0; }")?;
    space.write("main.o", "OBJECT-CODE")?;

    let inputs = space.cache.digest_inputs(&[space.path("main.c")])?;
    let key = space.cache.make_key(|w| w.write_str("cc -c main.c"), &inputs);
    let artifacts = vec![space.path("main.o")];
    assert!(space.cache.cache_write(key, &artifacts, inputs)?);

    // A clean checkout: the artifact is gone but the inputs survive.
    space.fs.remove(&space.path("main.o"))?;
    let restored = space.cache.cache_read(key, &artifacts)?;
    assert_eq!(restored, artifacts);
    assert_eq!(space.read("main.o")?, b"OBJECT-CODE");
    assert_eq!(space.cache.stats().hits(), 1);
    assert_eq!(space.cache.stats().stores(), 1);
    Ok(())
}

#[test]
fn store_codec_round_trips_too() -> anyhow::Result<()> {
    let space = CacheSpace::with_codec(Codec::Store)?;
    space.write("in", "uncompressed path")?;
    space.write("artifact", "bytes")?;

    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("copy"), &inputs);
    let artifacts = vec![space.path("artifact")];
    space.cache.cache_write(key, &artifacts, inputs)?;

    space.fs.remove(&space.path("artifact"))?;
    space.cache.cache_read(key, &artifacts)?;
    assert_eq!(space.read("artifact")?, b"bytes");
    Ok(())
}

#[test]
fn equivalent_write_is_skipped() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "source")?;
    space.write("out", "result")?;

    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("gen"), &inputs);
    let artifacts = vec![space.path("out")];
    assert!(space.cache.cache_write(key, &artifacts, inputs.clone())?);
    assert!(!space.cache.cache_write(key, &artifacts, inputs)?);
    assert_eq!(space.cache.stats().stores(), 1);
    Ok(())
}

#[test]
fn stale_inputs_turn_into_a_miss() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "v1")?;
    space.write("out", "built from v1")?;

    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("gen"), &inputs);
    let artifacts = vec![space.path("out")];
    space.cache.cache_write(key, &artifacts, inputs)?;

    // The recorded bulk no longer matches the file on disk.
    space.write("in", "v2")?;
    space.fs.remove(&space.path("out"))?;
    match space.cache.cache_read(key, &artifacts) {
        Err(CacheError::Miss) => {}
        other => panic!("expected miss, got {:?}", other.map(|_| ())),
    }
    // The stale bulk must not have clobbered the workspace.
    assert!(space.read("out").is_err());
    Ok(())
}

#[test]
fn newest_valid_bulk_wins() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "shared")?;
    let artifacts = vec![space.path("out")];
    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("gen"), &inputs);

    space.write("out", "older")?;
    space.cache.cache_write(key, &artifacts, inputs.clone())?;

    // A second bulk under the same key with a wider input set.
    space.write("extra", "also consumed")?;
    space.write("out", "newer")?;
    let mut wider = inputs;
    wider.extend(space.cache.digest_inputs(&[space.path("extra")])?);
    space.cache.cache_write(key, &artifacts, wider)?;

    space.fs.remove(&space.path("out"))?;
    space.cache.cache_read(key, &artifacts)?;
    assert_eq!(space.read("out")?, b"newer");
    Ok(())
}

#[test]
fn unexpected_artifact_set_is_rejected() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "x")?;
    space.write("a.out", "binary")?;

    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("link"), &inputs);
    space.cache.cache_write(key, &[space.path("a.out")], inputs)?;
    space.fs.remove(&space.path("a.out"))?;

    match space.cache.cache_read(key, &[space.path("b.out")]) {
        Err(CacheError::ArtifactMismatch) => {}
        other => panic!("expected artifact mismatch, got {:?}", other.map(|_| ())),
    }
    // A rejected read leaves the workspace untouched: neither the asked-for
    // artifact nor the bulk's own contents appear.
    assert!(space.read("a.out").is_err());
    assert!(space.read("b.out").is_err());
    Ok(())
}

#[test]
fn async_write_digests_the_nodes_inputs() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "async source")?;
    space.write("out", "async result")?;

    let graph = BuildGraph::new(space.fs.clone(), GraphOptions::default());
    let unit = GeneratedFile::new(&space.path("out"), "async result");
    let node = graph.create(Box::new(unit), &[file_alias(&space.path("in"))], false);

    // The input set comes from the node's edges, not from the caller.
    let digests = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("gen"), &digests);

    let pool = WorkerPool::new(NonZeroUsize::new(2).unwrap());
    space
        .cache
        .async_cache_write(&pool, &graph, &node, key, vec![space.path("out")]);
    pool.join();

    space.fs.remove(&space.path("out"))?;
    space.cache.cache_read(key, &[space.path("out")])?;
    assert_eq!(space.read("out")?, b"async result");
    Ok(())
}

#[test]
fn restore_preserves_mtime() -> anyhow::Result<()> {
    let space = CacheSpace::new()?;
    space.write("in", "x")?;
    space.write("out", "y")?;
    let original = space.fs.stat(&space.path("out"))?.mtime;

    let inputs = space.cache.digest_inputs(&[space.path("in")])?;
    let key = space.cache.make_key(|w| w.write_str("gen"), &inputs);
    space.cache.cache_write(key, &[space.path("out")], inputs)?;

    std::thread::sleep(std::time::Duration::from_millis(20));
    space.fs.remove(&space.path("out"))?;
    space.cache.cache_read(key, &[space.path("out")])?;
    assert_eq!(space.fs.stat(&space.path("out"))?.mtime, original);
    Ok(())
}

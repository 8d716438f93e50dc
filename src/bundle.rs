//! Compressed artifact bundles.
//!
//! A bulk is one bundle file holding every artifact an action produced:
//! per entry the workspace-relative path, the original mtime (restored on
//! inflate so downstream tools see stable times), a codec tag and the
//! compressed bytes.  Each entry carries its own tag, so decode accepts any
//! codec regardless of what the writer currently defaults to.

use crate::fs::{FileSystem, MTime};
use crate::serial::{ArchiveReader, ArchiveWriter};
use anyhow::{bail, Context};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const BUNDLE_MAGIC: [u8; 4] = *b"IBLK";
const BUNDLE_VERSION: u32 = 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Codec {
    /// No compression; cheapest write path.
    Store,
    /// Deflate at a speed-leaning level: bulks are written on the hot path
    /// right after a compile, so write latency beats ratio.
    Deflate,
}

impl Codec {
    /// File extension used in cache paths.
    pub fn ext(&self) -> &'static str {
        match self {
            Codec::Store => "raw",
            Codec::Deflate => "z",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Codec::Store => 0,
            Codec::Deflate => 1,
        }
    }

    fn from_tag(tag: u8) -> anyhow::Result<Codec> {
        match tag {
            0 => Ok(Codec::Store),
            1 => Ok(Codec::Deflate),
            _ => bail!("unknown codec tag {}", tag),
        }
    }

    pub fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::Store => Ok(data.to_vec()),
            Codec::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
                enc.write_all(data)?;
                enc.finish()
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::Store => Ok(data.to_vec()),
            Codec::Deflate => {
                let mut out = Vec::new();
                DeflateDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Deflate
    }
}

/// Byte counts from one deflate/inflate pass, fed into the cache stats.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleStats {
    pub uncompressed: u64,
    pub compressed: u64,
}

/// Deflates `artifacts` (paths under `workspace`) into a bundle at
/// `bundle_path`.  Paths are recorded relative to the workspace root so a
/// bundle restores correctly in a different checkout.
pub fn deflate(
    fs: &dyn FileSystem,
    workspace: &Path,
    artifacts: &[PathBuf],
    codec: Codec,
    bundle_path: &Path,
) -> anyhow::Result<BundleStats> {
    let mut stats = BundleStats::default();
    let mut buf = Vec::new();
    buf.extend_from_slice(&BUNDLE_MAGIC);
    {
        let mut w = ArchiveWriter::new(&mut buf);
        w.write_u32(BUNDLE_VERSION)?;
        w.write_u32(artifacts.len() as u32)?;
        for artifact in artifacts {
            let rel = artifact.strip_prefix(workspace).with_context(|| {
                format!(
                    "artifact {} is outside workspace {}",
                    artifact.display(),
                    workspace.display()
                )
            })?;
            let stat = fs.stat(artifact)?;
            let mtime = match stat.mtime {
                MTime::Missing => bail!("artifact not found: {}", artifact.display()),
                MTime::Stamp(t) => t,
            };
            let content = fs.read(artifact)?;
            let compressed = codec.compress(&content)?;
            stats.uncompressed += content.len() as u64;
            stats.compressed += compressed.len() as u64;
            w.write_str(&rel.to_string_lossy())?;
            w.write_time(mtime)?;
            w.write_u8(codec.tag())?;
            w.write_u64(content.len() as u64)?;
            w.write_bytes(&compressed)?;
        }
    }
    fs.write(bundle_path, &buf)
        .with_context(|| format!("write bundle {}", bundle_path.display()))?;
    Ok(stats)
}

/// Restores every artifact in the bundle under `workspace`, preserving the
/// recorded modification times.  Returns the restored absolute paths.
pub fn inflate(
    fs: &dyn FileSystem,
    workspace: &Path,
    bundle_path: &Path,
) -> anyhow::Result<(Vec<PathBuf>, BundleStats)> {
    let bytes = fs
        .read(bundle_path)
        .with_context(|| format!("read bundle {}", bundle_path.display()))?;
    if bytes.len() < 4 || bytes[..4] != BUNDLE_MAGIC {
        bail!("bad bundle magic in {}", bundle_path.display());
    }
    let mut cur = &bytes[4..];
    let mut r = ArchiveReader::new(&mut cur);
    let version = r.read_u32()?;
    if version > BUNDLE_VERSION {
        bail!(
            "bundle version {} is newer than supported version {}",
            version,
            BUNDLE_VERSION
        );
    }
    let count = r.read_u32()?;
    let mut stats = BundleStats::default();
    let mut restored = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let rel = PathBuf::from(r.read_str()?);
        let mtime = r.read_time()?;
        let codec = Codec::from_tag(r.read_u8()?)?;
        let raw_len = r.read_u64()?;
        let compressed = r.read_bytes()?;
        let content = codec.decompress(&compressed)?;
        if content.len() as u64 != raw_len {
            bail!(
                "bundle entry {} decompressed to {} bytes, expected {}",
                rel.display(),
                content.len(),
                raw_len
            );
        }
        stats.uncompressed += content.len() as u64;
        stats.compressed += compressed.len() as u64;
        let dest = workspace.join(&rel);
        fs.write(&dest, &content)?;
        fs.set_mtime(&dest, mtime)?;
        restored.push(dest);
    }
    Ok((restored, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use std::time::{Duration, SystemTime};

    #[test]
    fn codec_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        for codec in [Codec::Store, Codec::Deflate] {
            let packed = codec.compress(&data).unwrap();
            assert_eq!(codec.decompress(&packed).unwrap(), data);
        }
        // Repetitive input actually shrinks under deflate.
        assert!(Codec::Deflate.compress(&data).unwrap().len() < data.len());
    }

    #[test]
    fn bundle_round_trip_preserves_content_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem::new();
        let workspace = dir.path();
        let a = workspace.join("out/a.o");
        let b = workspace.join("out/b.o");
        fs.write(&a, b"object a").unwrap();
        fs.write(&b, b"object b").unwrap();
        let then = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        fs.set_mtime(&a, then).unwrap();

        let bundle = workspace.join("cache/x.bulk.z");
        deflate(
            &fs,
            workspace,
            &[a.clone(), b.clone()],
            Codec::Deflate,
            &bundle,
        )
        .unwrap();

        fs.remove(&a).unwrap();
        fs.remove(&b).unwrap();
        let (restored, _) = inflate(&fs, workspace, &bundle).unwrap();
        assert_eq!(restored, vec![a.clone(), b.clone()]);
        assert_eq!(fs.read(&a).unwrap(), b"object a");
        assert_eq!(fs.read(&b).unwrap(), b"object b");
        match fs.stat(&a).unwrap().mtime {
            MTime::Stamp(t) => assert_eq!(t, then),
            MTime::Missing => panic!("restored file missing"),
        }
    }

    #[test]
    fn inflate_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem::new();
        let path = dir.path().join("junk.bulk.z");
        fs.write(&path, b"not a bundle").unwrap();
        assert!(inflate(&fs, dir.path(), &path).is_err());
    }
}

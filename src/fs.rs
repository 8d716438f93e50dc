//! The filesystem seam.
//!
//! The engine only touches disk through the `FileSystem` trait, keeping
//! platform details (atomic replace, mtime restoration, enumeration) out of
//! the graph and cache logic.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The mtime observed for a path.  A missing file is a variant of its own
/// rather than an `Option` wrapper, so call sites match one enum.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MTime {
    Missing,
    Stamp(SystemTime),
}

/// stat() output: presence, mtime and size in one probe.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FileStat {
    pub mtime: MTime,
    pub size: u64,
}

impl FileStat {
    pub const MISSING: FileStat = FileStat {
        mtime: MTime::Missing,
        size: 0,
    };

    pub fn exists(&self) -> bool {
        !matches!(self.mtime, MTime::Missing)
    }
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// stat() a path; a missing file is `FileStat::MISSING`, not an error.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Replace-on-write: the new content becomes visible atomically, so a
    /// crashed process never leaves a half-written file behind.
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Restore a file's recorded modification time after a cache inflate.
    fn set_mtime(&self, path: &Path, mtime: SystemTime) -> io::Result<()>;

    /// Recursively enumerate files under `dir` whose names match `pattern`
    /// (see [`glob_match`]), sorted for determinism.
    fn glob(&self, dir: &Path, pattern: &str) -> io::Result<Vec<PathBuf>>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Simple `*`/`?` glob over a file name (not a full path).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pat: &[u8], text: &[u8]) -> bool {
        match pat.split_first() {
            None => text.is_empty(),
            Some((b'*', rest)) => {
                (0..=text.len()).any(|skip| inner(rest, &text[skip..]))
            }
            Some((b'?', rest)) => !text.is_empty() && inner(rest, &text[1..]),
            Some((&c, rest)) => text.first() == Some(&c) && inner(rest, &text[1..]),
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(FileStat {
                mtime: MTime::Stamp(meta.modified()?),
                size: meta.len(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileStat::MISSING),
            Err(err) => Err(err),
        }
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        // Write to a sibling temp file, then rename over the destination.
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)
    }

    fn set_mtime(&self, path: &Path, mtime: SystemTime) -> io::Result<()> {
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(mtime))
    }

    fn glob(&self, dir: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let mut out = BTreeSet::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(cur) = stack.pop() {
            for entry in std::fs::read_dir(&cur)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else {
                    let name = entry.file_name();
                    if glob_match(pattern, &name.to_string_lossy()) {
                        out.insert(path);
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*.o", "foo.o"));
        assert!(!glob_match("*.o", "foo.obj"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*.tar.*", "x.tar.gz"));
    }

    #[test]
    fn atomic_write_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem::new();
        let path = dir.path().join("sub").join("f.txt");
        fs.write(&path, b"content").unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"content");
        let stat = fs.stat(&path).unwrap();
        assert!(stat.exists());
        assert_eq!(stat.size, 7);
        assert_eq!(fs.stat(&dir.path().join("nope")).unwrap(), FileStat::MISSING);
    }

    #[test]
    fn mtime_restore() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem::new();
        let path = dir.path().join("f");
        fs.write(&path, b"x").unwrap();
        let then = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        fs.set_mtime(&path, then).unwrap();
        match fs.stat(&path).unwrap().mtime {
            MTime::Stamp(t) => assert_eq!(t, then),
            MTime::Missing => panic!("file missing"),
        }
    }
}

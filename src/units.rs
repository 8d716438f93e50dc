//! The concrete buildables the engine ships: file and directory probes and
//! a generated-file writer.  Probes have no dependencies, so the graph
//! treats them as roots and re-stats them on every run; their stamp only
//! changes when the probed content does.

use crate::graph::{BuildAlias, Buildable};
use crate::hash::{serialize_any_fingerprint, Fingerprint};
use crate::serial::{ArchiveReader, ArchiveWriter, Registry};
use crate::work::ExecuteContext;
use anyhow::bail;
use std::path::{Path, PathBuf};

pub const FILE_CATEGORY: &str = "File";
pub const DIR_CATEGORY: &str = "Dir";
pub const GEN_CATEGORY: &str = "Gen";

pub fn file_alias(path: &Path) -> BuildAlias {
    BuildAlias::new(FILE_CATEGORY, &path.to_string_lossy())
}

pub fn dir_alias(path: &Path) -> BuildAlias {
    BuildAlias::new(DIR_CATEGORY, &path.to_string_lossy())
}

/// The path part of a `<category>://<path>` alias.
pub fn alias_path(alias: &BuildAlias) -> &str {
    alias
        .as_str()
        .split_once("://")
        .map(|(_, path)| path)
        .unwrap_or("")
}

/// Probes one file: stats it and fingerprints its content.
pub struct FileUnit {
    path: PathBuf,
    digest: Fingerprint,
}

impl FileUnit {
    pub fn new(path: &Path) -> FileUnit {
        FileUnit {
            path: path.to_path_buf(),
            digest: Fingerprint::ZERO,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content digest as of the last build; zero before the first.
    pub fn digest(&self) -> Fingerprint {
        self.digest
    }

    pub fn deserialize(r: &mut ArchiveReader) -> anyhow::Result<Box<dyn Buildable>> {
        let path = PathBuf::from(r.read_str()?);
        let digest = r.read_fingerprint()?;
        Ok(Box::new(FileUnit { path, digest }))
    }
}

impl Buildable for FileUnit {
    fn alias(&self) -> BuildAlias {
        file_alias(&self.path)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "File"
    }

    fn serialize(&self, w: &mut ArchiveWriter) -> anyhow::Result<()> {
        w.write_str(&self.path.to_string_lossy())?;
        w.write_fingerprint(&self.digest)?;
        Ok(())
    }

    fn build(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<()> {
        match ctx.digest_file(&self.path)? {
            None => bail!("file not found: {}", self.path.display()),
            Some(stamp) => {
                self.digest = stamp.content;
                // Keep the probed file's own mtime so an unchanged file is
                // not mistaken for modified between runs.
                ctx.timestamp(stamp.mtime);
                Ok(())
            }
        }
    }
}

/// Probes a directory: fingerprints the glob-filtered recursive listing.
pub struct DirectoryUnit {
    path: PathBuf,
    pattern: String,
    digest: Fingerprint,
}

impl DirectoryUnit {
    pub fn new(path: &Path, pattern: &str) -> DirectoryUnit {
        DirectoryUnit {
            path: path.to_path_buf(),
            pattern: pattern.to_string(),
            digest: Fingerprint::ZERO,
        }
    }

    pub fn digest(&self) -> Fingerprint {
        self.digest
    }

    pub fn deserialize(r: &mut ArchiveReader) -> anyhow::Result<Box<dyn Buildable>> {
        let path = PathBuf::from(r.read_str()?);
        let pattern = r.read_str()?;
        let digest = r.read_fingerprint()?;
        Ok(Box::new(DirectoryUnit {
            path,
            pattern,
            digest,
        }))
    }
}

impl Buildable for DirectoryUnit {
    fn alias(&self) -> BuildAlias {
        dir_alias(&self.path)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "Directory"
    }

    fn serialize(&self, w: &mut ArchiveWriter) -> anyhow::Result<()> {
        w.write_str(&self.path.to_string_lossy())?;
        w.write_str(&self.pattern)?;
        w.write_fingerprint(&self.digest)?;
        Ok(())
    }

    fn build(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<()> {
        let stat = ctx.fs().stat(&self.path)?;
        if !stat.exists() {
            bail!("directory not found: {}", self.path.display());
        }
        let entries = ctx.fs().glob(&self.path, &self.pattern)?;
        self.digest = serialize_any_fingerprint(ctx.graph().seed(), |w| {
            for entry in &entries {
                w.write_str(&entry.to_string_lossy());
            }
        });
        if let crate::fs::MTime::Stamp(t) = stat.mtime {
            ctx.timestamp(t);
        }
        Ok(())
    }
}

/// Writes declared content to a file and tracks it as an output, so a
/// deleted or edited file is regenerated on the next run.
pub struct GeneratedFile {
    path: PathBuf,
    content: Vec<u8>,
}

impl GeneratedFile {
    pub fn new(path: &Path, content: impl Into<Vec<u8>>) -> GeneratedFile {
        GeneratedFile {
            path: path.to_path_buf(),
            content: content.into(),
        }
    }

    pub fn deserialize(r: &mut ArchiveReader) -> anyhow::Result<Box<dyn Buildable>> {
        let path = PathBuf::from(r.read_str()?);
        let content = r.read_bytes()?;
        Ok(Box::new(GeneratedFile { path, content }))
    }
}

impl Buildable for GeneratedFile {
    fn alias(&self) -> BuildAlias {
        BuildAlias::new(GEN_CATEGORY, &self.path.to_string_lossy())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "GeneratedFile"
    }

    fn serialize(&self, w: &mut ArchiveWriter) -> anyhow::Result<()> {
        w.write_str(&self.path.to_string_lossy())?;
        w.write_bytes(&self.content)?;
        Ok(())
    }

    fn build(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<()> {
        ctx.fs().write(&self.path, &self.content)?;
        ctx.output_file(&self.path)?;
        Ok(())
    }
}

/// Registers the engine's own buildable types.  Call once at startup,
/// before loading a persisted graph.
pub fn register_units(registry: &mut Registry) {
    registry.register("File", FileUnit::deserialize);
    registry.register("Directory", DirectoryUnit::deserialize);
    registry.register("GeneratedFile", GeneratedFile::deserialize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases() {
        let alias = file_alias(Path::new("src/main.c"));
        assert_eq!(alias.as_str(), "File://src/main.c");
        assert_eq!(alias.category(), FILE_CATEGORY);
        assert_eq!(alias_path(&alias), "src/main.c");
    }

    #[test]
    fn file_unit_round_trip() {
        let mut unit = FileUnit::new(Path::new("a/b.c"));
        unit.digest = Fingerprint::of_bytes(Fingerprint::ZERO, b"content");
        let mut buf = Vec::new();
        unit.serialize(&mut ArchiveWriter::new(&mut buf)).unwrap();
        let mut cur = &buf[..];
        let restored = FileUnit::deserialize(&mut ArchiveReader::new(&mut cur)).unwrap();
        let restored = restored.as_any().downcast_ref::<FileUnit>().unwrap();
        assert_eq!(restored.path(), Path::new("a/b.c"));
        assert_eq!(restored.digest(), unit.digest());
    }

    #[test]
    fn registry_registration() {
        let mut registry = Registry::new();
        register_units(&mut registry);
        assert_eq!(
            registry.feature_tags(),
            vec!["Directory", "File", "GeneratedFile"]
        );
    }
}

//! Binary archive primitives and the polymorphic type registry.
//!
//! The persisted build graph stores buildables polymorphically: each payload
//! is prefixed by a 16-byte GUID derived from the type's registered name, and
//! the registry maps that GUID back to a factory that can deserialize the
//! concrete type.  Registering two types under colliding names is a
//! configuration bug and aborts the process.

use crate::graph::Buildable;
use crate::hash::Fingerprint;
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"INCR";
pub const ARCHIVE_VERSION: u32 = 1;

/// Upper bound on any single length-prefixed field; anything larger means a
/// corrupt archive, not a legitimate payload.
const MAX_FIELD_LEN: u32 = 1 << 30;

pub struct ArchiveWriter<'a> {
    w: &'a mut dyn Write,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(w: &'a mut dyn Write) -> Self {
        ArchiveWriter { w }
    }

    pub fn write_u8(&mut self, v: u8) -> std::io::Result<()> {
        self.w.write_all(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        assert!(bytes.len() < MAX_FIELD_LEN as usize, "field too large");
        self.write_u32(bytes.len() as u32)?;
        self.w.write_all(bytes)
    }

    pub fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_fingerprint(&mut self, fp: &Fingerprint) -> std::io::Result<()> {
        self.w.write_all(fp.as_bytes())
    }

    pub fn write_guid(&mut self, guid: TypeGuid) -> std::io::Result<()> {
        self.w.write_all(guid.as_bytes())
    }

    /// Times are stored as a (seconds, nanos) pair since the unix epoch;
    /// pre-epoch times clamp to zero.
    pub fn write_time(&mut self, t: SystemTime) -> std::io::Result<()> {
        let d = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.write_u64(d.as_secs())?;
        self.write_u32(d.subsec_nanos())
    }
}

pub struct ArchiveReader<'a> {
    r: &'a mut dyn Read,
}

impl<'a> ArchiveReader<'a> {
    pub fn new(r: &'a mut dyn Read) -> Self {
        ArchiveReader { r }
    }

    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.r.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_FIELD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("field length {} exceeds limit", len),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.r.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_str(&mut self) -> std::io::Result<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn read_fingerprint(&mut self) -> std::io::Result<Fingerprint> {
        let mut buf = [0u8; 32];
        self.r.read_exact(&mut buf)?;
        Ok(Fingerprint::from_bytes(buf))
    }

    pub fn read_guid(&mut self) -> std::io::Result<TypeGuid> {
        let mut buf = [0u8; 16];
        self.r.read_exact(&mut buf)?;
        Ok(TypeGuid::from_bytes(buf))
    }

    pub fn read_time(&mut self) -> std::io::Result<SystemTime> {
        let secs = self.read_u64()?;
        let nanos = self.read_u32()?;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(secs, nanos))
    }
}

/// Writes the archive header: magic, version, and the feature-tag list.
/// The tag list is always recomputed from the registry at write time.
pub fn write_header(w: &mut ArchiveWriter, tags: &[String]) -> anyhow::Result<()> {
    w.w.write_all(&ARCHIVE_MAGIC)?;
    w.write_u32(ARCHIVE_VERSION)?;
    w.write_u32(tags.len() as u32)?;
    for tag in tags {
        w.write_str(tag)?;
    }
    Ok(())
}

/// Reads and validates the archive header, returning the stored tag list.
/// Wrong magic or a newer version is a hard error, never a silent misread.
pub fn read_header(r: &mut ArchiveReader) -> anyhow::Result<Vec<String>> {
    let mut magic = [0u8; 4];
    r.r.read_exact(&mut magic).context("read archive magic")?;
    if magic != ARCHIVE_MAGIC {
        bail!("bad archive magic {:02x?}", magic);
    }
    let version = r.read_u32().context("read archive version")?;
    if version > ARCHIVE_VERSION {
        bail!(
            "archive version {} is newer than supported version {}",
            version,
            ARCHIVE_VERSION
        );
    }
    let count = r.read_u32().context("read tag count")?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tags.push(r.read_str().context("read feature tag")?);
    }
    Ok(tags)
}

/// 16-byte identifier derived from a type's registered name.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TypeGuid([u8; 16]);

impl TypeGuid {
    pub fn of_name(name: &str) -> Self {
        let fp = Fingerprint::of_str(Fingerprint::ZERO, name);
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&fp.as_bytes()[..16]);
        TypeGuid(guid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TypeGuid(bytes)
    }
}

impl fmt::Debug for TypeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeGuid({})", hex::encode(self.0))
    }
}

pub type Factory = fn(&mut ArchiveReader) -> anyhow::Result<Box<dyn Buildable>>;

struct Registration {
    name: &'static str,
    factory: Factory,
}

/// Maps stable type names to deserialization factories.  Built once at
/// startup and then only read.
pub struct Registry {
    by_guid: FxHashMap<TypeGuid, Registration>,
    by_name: FxHashMap<&'static str, TypeGuid>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            by_guid: FxHashMap::default(),
            by_name: FxHashMap::default(),
        }
    }

    /// Registers a concrete buildable type.  Panics on duplicate names or a
    /// GUID collision: both are fatal configuration errors.
    pub fn register(&mut self, name: &'static str, factory: Factory) {
        let guid = TypeGuid::of_name(name);
        if self.by_name.contains_key(name) {
            panic!("type {:?} registered twice", name);
        }
        if let Some(prev) = self.by_guid.get(&guid) {
            panic!("type guid collision: {:?} vs {:?}", name, prev.name);
        }
        self.by_name.insert(name, guid);
        self.by_guid.insert(guid, Registration { name, factory });
    }

    pub fn guid_of(&self, name: &str) -> Option<TypeGuid> {
        self.by_name.get(name).copied()
    }

    pub fn deserialize(
        &self,
        guid: TypeGuid,
        r: &mut ArchiveReader,
    ) -> anyhow::Result<Box<dyn Buildable>> {
        match self.by_guid.get(&guid) {
            Some(reg) => (reg.factory)(r)
                .with_context(|| format!("deserialize buildable of type {:?}", reg.name)),
            None => bail!("unregistered buildable type guid {:02x?}", guid.as_bytes()),
        }
    }

    /// Sorted registered type names; stored in the archive header so a load
    /// can tell when the registered feature set changed.
    pub fn feature_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.by_name.keys().map(|s| s.to_string()).collect();
        tags.sort();
        tags
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = Vec::new();
        {
            let mut w = ArchiveWriter::new(&mut buf);
            w.write_u8(7).unwrap();
            w.write_u32(0xDEAD_BEEF).unwrap();
            w.write_u64(u64::MAX).unwrap();
            w.write_str("alias://x").unwrap();
            w.write_time(SystemTime::UNIX_EPOCH + Duration::new(12, 34))
                .unwrap();
        }
        let mut cur = &buf[..];
        let mut r = ArchiveReader::new(&mut cur);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_str().unwrap(), "alias://x");
        assert_eq!(
            r.read_time().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::new(12, 34)
        );
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NOPE");
        let mut cur = &buf[..];
        let mut r = ArchiveReader::new(&mut cur);
        assert!(read_header(&mut r).is_err());
    }

    #[test]
    fn header_rejects_newer_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ARCHIVE_MAGIC);
        buf.extend_from_slice(&(ARCHIVE_VERSION + 1).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut cur = &buf[..];
        let mut r = ArchiveReader::new(&mut cur);
        assert!(read_header(&mut r).is_err());
    }

    #[test]
    fn header_round_trip() {
        let tags = vec!["Dir".to_string(), "File".to_string()];
        let mut buf = Vec::new();
        {
            let mut w = ArchiveWriter::new(&mut buf);
            write_header(&mut w, &tags).unwrap();
        }
        let mut cur = &buf[..];
        let mut r = ArchiveReader::new(&mut cur);
        assert_eq!(read_header(&mut r).unwrap(), tags);
    }

    #[test]
    fn guid_is_name_stable() {
        assert_eq!(TypeGuid::of_name("File"), TypeGuid::of_name("File"));
        assert_ne!(TypeGuid::of_name("File"), TypeGuid::of_name("Dir"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        fn fail(_: &mut ArchiveReader) -> anyhow::Result<Box<dyn Buildable>> {
            unreachable!()
        }
        let mut reg = Registry::new();
        reg.register("Twice", fail);
        reg.register("Twice", fail);
    }
}

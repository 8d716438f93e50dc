//! Content fingerprints.
//!
//! Invalidation is driven by comparing fingerprints of content and
//! configuration, not by mtime ordering. Every stamp and cache key in the
//! engine bottoms out in a `Fingerprint` produced here.

use sha2::{Digest, Sha256};
use std::fmt;

/// Separates adjacent variable-length fields so that ("ab","c") and
/// ("a","bc") hash differently.
const UNIT_SEPARATOR: u8 = 0x1F;

/// A 32-byte content digest. The all-zero value is reserved as
/// "invalid/unset" and is never a legal stamp or cache key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const ZERO: Fingerprint = Fingerprint([0; 32]);

    pub fn is_valid(&self) -> bool {
        *self != Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    /// Digest a single byte string under a seed.
    pub fn of_bytes(seed: Fingerprint, bytes: &[u8]) -> Self {
        serialize_any_fingerprint(seed, |w| w.write_bytes(bytes))
    }

    /// Digest a string naming a type, process version, etc.  Used for
    /// registry GUIDs and seed derivation.
    pub fn of_str(seed: Fingerprint, s: &str) -> Self {
        Self::of_bytes(seed, s.as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Fingerprint(buf))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight leading hex chars are plenty for log lines.
        write!(f, "Fingerprint({})", &self.to_hex()[..8])
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Streams a sequence of primitive writes into a digest.
///
/// Identical write sequences with an identical seed always produce an
/// identical fingerprint; that determinism is the entire contract.
pub struct FingerprintWriter {
    hasher: Sha256,
}

impl FingerprintWriter {
    pub fn new(seed: Fingerprint) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        FingerprintWriter { hasher }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.hasher.update(bytes);
        self.hasher.update([UNIT_SEPARATOR]);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.hasher.update([v]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.hasher.update(v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.hasher.update(v.to_le_bytes());
    }

    pub fn write_fingerprint(&mut self, fp: &Fingerprint) {
        self.hasher.update(fp.as_bytes());
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

/// Fingerprint an arbitrary value through a caller-supplied write sequence.
pub fn serialize_any_fingerprint(
    seed: Fingerprint,
    write: impl FnOnce(&mut FingerprintWriter),
) -> Fingerprint {
    let mut w = FingerprintWriter::new(seed);
    write(&mut w);
    w.finish()
}

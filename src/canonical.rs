//! Streaming fingerprints of serializable values.
//!
//! Every fingerprint the compiler exposes (context hash, manifest
//! fingerprint, config hash, candidate set) is the xxh64 digest of the
//! value's JSON encoding, streamed straight into the hasher. Each kind of
//! fingerprint uses its own seed, so a context and a config that happen to
//! encode to the same bytes still hash apart.
//!
//! ## Determinism Guarantees
//!
//! - Struct fields encode in declaration order, vectors in index order
//! - Hashed data holds BTreeMap/BTreeSet, never HashMap
//! - Scores are quantized before hashing where they come from config

use std::fmt;
use std::io;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

/// What a fingerprint identifies. Selects the hash seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    /// A compilation context.
    Context,
    /// A manifest, minus its timestamp.
    Manifest,
    /// Quantized compiler configuration.
    Config,
    /// The collected candidate atoms.
    Candidates,
}

impl FingerprintKind {
    fn seed(self) -> u64 {
        match self {
            Self::Context => 0x6374_7800,
            Self::Manifest => 0x6d6e_6600,
            Self::Config => 0x6366_6700,
            Self::Candidates => 0x6361_6e00,
        }
    }
}

/// A 64-bit fingerprint, displayed as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Raw digest.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Hex form used in manifests and cache keys.
    pub fn to_hex(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// `io::Write` sink feeding an xxh64 state.
struct HashWriter(Xxh64);

impl io::Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fingerprint a value without materializing its encoding.
///
/// Hashed types in this crate only have string or unit-enum map keys, which
/// JSON always accepts.
pub fn fingerprint<T: Serialize + ?Sized>(kind: FingerprintKind, value: &T) -> Fingerprint {
    let mut writer = HashWriter(Xxh64::new(kind.seed()));
    serde_json::to_writer(&mut writer, value).expect("hashed types encode to JSON");
    Fingerprint(writer.0.digest())
}

/// Hex fingerprint of a value.
pub fn fingerprint_hex<T: Serialize + ?Sized>(kind: FingerprintKind, value: &T) -> String {
    fingerprint(kind, value).to_hex()
}
